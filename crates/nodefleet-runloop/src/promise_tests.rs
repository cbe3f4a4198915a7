use super::*;

#[test]
fn test_value_before_continuation() {
    let (resolver, promise) = Promise::pending("test");
    assert!(!promise.is_resolved());

    assert!(resolver.resolve(7));
    assert!(promise.is_resolved());

    let seen = Rc::new(Cell::new(0));
    let seen_clone = seen.clone();
    promise.then(move |v| seen_clone.set(v));
    assert_eq!(seen.get(), 7);
}

#[test]
fn test_continuation_before_value() {
    let (resolver, promise) = Promise::pending("test");
    let seen = Rc::new(Cell::new(0));
    let seen_clone = seen.clone();
    promise.then(move |v| seen_clone.set(v));

    assert_eq!(seen.get(), 0);
    resolver.resolve(42);
    assert_eq!(seen.get(), 42);
}

#[test]
fn test_second_resolve_is_ignored() {
    let (resolver, promise) = Promise::pending("test");
    let other = resolver.clone();

    assert!(resolver.resolve("first"));
    assert!(!other.resolve("second"));
    assert_eq!(promise.take(), Some("first"));
    assert_eq!(promise.take(), None);
}

#[test]
fn test_map() {
    let (resolver, promise) = Promise::pending("test");
    let doubled = promise.map(|v: u32| v * 2);

    resolver.resolve(21);
    assert_eq!(doubled.take(), Some(42));
}

#[test]
fn test_resolved_constructor() {
    let promise = Promise::resolved("done");
    assert!(promise.is_resolved());
    assert_eq!(promise.take(), Some("done"));
}

#[test]
fn test_continuation_may_resolve_another_promise() {
    let (first_resolver, first) = Promise::pending("first");
    let (second_resolver, second) = Promise::pending("second");

    first.then(move |v: u32| {
        second_resolver.resolve(v + 1);
    });
    first_resolver.resolve(1);

    assert_eq!(second.take(), Some(2));
}
