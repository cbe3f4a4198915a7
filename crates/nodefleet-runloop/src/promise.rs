//! Single-assignment completion cells.
//!
//! A [`Promise`] is the loop-local future returned by asynchronous
//! operations (RPC calls, offloaded tasks). Its [`Resolver`] side is held by
//! whatever will produce the value. Resolution happens on the loop thread and
//! runs the registered continuation synchronously.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{error, warn};

struct PromiseCell<T> {
    label: String,
    value: Option<T>,
    resolved: bool,
    continuation: Option<Box<dyn FnOnce(T)>>,
    resolvers: Cell<usize>,
}

/// Consumer side of a pending value.
pub struct Promise<T> {
    cell: Rc<RefCell<PromiseCell<T>>>,
}

/// Producer side of a pending value.
///
/// Clones share the same cell. Only the first call to [`Resolver::resolve`]
/// takes effect. If every resolver is dropped before resolution, the promise
/// is abandoned and an error is logged.
pub struct Resolver<T> {
    cell: Rc<RefCell<PromiseCell<T>>>,
}

impl<T: 'static> Promise<T> {
    /// Create a pending promise and its resolver.
    pub fn pending(label: impl Into<String>) -> (Resolver<T>, Promise<T>) {
        let cell = Rc::new(RefCell::new(PromiseCell {
            label: label.into(),
            value: None,
            resolved: false,
            continuation: None,
            resolvers: Cell::new(1),
        }));
        (
            Resolver { cell: cell.clone() },
            Promise { cell },
        )
    }

    /// Create an already resolved promise.
    pub fn resolved(value: T) -> Promise<T> {
        let (resolver, promise) = Promise::pending("ready");
        resolver.resolve(value);
        promise
    }

    /// Check if a value has been delivered.
    pub fn is_resolved(&self) -> bool {
        self.cell.borrow().resolved
    }

    /// Take the value if it is available and no continuation consumed it.
    pub fn take(&self) -> Option<T> {
        self.cell.borrow_mut().value.take()
    }

    /// Register the continuation.
    ///
    /// Runs immediately if the value is already there.
    pub fn then<F>(self, f: F)
    where
        F: FnOnce(T) + 'static,
    {
        let ready = self.cell.borrow_mut().value.take();
        match ready {
            Some(value) => f(value),
            None => {
                let mut cell = self.cell.borrow_mut();
                if cell.resolved {
                    warn!("Promise {} value already taken, continuation dropped", cell.label);
                    return;
                }
                cell.continuation = Some(Box::new(f));
            }
        }
    }

    /// Transform the eventual value.
    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let label = self.cell.borrow().label.clone();
        let (resolver, promise) = Promise::pending(label);
        self.then(move |value| {
            resolver.resolve(f(value));
        });
        promise
    }
}

impl<T> Resolver<T> {
    /// Deliver the value. Returns `false` if the promise was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        let continuation = {
            let mut cell = self.cell.borrow_mut();
            if cell.resolved {
                warn!("Promise {} resolved twice, late value ignored", cell.label);
                return false;
            }
            cell.resolved = true;
            match cell.continuation.take() {
                Some(continuation) => Some((continuation, value)),
                None => {
                    cell.value = Some(value);
                    None
                }
            }
        };
        // The cell borrow is released before user code runs.
        if let Some((continuation, value)) = continuation {
            continuation(value);
        }
        true
    }

    /// Check if the promise has already been resolved.
    pub fn is_resolved(&self) -> bool {
        self.cell.borrow().resolved
    }

    /// Label given at creation.
    pub fn label(&self) -> String {
        self.cell.borrow().label.clone()
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        let cell = self.cell.borrow();
        cell.resolvers.set(cell.resolvers.get() + 1);
        drop(cell);
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let Ok(cell) = self.cell.try_borrow() else {
            return;
        };
        let remaining = cell.resolvers.get().saturating_sub(1);
        cell.resolvers.set(remaining);
        if remaining == 0 && !cell.resolved && !std::thread::panicking() {
            error!("Promise {} abandoned: every resolver dropped without a value", cell.label);
        }
    }
}

#[cfg(test)]
#[path = "promise_tests.rs"]
mod tests;
