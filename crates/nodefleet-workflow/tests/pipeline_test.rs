//! Workflows driven by event-loop completions.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nodefleet_runloop::EventLoop;
use nodefleet_workflow::{Step, Workflow, WorkflowState};

#[derive(Default)]
struct Mounts {
    log: Vec<String>,
    mounted: Vec<&'static str>,
}

/// A step that completes after `delay` on the loop.
fn delayed(ev: &EventLoop, name: &'static str, delay_ms: u64) -> Step<Mounts> {
    let ev = ev.clone();
    Step::new(name, move |wf: &Workflow<Mounts>, env: &mut Mounts| {
        env.log.push(format!("start {}", name));
        let wf = wf.clone();
        ev.plan_after(Duration::from_millis(delay_ms), move |_| {
            wf.next_with(move |env: &mut Mounts| env.log.push(format!("end {}", name)));
        });
    })
}

#[test]
fn test_async_steps_resume_from_timers() {
    let ev = EventLoop::new("workflow");
    let wf = Workflow::new(
        "mount",
        vec![
            delayed(&ev, "pull", 20),
            delayed(&ev, "mount", 5),
            delayed(&ev, "export", 1),
        ],
        Mounts::default(),
    );
    wf.run();
    assert_eq!(wf.state(), WorkflowState::Pending);

    ev.run().unwrap();
    assert!(wf.is_done());
    let log = wf.with_env(|env| env.log.clone()).unwrap();
    assert_eq!(
        log,
        vec!["start pull", "end pull", "start mount", "end mount", "start export", "end export"]
    );
}

#[test]
fn test_parallel_unmount_joins_before_continuing() {
    let ev = EventLoop::new("workflow");
    let images = [("alpine", 30), ("debian", 5), ("busybox", 15)];

    let branches: Vec<Step<Mounts>> = images
        .iter()
        .map(|&(image, delay)| {
            let ev = ev.clone();
            Step::new(format!("umount {}", image), move |wf: &Workflow<Mounts>, _env: &mut Mounts| {
                let wf = wf.clone();
                ev.plan_after(Duration::from_millis(delay), move |_| {
                    wf.update_env(move |env: &mut Mounts| env.mounted.push(image));
                    wf.next();
                });
            })
        })
        .collect();

    let seen_at_join = Rc::new(RefCell::new(Vec::new()));
    let seen = seen_at_join.clone();
    let wf = Workflow::new(
        "umount-all",
        vec![
            Step::new("fan-out", move |wf: &Workflow<Mounts>, _env: &mut Mounts| {
                wf.insert_parallel_steps(branches.clone());
                wf.next();
            }),
            Step::new("after", move |wf: &Workflow<Mounts>, env: &mut Mounts| {
                *seen.borrow_mut() = env.mounted.clone();
                wf.next();
            }),
        ],
        Mounts::default(),
    );
    wf.run();
    ev.run().unwrap();

    assert!(wf.is_done());
    // Completion order follows the delays; all three land before "after".
    assert_eq!(*seen_at_join.borrow(), vec!["debian", "busybox", "alpine"]);
}

#[test]
fn test_deadline_interrupts_and_invalidates_completion() {
    let ev = EventLoop::new("workflow");
    let completion = Rc::new(RefCell::new(None));
    let slot = completion.clone();
    let deadline_ev = ev.clone();
    let wf = Workflow::new(
        "probe",
        vec![
            Step::new("wait-reply", move |wf: &Workflow<Mounts>, _env: &mut Mounts| {
                // The slow reply.
                let late = wf.clone();
                let reply = deadline_ev.plan_after(Duration::from_millis(200), move |_| late.next());
                // The deadline cancels the reply and aborts the workflow.
                let timed_out = wf.clone();
                *slot.borrow_mut() = Some(deadline_ev.plan_after(Duration::from_millis(10), move |_| {
                    reply.cancel();
                    timed_out.update_env(|env: &mut Mounts| env.log.push("timeout".into()));
                    timed_out.interrupt();
                }));
            }),
            Step::new("never", |wf: &Workflow<Mounts>, env: &mut Mounts| {
                env.log.push("never".into());
                wf.next();
            }),
        ],
        Mounts::default(),
    );
    let ended = Rc::new(RefCell::new(0));
    let count = ended.clone();
    wf.on_end(move |_| *count.borrow_mut() += 1);

    let started = Instant::now();
    wf.run();
    ev.run().unwrap();

    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(wf.is_interrupted());
    assert_eq!(*ended.borrow(), 1);
    assert_eq!(wf.with_env(|env| env.log.clone()).unwrap(), vec!["timeout"]);
    assert!(!completion.borrow().as_ref().unwrap().is_valid());
}

#[test]
fn test_chained_workflows_on_loop() {
    let ev = EventLoop::new("workflow");
    let pull = Workflow::new("pull", vec![delayed(&ev, "pull", 10)], Mounts::default());
    let register = Workflow::new("register", vec![delayed(&ev, "register", 1)], Mounts::default());

    register.continue_after(&pull);
    pull.run();
    assert_eq!(register.state(), WorkflowState::Pending);

    ev.run().unwrap();
    assert!(pull.is_done());
    assert!(register.is_done());
}
