use super::*;

use tempfile::TempDir;

use crate::registrar::RegisterRequest;
use crate::testing::{loop_db, run_until, test_config, FakeBlocking, LoopDb};

fn orchestrator(ev: &EventLoop, dir: &TempDir) -> (Orchestrator, Rc<FakeBlocking>, LoopDb) {
    let blocking = FakeBlocking::new(ev, Duration::from_millis(1));
    let store = loop_db(ev);
    let config = test_config(dir.path());
    let orch = Orchestrator::new(ev, &config, store.client.clone(), blocking.clone());
    (orch, blocking, store)
}

#[test]
fn test_manual_pull_feature_toggles_registrar() {
    let dir = TempDir::new().unwrap();
    let ev = EventLoop::new("orchestrator");
    let (orch, _, _store) = orchestrator(&ev, &dir);
    assert!(orch.registrar().auto_pull());

    let spec = FeatureSpec::parse("[features]\nmanual_image_pull = true\n").unwrap();
    orch.apply_features(&spec);
    assert!(!orch.registrar().auto_pull());
    assert_eq!(orch.stats().features, vec![MANUAL_IMAGE_PULL.to_string()]);

    orch.apply_features(&FeatureSpec::default());
    assert!(orch.registrar().auto_pull());
    assert!(orch.stats().features.is_empty());
}

#[test]
fn test_run_command_goes_through_blocking_worker() {
    let dir = TempDir::new().unwrap();
    let ev = EventLoop::new("orchestrator");
    let (orch, blocking, _store) = orchestrator(&ev, &dir);

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    orch.run_command(vec!["uptime".to_string()], Some(5))
        .then(move |r| *slot.borrow_mut() = Some(r));
    let check = result.clone();
    run_until(&ev, move || check.borrow().is_some());

    assert!(result.borrow_mut().take().unwrap().is_ok());
    assert_eq!(
        blocking.requests(),
        vec![BlockingRequest::RunCommand {
            argv: vec!["uptime".to_string()],
            timeout_secs: Some(5),
        }]
    );
}

#[test]
fn test_stats_after_registration() {
    let dir = TempDir::new().unwrap();
    let ev = EventLoop::new("orchestrator");
    let (orch, _, _store) = orchestrator(&ev, &dir);

    let wf = orch
        .registrar()
        .register(RegisterRequest {
            mac: "aa:00:00:00:00:01".to_string(),
            ip: Some("10.1.0.1".to_string()),
            image: Some("alpine".to_string()),
        })
        .unwrap();
    let check = wf.clone();
    run_until(&ev, move || check.is_done());

    let stats = orch.stats();
    assert_eq!(stats.nodes, 1);
    assert_eq!(stats.registered, 1);
    assert!(stats.registering.is_empty());
    assert_eq!(stats.mounted, vec!["alpine".to_string()]);

    let nfs = orch.nfs().clone();
    run_until(&ev, move || nfs.stats().restarts == 1);
    orch.shutdown();
}

#[test]
fn test_shutdown_cancels_sweeper() {
    let dir = TempDir::new().unwrap();
    let ev = EventLoop::new("orchestrator");
    let (orch, _, _store) = orchestrator(&ev, &dir);
    let before = ev.pending_timers();

    orch.start_sweeper();
    assert_eq!(ev.pending_timers(), before + 1);
    orch.start_sweeper();
    assert_eq!(ev.pending_timers(), before + 1);

    orch.shutdown();
    assert_eq!(ev.pending_timers(), before);
}
