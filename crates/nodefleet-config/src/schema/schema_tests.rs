use super::*;

use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_config_default() {
    let config = NodefleetConfig::default();
    assert_eq!(config.hub.addr(), "127.0.0.1:4433");
    assert!(config.daemon.auto_restart);
    assert_eq!(config.rpc.call_timeout(), Some(Duration::from_secs(30)));
    assert_eq!(config.blocking.task_timeout_secs, 0);
}

#[test]
fn test_daemon_duration_getters() {
    let daemon = DaemonConfig::with_pid_file(PathBuf::from("/tmp/nf.pid"));
    assert_eq!(daemon.pid_file, PathBuf::from("/tmp/nf.pid"));
    assert_eq!(daemon.restart_window(), Duration::from_secs(300));
    assert_eq!(daemon.restart_delay(), Duration::from_secs(1));
    assert_eq!(daemon.shutdown_timeout(), Duration::from_secs(10));
}

#[test]
fn test_zero_timeouts_mean_none() {
    let rpc = RpcConfig {
        call_timeout_secs: 0,
        blocking_call_timeout_secs: 0,
        serialize_blocking: true,
    };
    assert_eq!(rpc.call_timeout(), None);
    assert_eq!(rpc.blocking_call_timeout(), None);
}

#[test]
fn test_image_paths_are_flattened() {
    let images = ImagesConfig::default();
    assert_eq!(
        images.mount_point("library/alpine:3.19"),
        PathBuf::from("/var/lib/nodefleet/mnt/library_alpine_3.19")
    );
    assert_eq!(
        images.image_path("debian"),
        PathBuf::from("/var/lib/nodefleet/images/debian")
    );
    assert_eq!(images.lock_retry(), Duration::from_millis(50));
}

#[test]
fn test_services_defaults() {
    let services = ServicesConfig::default();
    assert_eq!(services.exports_file, PathBuf::from("/etc/exports"));
    assert_eq!(services.nfs_restart_command, vec!["exportfs", "-ra"]);
    assert_eq!(services.restart_cooldown(), Duration::from_secs(3));
}

#[test]
fn test_partial_section_keeps_defaults() {
    let config: NodefleetConfig = toml::from_str(
        r#"
        [images]
        lock_retry_ms = 10
        "#,
    )
    .unwrap();
    assert_eq!(config.images.lock_retry_ms, 10);
    assert_eq!(config.images.umount_command, vec!["umount"]);
}

#[test]
fn test_serialization_round_trip_keeps_sections() {
    let config = NodefleetConfig::default();
    let json = serde_json::to_value(&config).unwrap();
    for section in ["daemon", "rpc", "blocking", "images", "services", "hub", "features"] {
        assert!(json.get(section).is_some(), "missing section {}", section);
    }
}
