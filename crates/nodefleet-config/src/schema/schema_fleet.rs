//! Fleet resources: images, managed services, feature spec.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Image store and mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Where pulled images are kept.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Parent directory of image mount points.
    #[serde(default = "default_mount_dir")]
    pub mount_dir: PathBuf,

    /// Advisory lock serializing mount and unmount.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Command pulling an image; the image name is appended.
    #[serde(default = "default_pull_command")]
    pub pull_command: Vec<String>,

    /// Command mounting an image; source and target are appended.
    #[serde(default = "default_mount_command")]
    pub mount_command: Vec<String>,

    /// Command unmounting; the target is appended.
    #[serde(default = "default_umount_command")]
    pub umount_command: Vec<String>,

    /// Poll interval while the mount lock is held elsewhere.
    #[serde(default = "default_lock_retry")]
    pub lock_retry_ms: u64,

    /// Give up acquiring the mount lock after this long.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/nodefleet/images")
}

fn default_mount_dir() -> PathBuf {
    PathBuf::from("/var/lib/nodefleet/mnt")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/lib/nodefleet/images.lock")
}

fn default_pull_command() -> Vec<String> {
    vec!["docker".to_string(), "pull".to_string()]
}

fn default_mount_command() -> Vec<String> {
    vec!["mount".to_string(), "--bind".to_string()]
}

fn default_umount_command() -> Vec<String> {
    vec!["umount".to_string()]
}

fn default_lock_retry() -> u64 {
    50
}

fn default_lock_timeout() -> u64 {
    60
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            mount_dir: default_mount_dir(),
            lock_file: default_lock_file(),
            pull_command: default_pull_command(),
            mount_command: default_mount_command(),
            umount_command: default_umount_command(),
            lock_retry_ms: default_lock_retry(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

impl ImagesConfig {
    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Mount point of an image.
    pub fn mount_point(&self, image: &str) -> PathBuf {
        self.mount_dir.join(image.replace(['/', ':'], "_"))
    }

    /// Stored location of an image.
    pub fn image_path(&self, image: &str) -> PathBuf {
        self.store_dir.join(image.replace(['/', ':'], "_"))
    }
}

/// Services restarted after configuration changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Generated NFS exports file.
    #[serde(default = "default_exports_file")]
    pub exports_file: PathBuf,

    #[serde(default = "default_nfs_restart")]
    pub nfs_restart_command: Vec<String>,

    #[serde(default = "default_dhcp_restart")]
    pub dhcp_restart_command: Vec<String>,

    /// Minimum time between two restarts of one service.
    #[serde(default = "default_cooldown")]
    pub restart_cooldown_secs: u64,
}

fn default_exports_file() -> PathBuf {
    PathBuf::from("/etc/exports")
}

fn default_nfs_restart() -> Vec<String> {
    vec!["exportfs".to_string(), "-ra".to_string()]
}

fn default_dhcp_restart() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "restart".to_string(),
        "isc-dhcp-server".to_string(),
    ]
}

fn default_cooldown() -> u64 {
    3
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            exports_file: default_exports_file(),
            nfs_restart_command: default_nfs_restart(),
            dhcp_restart_command: default_dhcp_restart(),
            restart_cooldown_secs: default_cooldown(),
        }
    }
}

impl ServicesConfig {
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }
}

/// Location of the reloadable feature spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_spec_file")]
    pub spec_file: PathBuf,
}

fn default_spec_file() -> PathBuf {
    PathBuf::from("/etc/nodefleet/features.toml")
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            spec_file: default_spec_file(),
        }
    }
}
