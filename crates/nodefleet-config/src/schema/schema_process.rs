//! Process-level configuration (daemon supervision, RPC, blocking worker, hub).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::default_true;

/// Supervision of the server processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to PID file.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Directory for rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Restart a child process that exits unexpectedly.
    #[serde(default = "default_true")]
    pub auto_restart: bool,

    /// Maximum restarts of one process within the window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Time window for counting restarts (in seconds).
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Delay before restarting a process (in seconds).
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    /// Time children get to exit after SIGTERM (in seconds).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_pid_file() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join("nodefleet").join("nodefleet.pid"))
        .unwrap_or_else(|| PathBuf::from("/run/nodefleet/nodefleet.pid"))
}

fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".nodefleet").join("logs"))
        .unwrap_or_else(|| PathBuf::from("/var/log/nodefleet"))
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window() -> u64 {
    300
}

fn default_restart_delay() -> u64 {
    1
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_dir: default_log_dir(),
            auto_restart: true,
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            restart_delay_secs: default_restart_delay(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl DaemonConfig {
    /// Create a daemon config with the given PID file path.
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        Self {
            pid_file,
            ..Default::default()
        }
    }

    /// Get the restart window as a Duration.
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    /// Get the restart delay as a Duration.
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    /// Get the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Inter-process call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Deadline for calls to the database and hub forwarding (0 = none).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Deadline for calls to the blocking process (0 = none).
    #[serde(default = "default_blocking_call_timeout")]
    pub blocking_call_timeout_secs: u64,

    /// Keep at most one call in flight toward the blocking process.
    #[serde(default = "default_true")]
    pub serialize_blocking: bool,
}

fn default_call_timeout() -> u64 {
    30
}

fn default_blocking_call_timeout() -> u64 {
    900
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            blocking_call_timeout_secs: default_blocking_call_timeout(),
            serialize_blocking: true,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        optional_secs(self.call_timeout_secs)
    }

    pub fn blocking_call_timeout(&self) -> Option<Duration> {
        optional_secs(self.blocking_call_timeout_secs)
    }
}

/// Blocking worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingConfig {
    /// Worker-side limit on one task (0 = none).
    #[serde(default)]
    pub task_timeout_secs: u64,

    /// Warn about tasks slower than this.
    #[serde(default = "default_slow_task")]
    pub slow_task_secs: u64,

    /// Default limit for shell commands.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Shell used for `RunCommand` requests.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_slow_task() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    600
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: 0,
            slow_task_secs: default_slow_task(),
            command_timeout_secs: default_command_timeout(),
            shell: default_shell(),
        }
    }
}

impl BlockingConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        optional_secs(self.command_timeout_secs)
    }
}

/// Client-facing front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Connections beyond this are refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_hub_port() -> u16 {
    4433
}

fn default_max_connections() -> usize {
    64
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
            port: default_hub_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl HubConfig {
    /// Socket address string to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}
