//! PID file management for the supervisor process.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::DaemonError;

/// PID file guarding against a second supervisor instance.
///
/// The file is removed when the guard is dropped, if this guard wrote it.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    locked: bool,
}

impl PidFile {
    /// Create a new PID file manager.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            locked: false,
        }
    }

    /// Get the PID file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a PID file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Check if this guard wrote the file.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Read the PID from the file.
    pub fn read_pid(&self) -> Result<Option<u32>, DaemonError> {
        let read_err = |reason: String| DaemonError::PidFileRead {
            path: self.path.clone(),
            reason,
        };
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(read_err(e.to_string())),
        };
        contents
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| read_err(format!("Invalid PID format: {}", e)))
    }

    /// Write the current process PID, failing if a live process owns the
    /// file. A stale file is replaced.
    pub fn try_acquire(&mut self) -> Result<(), DaemonError> {
        if let Some(existing) = self.read_pid()? {
            if existing != std::process::id() && Self::is_process_running(existing) {
                return Err(DaemonError::AlreadyRunning {
                    path: self.path.clone(),
                    pid: existing,
                });
            }
            warn!(
                "Replacing stale PID file (PID {} not running): {}",
                existing,
                self.path.display()
            );
            self.remove_file()?;
        }
        self.write_pid_value(std::process::id())
    }

    /// Write a specific PID value to the file.
    pub fn write_pid_value(&mut self, pid: u32) -> Result<(), DaemonError> {
        let create_err = |reason: String| DaemonError::PidFileCreation {
            path: self.path.clone(),
            reason,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| create_err(format!("Failed to create parent directory: {}", e)))?;
        }

        // create_new: two supervisors racing past the stale check cannot
        // both win.
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| create_err(e.to_string()))?;
        writeln!(file, "{}", pid).map_err(|e| create_err(e.to_string()))?;

        self.locked = true;
        info!("PID file created: {} (PID: {})", self.path.display(), pid);
        Ok(())
    }

    /// Remove the PID file if this guard wrote it.
    pub fn release(&mut self) -> Result<(), DaemonError> {
        if !self.locked {
            return Ok(());
        }
        self.remove_file()?;
        self.locked = false;
        info!("PID file removed: {}", self.path.display());
        Ok(())
    }

    fn remove_file(&self) -> Result<(), DaemonError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("PID file already gone: {}", self.path.display());
                Ok(())
            }
            Err(e) => Err(DaemonError::PidFileRemoval {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Check if a process with the given PID exists.
    #[cfg(unix)]
    pub fn is_process_running(pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Signal 0 probes for existence; EPERM means it exists but is not ours.
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    pub fn is_process_running(_pid: u32) -> bool {
        true
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to remove PID file on drop: {}", e);
        }
    }
}

#[cfg(test)]
#[path = "pid_tests.rs"]
mod tests;
