//! Subcommand handlers for nodefleet.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use nodefleet_config::{ConfigValidator, FeatureSpec, NodefleetConfig};
use nodefleet_daemon::{send_signal_to_pid, DaemonError, DaemonSignal, Launcher, PidFile, ProcessContext};
use nodefleet_runloop::EventLoop;
use nodefleet_server::{build_manager, run_named};

/// Start the process group and supervise it until shutdown.
pub(crate) fn serve(config: NodefleetConfig, config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting nodefleet v{}", env!("CARGO_PKG_VERSION"));
    let validation = ConfigValidator::check(&config)?;
    for warning in &validation.warnings {
        warn!("Config: {}: {}", warning.path, warning.message);
    }

    let mut pid_file = PidFile::new(&config.daemon.pid_file);
    pid_file.try_acquire()?;

    let mut launcher = Launcher::current_exe()?;
    if let Some(path) = config_path {
        launcher = launcher.arg("--config").arg(path.display().to_string());
    }
    let ev = EventLoop::new("supervisor");
    let result = build_manager(&config, launcher).run(&ev);
    ev.shutdown();

    if let Err(e) = pid_file.release() {
        warn!("{}", e);
    }
    match result {
        Ok(()) => {
            info!("nodefleet stopped");
            Ok(())
        }
        Err(e) => {
            error!("nodefleet failed: {}", e);
            Err(e.into())
        }
    }
}

/// Run one server process with the channels the supervisor passed down.
pub(crate) fn process(config: NodefleetConfig, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let features = FeatureSpec::load_or_default(&config.features.spec_file)?;
    let ev = EventLoop::new(name);
    let ctx = ProcessContext::from_env(&ev, Rc::new(config))?.with_features(features);
    run_named(name, ctx, true)?;
    Ok(())
}

/// Ask the supervisor to stop, waiting up to the shutdown timeout.
pub(crate) fn stop(config: &NodefleetConfig, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let Some(pid) = running_pid(config)? else {
        println!("nodefleet is not running");
        return Ok(());
    };
    send_signal_to_pid(pid, DaemonSignal::Shutdown)?;

    let deadline = Instant::now() + config.daemon.shutdown_timeout();
    while PidFile::is_process_running(pid) {
        if Instant::now() >= deadline {
            if !force {
                return Err(format!("nodefleet (PID {}) did not stop in time", pid).into());
            }
            warn!("Killing nodefleet (PID {})", pid);
            kill(pid)?;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    println!("nodefleet stopped");
    Ok(())
}

/// Ask the supervisor to forward SIGHUP to every process.
pub(crate) fn reload(config: &NodefleetConfig) -> Result<(), Box<dyn std::error::Error>> {
    match running_pid(config)? {
        Some(pid) => {
            send_signal_to_pid(pid, DaemonSignal::Reload)?;
            println!("Reload requested (PID {})", pid);
            Ok(())
        }
        None => Err("nodefleet is not running".into()),
    }
}

pub(crate) fn status(config: &NodefleetConfig) -> Result<(), Box<dyn std::error::Error>> {
    match running_pid(config)? {
        Some(pid) => println!("nodefleet is running (PID {})", pid),
        None => println!("nodefleet is not running"),
    }
    Ok(())
}

pub(crate) fn check_config(config: &NodefleetConfig) -> Result<(), Box<dyn std::error::Error>> {
    let result = ConfigValidator::validate(config)?;
    for warning in &result.warnings {
        println!("warning: {}: {}", warning.path, warning.message);
    }
    for error in &result.errors {
        println!("error: {}: {}", error.path, error.message);
    }
    if result.is_valid() {
        println!("Configuration OK");
        Ok(())
    } else {
        Err(format!("{} configuration errors", result.errors.len()).into())
    }
}

/// PID of a live supervisor, if any.
fn running_pid(config: &NodefleetConfig) -> Result<Option<u32>, DaemonError> {
    let pid_file = PidFile::new(&config.daemon.pid_file);
    Ok(pid_file
        .read_pid()?
        .filter(|pid| PidFile::is_process_running(*pid)))
}

fn kill(pid: u32) -> Result<(), DaemonError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(|e| DaemonError::Signal {
        signal: "SIGKILL".to_string(),
        pid,
        reason: e.to_string(),
    })
}
