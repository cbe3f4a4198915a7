//! OS signal forwarding into an event loop.
//!
//! Signals are received on a helper thread running a small `tokio` runtime
//! and forwarded as tokens through a wakeup pipe, so the loop handles them
//! as ordinary events between two dispatches.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use nodefleet_runloop::{wakeup_pipe, EventLoop, SourceId, WakeupSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::DaemonError;

/// Signal type for daemon control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Graceful shutdown (SIGTERM, SIGINT).
    Shutdown,
    /// Re-read the feature spec (SIGHUP).
    Reload,
}

impl DaemonSignal {
    fn token(self) -> u64 {
        match self {
            DaemonSignal::Shutdown => 1,
            DaemonSignal::Reload => 2,
        }
    }

    fn from_token(token: u64) -> Option<Self> {
        match token {
            1 => Some(DaemonSignal::Shutdown),
            2 => Some(DaemonSignal::Reload),
            _ => None,
        }
    }
}

impl std::fmt::Display for DaemonSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonSignal::Shutdown => write!(f, "SHUTDOWN"),
            DaemonSignal::Reload => write!(f, "RELOAD"),
        }
    }
}

/// Delivers [`DaemonSignal`]s to a callback on the loop thread.
///
/// Dropping the handler stops the helper thread and removes its source.
pub struct SignalHandler {
    ev: EventLoop,
    sender: WakeupSender,
    source: SourceId,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SignalHandler {
    /// Register the forwarding pipe with `ev` without listening to OS
    /// signals. Signals can still be injected with [`request`](Self::request).
    pub fn detached<F>(ev: &EventLoop, on_signal: F) -> Result<Self, DaemonError>
    where
        F: FnMut(&EventLoop, DaemonSignal) + 'static,
    {
        let (sender, source) = Self::register(ev, on_signal)?;
        Ok(Self {
            ev: ev.clone(),
            sender,
            source,
            stop: None,
            thread: None,
        })
    }

    /// Register the forwarding pipe and start listening to SIGTERM, SIGINT
    /// and SIGHUP. Returns once the OS handlers are installed.
    #[cfg(unix)]
    pub fn install<F>(ev: &EventLoop, on_signal: F) -> Result<Self, DaemonError>
    where
        F: FnMut(&EventLoop, DaemonSignal) + 'static,
    {
        let mut handler = Self::detached(ev, on_signal)?;
        let sender = handler.sender.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("{}-signals", ev.name()))
            .spawn(move || listen(sender, stop_rx, ready_tx))
            .map_err(|e| DaemonError::SignalSetup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(DaemonError::SignalSetup(reason)),
            Err(_) => {
                return Err(DaemonError::SignalSetup(
                    "signal thread exited during setup".to_string(),
                ))
            }
        }
        handler.stop = Some(stop_tx);
        handler.thread = Some(thread);
        info!("OS signal handlers installed (SIGTERM, SIGINT, SIGHUP)");
        Ok(handler)
    }

    fn register<F>(ev: &EventLoop, mut on_signal: F) -> Result<(WakeupSender, SourceId), DaemonError>
    where
        F: FnMut(&EventLoop, DaemonSignal) + 'static,
    {
        let (sender, source) = wakeup_pipe("signals", move |ev, token| {
            match DaemonSignal::from_token(token) {
                Some(signal) => {
                    debug!("Dispatching signal {}", signal);
                    on_signal(ev, signal);
                }
                None => warn!("Unknown signal token {}", token),
            }
            Ok(())
        })?;
        let id = ev.register(source);
        Ok((sender, id))
    }

    /// Inject a signal as if the OS had delivered it.
    pub fn request(&self, signal: DaemonSignal) -> Result<(), DaemonError> {
        self.sender.notify(signal.token())?;
        Ok(())
    }

    /// Thread-safe handle injecting signals.
    pub fn sender(&self) -> WakeupSender {
        self.sender.clone()
    }

    /// Check if OS signals are being listened to.
    pub fn is_listening(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Signal thread panicked");
            }
        }
        self.ev.remove(self.source);
    }
}

#[cfg(unix)]
fn listen(
    sender: WakeupSender,
    mut stop: oneshot::Receiver<()>,
    ready: std_mpsc::Sender<Result<(), String>>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    runtime.block_on(async move {
        let streams = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        );
        let (mut sigterm, mut sigint, mut sighup) = match streams {
            (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                let _ = ready.send(Err(e.to_string()));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        loop {
            let signal = tokio::select! {
                _ = &mut stop => break,
                Some(()) = sigterm.recv() => {
                    info!("Received SIGTERM");
                    DaemonSignal::Shutdown
                }
                Some(()) = sigint.recv() => {
                    info!("Received SIGINT");
                    DaemonSignal::Shutdown
                }
                Some(()) = sighup.recv() => {
                    info!("Received SIGHUP - requesting feature reload");
                    DaemonSignal::Reload
                }
            };
            if let Err(e) = sender.notify(signal.token()) {
                warn!("Event loop gone, stopping signal forwarding: {}", e);
                break;
            }
        }
    });
}

/// Send a signal to a running daemon process.
#[cfg(unix)]
pub fn send_signal_to_pid(pid: u32, signal: DaemonSignal) -> Result<(), DaemonError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let os_signal = match signal {
        DaemonSignal::Shutdown => Signal::SIGTERM,
        DaemonSignal::Reload => Signal::SIGHUP,
    };

    kill(Pid::from_raw(pid as i32), os_signal).map_err(|e| DaemonError::Signal {
        signal: signal.to_string(),
        pid,
        reason: e.to_string(),
    })?;

    info!("Sent {} to PID {}", signal, pid);
    Ok(())
}

#[cfg(test)]
#[path = "signal_tests.rs"]
mod tests;
