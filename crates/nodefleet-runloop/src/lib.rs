//! # nodefleet RunLoop
//!
//! Single-threaded cooperative event loop used inside every nodefleet
//! process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EventLoop                           │
//! │                                                             │
//! │   sources (fd)  ──poll(2)──►  one on_ready() per source     │
//! │   timed events  ──heap────►   fire due events, oldest first │
//! │   WakeupSource  ◄──tokens──   worker / signal threads       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! One callback runs at a time. Callbacks never block: slow work is handed
//! to another thread, which reports completion through a [`WakeupSender`].
//! Asynchronous results are delivered through [`Promise`]s.
//!
//! ## Key Components
//!
//! - [`EventLoop`]: the reactor handle
//! - [`EventSource`]: anything with a pollable descriptor
//! - [`TimerHandle`]: a planned one-shot or repeating timed event
//! - [`Promise`] / [`Resolver`]: single-assignment completion cells
//! - [`wakeup_pipe`]: cross-thread wakeups
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use nodefleet_runloop::EventLoop;
//!
//! let ev = EventLoop::new("main");
//! ev.plan_after(Duration::from_millis(10), |ev| {
//!     tracing::info!("{}: timer fired", ev.name());
//! });
//! ev.run().unwrap();
//! ```

mod error;
mod metrics;
mod pipe;
mod promise;
mod run_loop;
mod run_loop_execution;
mod source;
mod timer;

pub use error::{RunLoopError, RunLoopResult};
pub use metrics::{LoopMetrics, MetricsSnapshot};
pub use pipe::{wakeup_pipe, TokenHandler, WakeupSender, WakeupSource};
pub use promise::{Promise, Resolver};
pub use run_loop::{EventLoop, RunOutcome, SharedSource};
pub use source::{EventSource, SourceId, SourceStatus};
pub use timer::{TimerCallback, TimerHandle};
