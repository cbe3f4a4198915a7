//! # Nodefleet Workqueue
//!
//! Blocking-task offload for single-threaded event loops.
//!
//! A loop that must not block (image pulls, mounts, shell commands) hands
//! the work to an [`Offload`]. The offload owns one worker thread; tasks
//! run there one at a time and each completion resolves a
//! [`Promise`](nodefleet_runloop::Promise) back on the loop thread.
//!
//! ## Features
//!
//! - FIFO execution on a dedicated thread with its own `tokio` runtime
//! - Handler panics become [`TaskFailure::Panicked`]; the worker survives
//! - Loop-side deadlines via [`Offload::submit_with_timeout`]
//! - Graceful shutdown that drains the queue

pub mod config;
pub mod error;
pub mod offload;
pub mod task;
pub mod worker;

pub use config::QueueConfig;
pub use error::{QueueError, QueueResult, TaskFailure, TaskResult};
pub use offload::Offload;
pub use task::{BlockingHandler, BlockingTask, TaskId, TaskInfo};
pub use worker::{Worker, WorkerStats};
