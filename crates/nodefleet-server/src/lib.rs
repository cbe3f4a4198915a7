//! # nodefleet Server
//!
//! Orchestration workflows and the server processes that host them.
//!
//! ## Processes
//!
//! - **db**: owns the device database, served as the `db` API
//! - **main**: owns the [`Orchestrator`], serves `cs` (clients) and `ns` (nodes)
//! - **blocking**: runs slow commands on an offload worker, served as `blocking`
//! - **hub**: TCP front door relaying client sessions to main
//!
//! ## Workflows
//!
//! - [`NodeRegistrar`]: pull, mount, store, update status, regenerate configs
//! - [`ImageMounter`]: mount/umount serialized by a [`MountLock`]
//! - [`ServiceRestarter`]: coalesced restarts of NFS and DHCP
//! - [`ExportsWriter`]: NFS exports regeneration

pub mod blocking;
pub mod db;
pub mod error;
pub mod exports;
pub mod lock;
pub mod mounter;
pub mod orchestrator;
pub mod process;
pub mod registrar;
pub mod restarter;
pub mod service;
pub mod status;

#[cfg(test)]
mod testing;

pub use blocking::{BlockingClient, BlockingExecutor, BlockingRequest, CommandOutput, RemoteBlocking};
pub use error::{ServerError, ServerResult};
pub use exports::{ExportEntry, ExportsWriter};
pub use lock::{MountGuard, MountLock};
pub use mounter::ImageMounter;
pub use orchestrator::Orchestrator;
pub use process::{build_manager, run_named};
pub use registrar::{NodeRegistrar, RegisterRequest};
pub use restarter::ServiceRestarter;
pub use status::{NodeState, NodeStatus, NodeStatusManager};
