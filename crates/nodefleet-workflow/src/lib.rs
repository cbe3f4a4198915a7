//! # Nodefleet Workflow
//!
//! Resumable, single-pass pipelines of named steps sharing a typed
//! environment.
//!
//! A step runs synchronously on the event loop and advances the pipeline by
//! calling [`Workflow::next`], either before returning or later from an RPC
//! or offload completion. Between those two points the workflow is simply
//! parked: no thread, no stack frame, only the continuation that holds a
//! handle.
//!
//! ```
//! use nodefleet_workflow::{Step, Workflow};
//!
//! #[derive(Default)]
//! struct Env {
//!     trail: Vec<&'static str>,
//! }
//!
//! let wf = Workflow::new(
//!     "demo",
//!     vec![
//!         Step::new("first", |wf: &Workflow<Env>, env: &mut Env| {
//!             env.trail.push("first");
//!             wf.next();
//!         }),
//!         Step::new("second", |wf: &Workflow<Env>, env: &mut Env| {
//!             env.trail.push("second");
//!             wf.next();
//!         }),
//!     ],
//!     Env::default(),
//! );
//! wf.run();
//! assert!(wf.is_done());
//! assert_eq!(wf.with_env(|env| env.trail.clone()), Some(vec!["first", "second"]));
//! ```

mod leak;
mod step;
mod workflow;

pub use leak::{log_leak, LeakHook, LeakReport};
pub use step::{Step, StepFn};
pub use workflow::{Workflow, WorkflowState};
