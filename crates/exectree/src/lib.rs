#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Dependency-driven execution engine for DAGs of shell-script jobs.
//!
//! An [`ExecTree`] owns a set of [`ExecJob`]s connected by [`ExecDependency`]
//! edges. [`ExecTree::run`] spawns one cooperative task per job; each task
//! waits for its parent dependencies, reserves the [`ExecResource`]s the job
//! declares, executes the job body (a child process, or an embedded subtree
//! that is re-run once per [`ExecIter`] argument) and publishes its terminal
//! state through per-state latches. Trees serialize to a versioned XML
//! document, render as Graphviz DOT, and project their live state as JSON.
//!
//! The engine is designed for a current-thread tokio runtime (one OS thread
//! multiplexing all job tasks) but is equally correct on the multi-thread
//! runtime.

pub mod control;
pub mod dependency;
pub mod error;
pub mod iter;
pub mod job;
mod render;
pub mod resource;
pub mod state;
pub mod status;
pub mod tree;
mod xml;

pub use control::TreeControl;
pub use dependency::ExecDependency;
pub use error::ExecError;
pub use iter::ExecIter;
pub use job::{ExecJob, JobBody, UNDEF_JOB};
pub use resource::ExecResource;
pub use state::JobState;
pub use status::JobStatus;
pub use tree::{ExecTree, IterationPolicy, TreeConfig};
