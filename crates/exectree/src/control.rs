//! The control surface a thin RPC front-end drives.

use std::sync::Arc;

use crate::job::ExecJob;
use crate::tree::ExecTree;

const FEATURES: &[&str] = &["progress", "reschedule", "manualOverride", "cancel"];

/// Runtime control of a tree: progress reports, operator reschedules,
/// manual overrides, and cancellation.
///
/// Operations address jobs by name (subtree jobs included) and report
/// success as a bool rather than an error, matching what a transport layer
/// relays back to callers.
pub struct TreeControl {
    tree: Arc<ExecTree>,
}

impl TreeControl {
    /// Wraps a tree.
    pub fn new(tree: Arc<ExecTree>) -> Self {
        Self { tree }
    }

    fn find(&self, job_name: &str) -> Option<Arc<ExecJob>> {
        self.tree
            .rjobs()
            .into_iter()
            .find(|job| job.name() == job_name)
    }

    /// Updates a job's progress.
    ///
    /// Returns `false` for an unknown job or a value outside `[0, 100]`.
    pub fn progress(&self, job_name: &str, value: i32) -> bool {
        match self.find(job_name) {
            Some(job) => job.set_progress(value),
            None => {
                tracing::warn!(job = job_name, "progress report for unknown job");
                false
            }
        }
    }

    /// Resets and restarts a done job.
    ///
    /// Returns `false` when the job is unknown or not done.
    pub fn reschedule(&self, job_name: &str) -> bool {
        let Some(job) = self.find(job_name) else {
            return false;
        };
        if !job.reset() {
            tracing::warn!(job = job_name, "reschedule refused; job is not done");
            return false;
        }
        job.start();
        true
    }

    /// Marks a job successful without executing it (operator recovery).
    pub fn manual_override(&self, job_name: &str) -> bool {
        match self.find(job_name) {
            Some(job) => job.manual_override(),
            None => false,
        }
    }

    /// Cancels the tree.
    pub fn cancel(&self) -> bool {
        self.tree.cancel();
        true
    }

    /// True when the named control feature is available.
    pub fn supported(&self, feature: &str) -> bool {
        FEATURES.contains(&feature)
    }
}
