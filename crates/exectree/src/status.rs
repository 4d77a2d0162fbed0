//! Status projection: per-job state snapshots for UI consumption.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobBody;
use crate::tree::ExecTree;

/// UI-facing snapshot of a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Status color, keyed off the job state (see
    /// [`JobState::color`](crate::JobState::color)).
    pub status: String,
    /// Progress in `[0, 100]`, `-1` when unknown.
    pub progress: i32,
    /// `run/len` position of the subtree iterator, for jobs hosting one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<String>,
    /// Wall-clock start of the most recent execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock end of the most recent execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

pub(crate) fn status_map(tree: &ExecTree) -> BTreeMap<String, JobStatus> {
    let mut status = BTreeMap::new();
    for job in tree.rjobs() {
        let iteration = match job.body() {
            JobBody::Subtree(subtree) => subtree
                .iterator()
                .map(|iterator| format!("{}/{}", iterator.run(), iterator.len())),
            _ => None,
        };
        status.insert(
            job.name().to_string(),
            JobStatus {
                status: job.state().color().to_string(),
                progress: job.progress(),
                iteration,
                started_at: job.started_at(),
                finished_at: job.finished_at(),
            },
        );
    }
    status
}

pub(crate) fn status_json(tree: &ExecTree) -> serde_json::Result<String> {
    serde_json::to_string(&status_map(tree))
}
