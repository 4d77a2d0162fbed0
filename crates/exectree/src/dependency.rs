//! Dependency edges between jobs.

use std::fmt;
use std::sync::Arc;

use crate::job::ExecJob;
use crate::state::JobState;

pub(crate) const DEFINED_EDGE_COLOR: &str = "deepskyblue";
pub(crate) const UNDEFINED_EDGE_COLOR: &str = "palegreen";

/// A directed edge: `child` may start once `parent` has reached `state`.
///
/// The required state defaults to [`JobState::Success`] but may be
/// [`JobState::Failed`] to trigger an alternate branch.
pub struct ExecDependency {
    parent: Arc<ExecJob>,
    child: Arc<ExecJob>,
    state: JobState,
    dcolor: String,
    ucolor: String,
}

impl ExecDependency {
    pub(crate) fn new(parent: Arc<ExecJob>, child: Arc<ExecJob>, state: JobState) -> Self {
        Self::with_colors(
            parent,
            child,
            state,
            DEFINED_EDGE_COLOR.to_string(),
            UNDEFINED_EDGE_COLOR.to_string(),
        )
    }

    pub(crate) fn with_colors(
        parent: Arc<ExecJob>,
        child: Arc<ExecJob>,
        state: JobState,
        dcolor: String,
        ucolor: String,
    ) -> Self {
        Self {
            parent,
            child,
            state,
            dcolor,
            ucolor,
        }
    }

    /// The job that must reach the required state first.
    pub fn parent(&self) -> &Arc<ExecJob> {
        &self.parent
    }

    /// The job released by this edge.
    pub fn child(&self) -> &Arc<ExecJob> {
        &self.child
    }

    /// The state the parent must reach to release the child.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// True when the parent has a real body; used only for rendering.
    pub fn is_defined(&self) -> bool {
        self.parent.is_defined()
    }

    pub(crate) fn dcolor(&self) -> &str {
        &self.dcolor
    }

    pub(crate) fn ucolor(&self) -> &str {
        &self.ucolor
    }

    /// Waits until the parent's latch for the required state is set.
    pub async fn wait(&self) {
        self.parent.wait_state(self.state).await;
    }
}

impl fmt::Debug for ExecDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ExecDependency {}-{}>",
            self.parent.name(),
            self.child.name()
        )
    }
}
