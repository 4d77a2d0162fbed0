//! Job states and the per-state latch block.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ExecError;

/// Execution state of a job.
///
/// The numeric values are stable: they appear in serialized tree documents
/// and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    /// Not yet started.
    Idle = 0,
    /// Body currently executing.
    Running = 1,
    /// Body finished with exit code 0, or the subtree run succeeded.
    Success = 2,
    /// Body finished with a non-zero exit code, or acquisition gave up.
    Failed = 3,
    /// Cancelled before it could run.
    Cancelled = 4,
    /// Placeholder with no real body; participates in dependencies only.
    Undef = 5,
    /// Returned to a startable state by an explicit reset.
    Reset = 6,
    /// Waiting on resource acquisition.
    Blocked = 7,
}

pub(crate) const STATE_COUNT: usize = 8;

impl JobState {
    /// Every state, in numeric order.
    pub const ALL: [JobState; STATE_COUNT] = [
        JobState::Idle,
        JobState::Running,
        JobState::Success,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Undef,
        JobState::Reset,
        JobState::Blocked,
    ];

    /// Decodes a serialized state value.
    pub fn from_value(value: i64) -> Result<Self, ExecError> {
        JobState::ALL
            .into_iter()
            .find(|state| state.value() as i64 == value)
            .ok_or(ExecError::UnknownState(value))
    }

    /// The stable numeric value used in serialized documents.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Terminal states: no further transitions without an explicit reset.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Cancelled | JobState::Undef
        )
    }

    /// States that count as success for tree-level aggregation.
    pub fn is_success_like(self) -> bool {
        matches!(self, JobState::Success | JobState::Undef)
    }

    /// States from which a job may still be (re)configured and started.
    ///
    /// `Reset` is treated like `Idle` here.
    pub fn is_prestart(self) -> bool {
        matches!(
            self,
            JobState::Idle | JobState::Undef | JobState::Blocked | JobState::Reset
        )
    }

    /// Node fill color used by the graph renderer.
    pub fn color(self) -> &'static str {
        match self {
            JobState::Idle => "white",
            JobState::Running => "yellow",
            JobState::Success => "lawngreen",
            JobState::Failed => "red",
            JobState::Cancelled => "deepskyblue",
            JobState::Undef => "gray",
            JobState::Reset => "white",
            JobState::Blocked => "darkorange",
        }
    }
}

/// One latch per state plus a statechange counter.
///
/// A latch is set when the job enters the corresponding state and stays set
/// (releasing current and future waiters) until the job is reset.
pub(crate) struct StateLatches {
    latches: [watch::Sender<bool>; STATE_COUNT],
    statechange: watch::Sender<u64>,
}

impl StateLatches {
    pub(crate) fn new() -> Self {
        Self {
            latches: std::array::from_fn(|_| watch::channel(false).0),
            statechange: watch::channel(0).0,
        }
    }

    pub(crate) fn set(&self, state: JobState) {
        self.latches[state.value() as usize].send_replace(true);
    }

    pub(crate) fn is_set(&self, state: JobState) -> bool {
        *self.latches[state.value() as usize].borrow()
    }

    pub(crate) fn clear_all(&self) {
        for latch in &self.latches {
            latch.send_replace(false);
        }
    }

    pub(crate) fn subscribe(&self, state: JobState) -> watch::Receiver<bool> {
        self.latches[state.value() as usize].subscribe()
    }

    pub(crate) fn bump(&self) {
        self.statechange.send_modify(|count| *count = count.wrapping_add(1));
    }

    pub(crate) fn changes(&self) -> watch::Receiver<u64> {
        self.statechange.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip() {
        for state in JobState::ALL {
            assert_eq!(JobState::from_value(state.value() as i64).unwrap(), state);
        }
        assert!(matches!(
            JobState::from_value(8),
            Err(ExecError::UnknownState(8))
        ));
        assert!(matches!(
            JobState::from_value(-1),
            Err(ExecError::UnknownState(-1))
        ));
    }

    #[test]
    fn every_state_has_a_color() {
        for state in JobState::ALL {
            assert!(!state.color().is_empty());
        }
    }

    #[test]
    fn partitions() {
        assert!(JobState::Undef.is_done());
        assert!(JobState::Undef.is_success_like());
        assert!(!JobState::Failed.is_success_like());
        assert!(JobState::Reset.is_prestart());
        assert!(!JobState::Running.is_prestart());
        assert!(!JobState::Reset.is_done());
    }

    #[test]
    fn latches_release_current_and_future_waiters() {
        let latches = StateLatches::new();
        latches.set(JobState::Success);
        assert!(latches.is_set(JobState::Success));
        let rx = latches.subscribe(JobState::Success);
        assert!(*rx.borrow());
        latches.clear_all();
        assert!(!latches.is_set(JobState::Success));
        assert!(!*rx.borrow());
    }
}
