//! Defines the notifications broadcast by the mediator loop.
//!
//! Observers subscribe through `Mediator::subscribe` and receive these on a
//! tokio broadcast channel. Nothing in the kernel waits for observers; a slow
//! receiver simply lags and misses events.

use crate::common::{InstanceId, TagId};
use crate::time::TimeValue;
use uuid::Uuid;

/// Why a run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The designated end-of-run tag was committed.
    EndOfRun,
    /// An external stop request was observed between two commits.
    Stopped,
}

/// Lifecycle and progress events of one run.
#[derive(Debug, Clone)]
pub enum MediatorEvent {
    /// Fired once the start tag has produced its candidates.
    Started { run_id: Uuid, time: TimeValue },
    /// Fired after every commit.
    Committed {
        tag: TagId,
        instance: InstanceId,
        time: TimeValue,
        /// Running number of this commit, starting at 1.
        commit: u64,
    },
    /// Fired when a commit trashed pending candidates.
    Trashed { by: TagId, count: usize },
    /// Fired once when the loop reaches `TERMINATED`.
    Terminated {
        reason: TerminationReason,
        time: TimeValue,
        commits: u64,
    },
    /// Fired once when the loop reaches `FAILED`.
    Failed { reason: String },
}
