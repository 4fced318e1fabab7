//! Error types for the Eventchain kernel.
//!
//! [`EngineError`] covers every failure the kernel can report. Apart from
//! [`EngineError::InvalidArgument`], all variants are fatal: the mediator loop
//! stops on the first one and never retries, since retrying has no defined
//! meaning once global ordering is in doubt.

use crate::time::TimeValue;

/// Failure reported by an external event handler or state handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable description of what went wrong.
    pub message: String,
}

impl HandlerError {
    /// Creates a new `HandlerError` from anything printable.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error for the kernel.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed time value or negative displacement.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: String,
    },

    /// A bounded pool had no idle instance left.
    #[error("pool exhausted for tag '{tag}': all {capacity} instances are busy")]
    PoolExhausted {
        /// Name of the tag whose pool is exhausted.
        tag: String,
        /// Configured pool size.
        capacity: usize,
    },

    /// The scheduler was about to return a time earlier than the previous commit.
    #[error("monotonicity violation: commit time {offending} precedes previous commit {previous}")]
    MonotonicityViolation {
        /// The previously committed time.
        previous: TimeValue,
        /// The smaller time that was about to be committed.
        offending: TimeValue,
    },

    /// Programming error, such as inserting a handler that already has a pending entry.
    #[error("illegal state: {reason}")]
    IllegalState {
        /// Description of the broken precondition.
        reason: String,
    },

    /// The global minimum did not advance between two commits and the
    /// configured policy treats that as an error.
    #[error("global minimum unchanged across two consecutive commits at {time}")]
    UnchangedMinimum {
        /// The repeated commit time.
        time: TimeValue,
    },

    /// A creation, trash, activation or deactivation list names an undeclared tag.
    #[error("tag '{referenced}' in the '{list}' list of tag '{owner}' is not declared")]
    UnknownTag {
        /// Tag whose list contains the bad reference.
        owner: String,
        /// Which list the reference appears in.
        list: &'static str,
        /// The undeclared tag name.
        referenced: String,
    },

    /// Any other inconsistency in the static configuration.
    #[error("configuration error: {reason}")]
    Configuration {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },

    /// An event handler or the state handler failed while computing.
    #[error("handler for tag '{tag}' failed: {source}")]
    HandlerFailed {
        /// Tag of the failing handler.
        tag: String,
        /// The underlying handler error.
        #[source]
        source: HandlerError,
    },

    /// The scheduler ran empty with no outstanding candidate computation.
    #[error("deadlock: scheduler is empty after {commits} commits")]
    Deadlock {
        /// Number of commits performed before the scheduler ran dry.
        commits: u64,
    },

    /// A snapshot could not be written, read, or does not match the engine.
    #[error("snapshot error: {reason}")]
    Snapshot {
        /// Explanation of the mismatch or I/O failure.
        reason: String,
    },

    /// The mediator was asked to step after it already finished.
    #[error("mediator is not running")]
    NotRunning,
}

impl EngineError {
    /// Whether this error must abort the mediator loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidArgument { .. })
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn snapshot(reason: impl Into<String>) -> Self {
        Self::Snapshot {
            reason: reason.into(),
        }
    }
}
