//! The boundary to code the kernel does not own.
//!
//! The kernel never inspects physical state. It asks a [`StateHandler`] which
//! identifiers a tag's candidates depend on, extracts in-states for them and
//! hands back out-states to apply. [`EventHandler`]s turn in-states into
//! candidate times and committed candidates into out-states.

use crate::error::HandlerError;
use crate::time::TimeValue;

/// Anything a handler pool can hold.
///
/// Pool members are cloned from one template per tag. `on_clone` runs on each
/// fresh clone with its position in the pool, so clones can diverge (for
/// example by reseeding a random generator).
pub trait PoolMember: Clone {
    fn on_clone(&mut self, _ordinal: usize) {}
}

/// Owner of the global physical state.
pub trait StateHandler {
    /// Addresses one piece of state a candidate depends on.
    type Identifier: Clone + Send + 'static;
    /// What an event handler needs to compute a candidate time.
    type InState: Send + 'static;
    /// The state change of one committed event.
    type OutState;

    /// Identifier groups for the candidates `tag` should produce now. Each
    /// group becomes one candidate and occupies one pool instance.
    fn candidate_identifiers(&self, tag: &str) -> Vec<Vec<Self::Identifier>>;

    /// Copies the state addressed by `identifiers`.
    fn extract(&self, identifiers: &[Self::Identifier]) -> Self::InState;

    /// Commits one out-state.
    fn apply(&mut self, out_state: Self::OutState) -> Result<(), HandlerError>;
}

/// One pool instance of a tag.
pub trait EventHandler<S: StateHandler>: PoolMember {
    /// Computes when this handler's next event would happen.
    ///
    /// A failure aborts the run.
    fn compute_candidate_time(
        &mut self,
        in_state: &S::InState,
        current_time: TimeValue,
    ) -> Result<TimeValue, HandlerError>;

    /// Builds the state change for a candidate that was just committed at `time`.
    fn compute_out_state(&mut self, state: &S, time: TimeValue) -> Result<S::OutState, HandlerError>;
}
