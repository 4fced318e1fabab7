//! # Eventchain
//!
//! A drift-free, event-driven scheduling kernel for event-chain Monte Carlo.
//!
//! The kernel repeatedly commits the earliest pending candidate event, lets
//! its handler update the physical state, and then resolves a static
//! dependency graph to decide which pending candidates become invalid and
//! which new candidates must be computed.
//!
//! ## Core Concepts
//!
//! - **TimeValue**: A quotient/remainder time that keeps its precision over
//!   arbitrarily long runs.
//! - **Scheduler**: A min-priority store of `(time, instance)` candidates with
//!   lazy invalidation through per-instance valid counters.
//! - **Handler Pools**: Reusable event-handler instances per tag, bounded or
//!   growing on demand.
//! - **Dependency Graph**: Per tag, which tags are trashed, created, activated
//!   or deactivated after it commits.
//! - **Mediator**: The single-threaded commit and activation loop.
//!   The **Coordinator** runs the same loop with candidate times computed on
//!   worker tasks.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use eventchain::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     // 1. Load a configuration, or start from the built-in one.
//!     let config = EngineConfig::default();
//!
//!     // 2. Wire a mediator over the reference ledger.
//!     let context = EngineContext::new(config);
//!     let mut mediator = reference_mediator(context)?;
//!
//!     // 3. Run until the end tag commits.
//!     let summary = mediator.run()?;
//!     println!("{:?} after {} commits", summary.reason, summary.commits);
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Eventchain Kernel";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod activator;
pub mod common;
pub mod components;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod graph;
pub mod handler;
pub mod mediator;
pub mod pool;
pub mod scheduler;
pub mod snapshot;
pub mod time;

/// A prelude module for easy importing of the most common Eventchain types.
pub mod prelude {
    pub use crate::common::{InstanceId, TagId, ValidCounter};
    pub use crate::components::{reference_mediator, BuiltinHandler, HandlerKind, TimeLedger};
    pub use crate::config::{EngineConfig, SchedulerKind};
    pub use crate::context::EngineContext;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{EngineError, HandlerError};
    pub use crate::events::{MediatorEvent, TerminationReason};
    pub use crate::handler::{EventHandler, PoolMember, StateHandler};
    pub use crate::mediator::{Mediator, MediatorState, RunSummary, StepOutcome, StopHandle};
    pub use crate::snapshot::Snapshot;
    pub use crate::time::TimeValue;
}
