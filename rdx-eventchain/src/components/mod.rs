//! Built-in handler kinds and the reference state handler.

pub mod kinds;
pub mod ledger;

pub use kinds::{BuiltinHandler, HandlerKind};
pub use ledger::{LedgerUpdate, LedgerView, TimeLedger};

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::mediator::Mediator;
use std::sync::Arc;

/// A mediator over the reference ledger, with one built-in handler per tag.
pub fn reference_mediator(
    context: Arc<EngineContext>,
) -> Result<Mediator<TimeLedger, BuiltinHandler>, EngineError> {
    let ledger = TimeLedger::from_config(&context.config().ledger);
    Mediator::from_config(context, ledger, BuiltinHandler::from_tag)
}
