//! The closed set of built-in handler kinds.
//!
//! Every tag of a configuration names one [`HandlerKind`]; the pool then
//! clones a [`BuiltinHandler`] of that kind. Kinds carry their parameters,
//! the handler carries what changes per instance (its random generator and
//! the time it last fired).

use super::ledger::{LedgerUpdate, LedgerView, TimeLedger};
use crate::config::{HandlerKindConfig, TagConfig};
use crate::error::{EngineError, HandlerError};
use crate::handler::{EventHandler, PoolMember};
use crate::time::TimeValue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Validated parameters of a built-in kind.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    /// Fires once, at the current time.
    StartOfRun,
    /// Takes a sample every `interval`, counted from its own previous firing.
    FixedInterval { interval: f64 },
    /// Lifts the active label after a constant displacement.
    ConstantDisplacement { displacement: f64 },
    /// Lifts the active label after an exponentially distributed displacement.
    Exponential { rate: f64, seed: u64 },
    /// Ends the current chain every `chain_length`.
    EndOfChain { chain_length: f64 },
    /// Ends the run at an absolute time.
    FinalTime { end_time: TimeValue },
}

impl TryFrom<&HandlerKindConfig> for HandlerKind {
    type Error = EngineError;

    fn try_from(config: &HandlerKindConfig) -> Result<Self, Self::Error> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(value)
            } else {
                Err(EngineError::configuration(format!(
                    "{name} must be finite and positive, got {value}"
                )))
            }
        };
        Ok(match *config {
            HandlerKindConfig::StartOfRun => HandlerKind::StartOfRun,
            HandlerKindConfig::FixedInterval { interval } => HandlerKind::FixedInterval {
                interval: positive("interval", interval)?,
            },
            HandlerKindConfig::ConstantDisplacement { displacement } => {
                if !(displacement.is_finite() && displacement >= 0.0) {
                    return Err(EngineError::configuration(format!(
                        "displacement must be finite and non-negative, got {displacement}"
                    )));
                }
                HandlerKind::ConstantDisplacement { displacement }
            }
            HandlerKindConfig::Exponential { rate, seed } => HandlerKind::Exponential {
                rate: positive("rate", rate)?,
                seed,
            },
            HandlerKindConfig::EndOfChain { chain_length } => HandlerKind::EndOfChain {
                chain_length: positive("chain_length", chain_length)?,
            },
            HandlerKindConfig::FinalTime { end_time } => HandlerKind::FinalTime {
                end_time: TimeValue::from_f64(end_time)
                    .map_err(|e| EngineError::configuration(e.to_string()))?,
            },
        })
    }
}

/// One pool instance of a built-in kind.
#[derive(Debug, Clone)]
pub struct BuiltinHandler {
    kind: HandlerKind,
    rng: StdRng,
    last_fired: Option<TimeValue>,
    target: Option<usize>,
}

impl BuiltinHandler {
    pub fn new(kind: HandlerKind) -> Self {
        let seed = match kind {
            HandlerKind::Exponential { seed, .. } => seed,
            _ => 0,
        };
        Self {
            kind,
            rng: StdRng::seed_from_u64(seed),
            last_fired: None,
            target: None,
        }
    }

    /// Builds the template for a declared tag.
    pub fn from_tag(tag: &TagConfig) -> Result<Self, EngineError> {
        HandlerKind::try_from(&tag.kind)
            .map(Self::new)
            .map_err(|e| EngineError::configuration(format!("tag '{}': {e}", tag.name)))
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    /// Draws from Exp(rate) by inversion.
    fn exponential(&mut self, rate: f64) -> f64 {
        let u: f64 = self.rng.gen();
        -(1.0 - u).ln() / rate
    }

    /// `previous + step`, never earlier than `now + step`.
    fn periodic(&self, step: f64, now: TimeValue) -> Result<TimeValue, EngineError> {
        let from_last = match self.last_fired {
            Some(last) => last.add(step)?,
            None => now.add(step)?,
        };
        if from_last < now {
            now.add(step)
        } else {
            Ok(from_last)
        }
    }
}

impl PoolMember for BuiltinHandler {
    fn on_clone(&mut self, ordinal: usize) {
        if let HandlerKind::Exponential { seed, .. } = self.kind {
            self.rng = StdRng::seed_from_u64(seed.wrapping_add(ordinal as u64));
        }
    }
}

fn displaced(result: Result<TimeValue, EngineError>) -> Result<TimeValue, HandlerError> {
    result.map_err(|e| HandlerError::new(e.to_string()))
}

impl EventHandler<TimeLedger> for BuiltinHandler {
    fn compute_candidate_time(
        &mut self,
        in_state: &LedgerView,
        current_time: TimeValue,
    ) -> Result<TimeValue, HandlerError> {
        self.target = in_state.units.first().copied();
        let time = match self.kind {
            HandlerKind::StartOfRun => current_time,
            HandlerKind::FixedInterval { interval } => {
                displaced(self.periodic(interval, current_time))?
            }
            HandlerKind::EndOfChain { chain_length } => {
                displaced(self.periodic(chain_length, current_time))?
            }
            HandlerKind::ConstantDisplacement { displacement } => {
                displaced(current_time.add(displacement))?
            }
            HandlerKind::Exponential { rate, .. } => {
                let displacement = self.exponential(rate);
                displaced(current_time.add(displacement))?
            }
            HandlerKind::FinalTime { end_time } => end_time.max(current_time),
        };
        self.last_fired = Some(time);
        Ok(time)
    }

    fn compute_out_state(
        &mut self,
        _state: &TimeLedger,
        time: TimeValue,
    ) -> Result<LedgerUpdate, HandlerError> {
        Ok(match self.kind {
            HandlerKind::StartOfRun => LedgerUpdate::StartRun { time },
            HandlerKind::FixedInterval { .. } => LedgerUpdate::Sample { time },
            HandlerKind::ConstantDisplacement { .. } | HandlerKind::Exponential { .. } => {
                let to = self
                    .target
                    .ok_or_else(|| HandlerError::new("displacement committed without a target unit"))?;
                LedgerUpdate::Lift { time, to }
            }
            HandlerKind::EndOfChain { .. } => LedgerUpdate::EndChain { time },
            HandlerKind::FinalTime { .. } => LedgerUpdate::EndRun { time },
        })
    }
}
