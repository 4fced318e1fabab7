//! A small reference state handler.
//!
//! `TimeLedger` stands in for a physical state: a ring of units, one of which
//! carries the active label. Displacement events lift the label to another
//! unit, end-of-chain events rotate it, sampling events count samples. It is
//! enough to exercise every path of the kernel without any physics.

use crate::config::LedgerConfig;
use crate::error::HandlerError;
use crate::handler::StateHandler;
use crate::time::TimeValue;
use tracing::{debug, info};

/// What a handler sees of the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerView {
    /// The units this candidate was created for.
    pub units: Vec<usize>,
    pub active: usize,
    pub time: TimeValue,
}

/// The state change of one committed event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LedgerUpdate {
    StartRun { time: TimeValue },
    Lift { time: TimeValue, to: usize },
    Sample { time: TimeValue },
    EndChain { time: TimeValue },
    EndRun { time: TimeValue },
}

impl LedgerUpdate {
    pub fn time(&self) -> TimeValue {
        match *self {
            LedgerUpdate::StartRun { time }
            | LedgerUpdate::Lift { time, .. }
            | LedgerUpdate::Sample { time }
            | LedgerUpdate::EndChain { time }
            | LedgerUpdate::EndRun { time } => time,
        }
    }
}

/// The reference state handler.
#[derive(Debug, Clone)]
pub struct TimeLedger {
    units: usize,
    fan_out: Vec<String>,
    active: usize,
    time: TimeValue,
    pub lifts: u64,
    pub samples: u64,
    pub chains_ended: u64,
    pub finished: bool,
}

impl TimeLedger {
    pub fn new(units: usize, fan_out: Vec<String>) -> Self {
        Self {
            units: units.max(1),
            fan_out,
            active: 0,
            time: TimeValue::ZERO,
            lifts: 0,
            samples: 0,
            chains_ended: 0,
            finished: false,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(config.units, config.fan_out.clone())
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Time of the last applied update.
    pub fn time(&self) -> TimeValue {
        self.time
    }
}

impl StateHandler for TimeLedger {
    type Identifier = usize;
    type InState = LedgerView;
    type OutState = LedgerUpdate;

    /// Fan-out tags get one candidate per inactive unit, every other tag one
    /// candidate for the active unit.
    fn candidate_identifiers(&self, tag: &str) -> Vec<Vec<usize>> {
        if self.fan_out.iter().any(|name| name == tag) {
            (0..self.units)
                .filter(|&unit| unit != self.active)
                .map(|unit| vec![unit])
                .collect()
        } else {
            vec![vec![self.active]]
        }
    }

    fn extract(&self, identifiers: &[usize]) -> LedgerView {
        LedgerView {
            units: identifiers.to_vec(),
            active: self.active,
            time: self.time,
        }
    }

    fn apply(&mut self, update: LedgerUpdate) -> Result<(), HandlerError> {
        if update.time() < self.time {
            return Err(HandlerError::new(format!(
                "update at {} precedes ledger time {}",
                update.time(),
                self.time
            )));
        }
        self.time = update.time();
        match update {
            LedgerUpdate::StartRun { .. } => info!(units = self.units, "ledger run started"),
            LedgerUpdate::Lift { to, .. } => {
                if to >= self.units {
                    return Err(HandlerError::new(format!(
                        "unit {to} is out of range for {} units",
                        self.units
                    )));
                }
                debug!(from = self.active, to, "active label lifted");
                self.active = to;
                self.lifts += 1;
            }
            LedgerUpdate::Sample { time } => {
                self.samples += 1;
                debug!(%time, active = self.active, "sample");
            }
            LedgerUpdate::EndChain { .. } => {
                self.active = (self.active + 1) % self.units;
                self.chains_ended += 1;
            }
            LedgerUpdate::EndRun { .. } => self.finished = true,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(value: f64) -> TimeValue {
        TimeValue::from_f64(value).unwrap()
    }

    #[test]
    fn fan_out_tags_get_one_group_per_inactive_unit() {
        let ledger = TimeLedger::new(4, vec!["pair".into()]);
        assert_eq!(
            ledger.candidate_identifiers("pair"),
            vec![vec![1], vec![2], vec![3]]
        );
        assert_eq!(ledger.candidate_identifiers("sample"), vec![vec![0]]);
    }

    #[test]
    fn updates_move_the_active_label() {
        let mut ledger = TimeLedger::new(3, Vec::new());
        ledger.apply(LedgerUpdate::Lift { time: t(0.5), to: 2 }).unwrap();
        assert_eq!(ledger.active(), 2);
        ledger.apply(LedgerUpdate::EndChain { time: t(1.0) }).unwrap();
        assert_eq!(ledger.active(), 0);
        ledger.apply(LedgerUpdate::Sample { time: t(1.0) }).unwrap();
        assert_eq!((ledger.lifts, ledger.chains_ended, ledger.samples), (1, 1, 1));
        assert_eq!(ledger.time(), t(1.0));
    }

    #[test]
    fn rejects_backwards_and_out_of_range_updates() {
        let mut ledger = TimeLedger::new(2, Vec::new());
        ledger.apply(LedgerUpdate::Sample { time: t(2.0) }).unwrap();
        assert!(ledger.apply(LedgerUpdate::Sample { time: t(1.0) }).is_err());
        assert!(ledger.apply(LedgerUpdate::Lift { time: t(3.0), to: 5 }).is_err());
    }
}
