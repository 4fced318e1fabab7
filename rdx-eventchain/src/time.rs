//! Drift-free time stamps.
//!
//! Event handlers keep adding small, roughly constant displacements to a time
//! stamp that grows without bound over a run. A single `f64` loses digits of
//! the fractional part as the integer part grows. `TimeValue` stores the
//! integer part in a `u64` quotient and the fractional part in an `f64`
//! remainder in `[0, 1)`, so the remainder keeps the same precision for the
//! whole run.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A point in simulation time, split into quotient and remainder.
///
/// Values are totally ordered by quotient first and remainder second. There is
/// no subtraction: time only moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "RawTimeValue")]
pub struct TimeValue {
    quotient: u64,
    remainder: f64,
}

/// Unvalidated wire form used during deserialization.
#[derive(Deserialize)]
struct RawTimeValue {
    quotient: u64,
    remainder: f64,
}

impl TryFrom<RawTimeValue> for TimeValue {
    type Error = EngineError;

    fn try_from(raw: RawTimeValue) -> Result<Self, Self::Error> {
        Self::new(raw.quotient, raw.remainder)
    }
}

impl TimeValue {
    /// The start of simulation time. It is also the least possible value.
    pub const ZERO: TimeValue = TimeValue {
        quotient: 0,
        remainder: 0.0,
    };

    /// Creates a time value from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if `remainder` is not in `[0, 1)`.
    pub fn new(quotient: u64, remainder: f64) -> Result<Self, EngineError> {
        if !(0.0..1.0).contains(&remainder) {
            return Err(EngineError::invalid(format!(
                "remainder {remainder} is not in [0, 1)"
            )));
        }
        Ok(Self {
            quotient,
            // Folds -0.0 into +0.0 so `total_cmp` agrees with `==`.
            remainder: remainder + 0.0,
        })
    }

    /// Splits a non-negative finite float into quotient and remainder.
    pub fn from_f64(value: f64) -> Result<Self, EngineError> {
        if !value.is_finite() || value < 0.0 {
            return Err(EngineError::invalid(format!(
                "time {value} must be finite and non-negative"
            )));
        }
        Self::ZERO.add(value)
    }

    /// Returns this time advanced by `displacement`.
    ///
    /// The displacement is added to the remainder first; any whole part that
    /// accumulates is carried into the quotient.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if the displacement is negative,
    /// not finite, or would overflow the quotient.
    pub fn add(self, displacement: f64) -> Result<Self, EngineError> {
        if !displacement.is_finite() || displacement < 0.0 {
            return Err(EngineError::invalid(format!(
                "displacement {displacement} must be finite and non-negative"
            )));
        }
        let sum = self.remainder + displacement;
        if sum < 1.0 {
            return Ok(Self {
                quotient: self.quotient,
                remainder: sum,
            });
        }
        let whole = sum.floor();
        if whole >= u64::MAX as f64 {
            return Err(EngineError::invalid(format!(
                "displacement {displacement} overflows the time quotient"
            )));
        }
        let quotient = self
            .quotient
            .checked_add(whole as u64)
            .ok_or_else(|| {
                EngineError::invalid(format!(
                    "displacement {displacement} overflows the time quotient"
                ))
            })?;
        // Exact for sum >= 1: both operands share the same ulp grid.
        let remainder = sum - whole;
        Ok(Self {
            quotient,
            remainder,
        })
    }

    /// In-place form of [`TimeValue::add`].
    pub fn advance(&mut self, displacement: f64) -> Result<(), EngineError> {
        *self = self.add(displacement)?;
        Ok(())
    }

    /// The integer part.
    pub fn quotient(&self) -> u64 {
        self.quotient
    }

    /// The fractional part, always in `[0, 1)`.
    pub fn remainder(&self) -> f64 {
        self.remainder
    }

    /// Lossy conversion to a single float, for display and statistics only.
    pub fn as_f64(&self) -> f64 {
        self.quotient as f64 + self.remainder
    }
}

impl PartialEq for TimeValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimeValue {}

impl PartialOrd for TimeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.quotient
            .cmp(&other.quotient)
            .then_with(|| self.remainder.total_cmp(&other.remainder))
    }
}

impl Default for TimeValue {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:.15}", self.quotient, self.remainder)
    }
}
