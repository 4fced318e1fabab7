//! Contains common, primitive types shared by every part of the kernel.
//!
//! Tags are addressed by a dense `TagId` index fixed when the dependency graph
//! is built. Handler instances live in a slotmap arena and are addressed by an
//! `InstanceId`; staleness of scheduled entries is decided by comparing a
//! counter snapshot against the instance's current valid counter.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// Uniquely and safely identifies one cloned handler instance in the arena.
    ///
    /// Instances are never removed, so a key stays valid for the whole run.
    pub struct InstanceId;
}

/// Dense index of a tag inside the `DependencyGraph`.
///
/// The index equals the position of the tag in the configured tag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(pub u16);

impl TagId {
    /// Position of this tag in per-tag tables.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The per-instance generation counter used for lazy invalidation.
pub type ValidCounter = u32;

/// Read access to the current valid counter of every handler instance.
///
/// The scheduler consults this on every peek or removal to decide whether an
/// entry is stale. It is implemented by the handler arena.
pub trait ValidCounters {
    /// The current counter of `instance`, or `None` if the instance is unknown.
    fn valid_counter(&self, instance: InstanceId) -> Option<ValidCounter>;
}
