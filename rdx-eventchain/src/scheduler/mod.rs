//! Priority structures over `(time, handler instance)` candidates.
//!
//! A [`Scheduler`] hands out the earliest *valid* candidate. Cancelling a
//! candidate is lazy: the owning pool bumps the instance's valid counter, the
//! scheduler forgets the instance's pending record, and the physical entry is
//! dropped the next time it reaches the top or during a compaction.
//!
//! Two implementations share the same bookkeeping:
//! - [`HeapScheduler`]: 1-indexed binary min-heap, `O(log n)` insert and removal.
//! - [`ListScheduler`]: unordered vector scanned on every removal. It is the
//!   correctness oracle for the heap and is fine for small populations.

mod heap;
mod list;

pub use heap::HeapScheduler;
pub use list::ListScheduler;

use crate::common::{InstanceId, ValidCounter, ValidCounters};
use crate::config::{SchedulerKind, UnchangedMinimumPolicy};
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::time::TimeValue;
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use tracing::{trace, warn};

/// One candidate event as stored in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    /// When the candidate would be committed.
    pub time: TimeValue,
    /// The handler instance that produced it.
    pub instance: InstanceId,
    /// The instance's valid counter at insertion time.
    pub counter: ValidCounter,
}

/// Identifies an inserted entry. It stays meaningful until the instance's
/// counter changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    /// The handler instance the entry belongs to.
    pub instance: InstanceId,
    /// Counter snapshot taken at insertion.
    pub counter: ValidCounter,
}

/// The scheduling contract shared by every implementation.
pub trait Scheduler: Send {
    /// Inserts a candidate for `instance` at `time`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] if the instance already has a
    /// valid pending entry or is unknown to `counters`.
    fn insert(
        &mut self,
        time: TimeValue,
        instance: InstanceId,
        counters: &dyn ValidCounters,
    ) -> Result<EntryHandle, EngineError>;

    /// Returns the earliest valid entry without removing it. Stale entries met
    /// on the way are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MonotonicityViolation`] if the earliest entry
    /// precedes the last committed time.
    fn peek_min(
        &mut self,
        counters: &dyn ValidCounters,
    ) -> Result<Option<ScheduledEntry>, EngineError>;

    /// Removes and returns the earliest valid entry, recording its time as the
    /// last committed time.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MonotonicityViolation`] if the earliest entry
    /// precedes the last committed time, or [`EngineError::UnchangedMinimum`]
    /// if it equals it and the policy says so.
    fn remove_min(
        &mut self,
        counters: &dyn ValidCounters,
    ) -> Result<Option<ScheduledEntry>, EngineError>;

    /// Marks the pending entries of `instances` stale. Their valid counters
    /// must already have been bumped by the owning pool. Compacts the
    /// structure when the share of stale entries grows too large.
    fn invalidate_all(&mut self, instances: &[InstanceId]);

    /// Physically removes every entry of `instance`, valid or not. Used before
    /// the instance's valid counter is reset to zero.
    fn purge(&mut self, instance: InstanceId);

    /// Number of valid pending entries. Diagnostic only.
    fn size(&self) -> usize;

    /// Number of stored entries, including stale ones not yet dropped.
    fn physical_len(&self) -> usize;

    /// The valid pending entries, in no particular order.
    fn live_entries(&self) -> Vec<ScheduledEntry>;

    /// Time of the last removed entry.
    fn last_committed(&self) -> Option<TimeValue>;

    /// Replaces the whole content, as done when resuming from a snapshot.
    fn restore(
        &mut self,
        entries: Vec<ScheduledEntry>,
        last_committed: Option<TimeValue>,
    ) -> Result<(), EngineError>;

    /// Which implementation this is.
    fn kind(&self) -> SchedulerKind;
}

/// Builds the scheduler selected in the context's configuration.
pub fn build_scheduler(context: &EngineContext) -> Box<dyn Scheduler> {
    match context.config().scheduler {
        SchedulerKind::Heap => Box::new(HeapScheduler::new(context)),
        SchedulerKind::List => Box::new(ListScheduler::new(context)),
    }
}

/// Pending records, stale accounting and the commit-order guard, shared by
/// both scheduler variants.
///
/// Every pending record matches exactly one stored entry with the same
/// `(instance, counter)`. An entry without a matching record is stale.
#[derive(Debug)]
pub(crate) struct Bookkeeping {
    pending: SecondaryMap<InstanceId, ValidCounter>,
    last_committed: Option<TimeValue>,
    policy: UnchangedMinimumPolicy,
    compaction_ratio: f64,
}

impl Bookkeeping {
    pub(crate) fn new(context: &EngineContext) -> Self {
        let config = context.config();
        Self {
            pending: SecondaryMap::new(),
            last_committed: None,
            policy: config.unchanged_minimum,
            compaction_ratio: config.compaction_ratio,
        }
    }

    /// Registers a new pending entry and returns the counter snapshot for it.
    pub(crate) fn register(
        &mut self,
        instance: InstanceId,
        counters: &dyn ValidCounters,
    ) -> Result<ValidCounter, EngineError> {
        let current = counters.valid_counter(instance).ok_or_else(|| {
            EngineError::illegal(format!("instance {instance:?} is not part of any pool"))
        })?;
        if self.pending.get(instance) == Some(&current) {
            return Err(EngineError::illegal(format!(
                "instance {instance:?} already has a pending entry"
            )));
        }
        self.pending.insert(instance, current);
        Ok(current)
    }

    /// Whether `entry` is still the valid pending entry of its instance.
    pub(crate) fn is_live(&self, entry: &ScheduledEntry) -> bool {
        self.pending.get(entry.instance) == Some(&entry.counter)
    }

    /// Like [`Bookkeeping::is_live`] but also consults the current counters,
    /// catching invalidations the scheduler has not been told about yet.
    pub(crate) fn is_valid(&self, entry: &ScheduledEntry, counters: &dyn ValidCounters) -> bool {
        self.is_live(entry) && counters.valid_counter(entry.instance) == Some(entry.counter)
    }

    /// Forgets a dropped stale entry.
    pub(crate) fn discard(&mut self, entry: &ScheduledEntry) {
        trace!(instance = ?entry.instance, time = %entry.time, "dropping stale entry");
        if self.is_live(entry) {
            self.pending.remove(entry.instance);
        }
    }

    /// Forgets the pending records of `instances`.
    pub(crate) fn forget(&mut self, instances: &[InstanceId]) {
        for &instance in instances {
            self.pending.remove(instance);
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a structure holding `physical` entries should be compacted.
    pub(crate) fn wants_compaction(&self, physical: usize) -> bool {
        if physical == 0 {
            return false;
        }
        let stale = physical.saturating_sub(self.pending.len());
        stale as f64 / physical as f64 > self.compaction_ratio
    }

    /// Fails if `time` precedes the last committed time.
    pub(crate) fn check_order(&self, time: TimeValue) -> Result<(), EngineError> {
        match self.last_committed {
            Some(previous) if time < previous => Err(EngineError::MonotonicityViolation {
                previous,
                offending: time,
            }),
            _ => Ok(()),
        }
    }

    /// Checks and records the commit of `entry`.
    pub(crate) fn commit(&mut self, entry: &ScheduledEntry) -> Result<(), EngineError> {
        self.check_order(entry.time)?;
        if self.last_committed == Some(entry.time) {
            match self.policy {
                UnchangedMinimumPolicy::Ignore => {}
                UnchangedMinimumPolicy::Warn => {
                    warn!(time = %entry.time, "global minimum unchanged across two commits");
                }
                UnchangedMinimumPolicy::Error => {
                    return Err(EngineError::UnchangedMinimum { time: entry.time });
                }
            }
        }
        self.pending.remove(entry.instance);
        self.last_committed = Some(entry.time);
        Ok(())
    }

    pub(crate) fn last_committed(&self) -> Option<TimeValue> {
        self.last_committed
    }

    /// Rebuilds the pending records from restored entries.
    pub(crate) fn restore(
        &mut self,
        entries: &[ScheduledEntry],
        last_committed: Option<TimeValue>,
    ) -> Result<(), EngineError> {
        self.pending.clear();
        for entry in entries {
            if let Some(previous) = last_committed {
                if entry.time < previous {
                    return Err(EngineError::snapshot(format!(
                        "entry at {} precedes last commit {previous}",
                        entry.time
                    )));
                }
            }
            if self.pending.insert(entry.instance, entry.counter).is_some() {
                return Err(EngineError::snapshot(format!(
                    "instance {:?} has more than one pending entry",
                    entry.instance
                )));
            }
        }
        self.last_committed = last_committed;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal counter table for exercising schedulers without pools.

    use super::*;
    use crate::config::EngineConfig;
    use slotmap::SlotMap;
    use std::sync::Arc;

    #[derive(Default)]
    pub(crate) struct Counters {
        keys: SlotMap<InstanceId, ()>,
        values: SecondaryMap<InstanceId, ValidCounter>,
    }

    impl Counters {
        pub(crate) fn spawn(&mut self) -> InstanceId {
            let id = self.keys.insert(());
            self.values.insert(id, 0);
            id
        }

        pub(crate) fn bump(&mut self, id: InstanceId) {
            if let Some(counter) = self.values.get_mut(id) {
                *counter += 1;
            }
        }

        pub(crate) fn reset(&mut self, id: InstanceId) {
            self.values.insert(id, 0);
        }
    }

    impl ValidCounters for Counters {
        fn valid_counter(&self, instance: InstanceId) -> Option<ValidCounter> {
            self.values.get(instance).copied()
        }
    }

    pub(crate) fn context_with(
        policy: UnchangedMinimumPolicy,
        compaction_ratio: f64,
    ) -> Arc<EngineContext> {
        let mut config = EngineConfig::default();
        config.unchanged_minimum = policy;
        config.compaction_ratio = compaction_ratio;
        EngineContext::new(config)
    }

    pub(crate) fn context() -> Arc<EngineContext> {
        context_with(UnchangedMinimumPolicy::Warn, 0.5)
    }

    pub(crate) fn t(quotient: u64, remainder: f64) -> TimeValue {
        TimeValue::new(quotient, remainder).unwrap()
    }

    /// Runs the same scenario against both implementations.
    pub(crate) fn both(context: &EngineContext) -> Vec<Box<dyn Scheduler>> {
        vec![
            Box::new(HeapScheduler::new(context)),
            Box::new(ListScheduler::new(context)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn removes_in_time_order() {
        for mut scheduler in both(&context()) {
            let mut counters = Counters::default();
            let (h1, h2, h3) = (counters.spawn(), counters.spawn(), counters.spawn());
            scheduler.insert(t(0, 0.1), h1, &counters).unwrap();
            scheduler.insert(t(0, 0.05), h2, &counters).unwrap();
            scheduler.insert(t(0, 0.2), h3, &counters).unwrap();

            let order: Vec<InstanceId> = std::iter::from_fn(|| {
                scheduler.remove_min(&counters).unwrap().map(|e| e.instance)
            })
            .collect();
            assert_eq!(order, vec![h2, h1, h3], "{:?}", scheduler.kind());
        }
    }

    #[test]
    fn invalidated_entry_is_never_returned() {
        for mut scheduler in both(&context()) {
            let mut counters = Counters::default();
            let h1 = counters.spawn();
            scheduler.insert(t(0, 0.5), h1, &counters).unwrap();
            counters.bump(h1);
            scheduler.invalidate_all(&[h1]);
            scheduler.insert(t(0, 0.7), h1, &counters).unwrap();

            let entry = scheduler.remove_min(&counters).unwrap().unwrap();
            assert_eq!(entry.time, t(0, 0.7));
            assert!(scheduler.remove_min(&counters).unwrap().is_none());
        }
    }

    #[test]
    fn invalidating_repeatedly_skips_every_entry() {
        for mut scheduler in both(&context_with(UnchangedMinimumPolicy::Warn, 1.0)) {
            let mut counters = Counters::default();
            let h = counters.spawn();
            let other = counters.spawn();
            scheduler.insert(t(9, 0.0), other, &counters).unwrap();
            for n in 0..10 {
                scheduler.insert(t(0, 0.05 * n as f64), h, &counters).unwrap();
                counters.bump(h);
                scheduler.invalidate_all(&[h]);
            }
            assert_eq!(scheduler.size(), 1);
            assert_eq!(scheduler.physical_len(), 11);

            let entry = scheduler.remove_min(&counters).unwrap().unwrap();
            assert_eq!(entry.instance, other);
            assert_eq!(scheduler.size(), 0);
            assert_eq!(scheduler.physical_len(), 0);
        }
    }

    #[test]
    fn double_pending_insert_is_illegal() {
        for mut scheduler in both(&context()) {
            let mut counters = Counters::default();
            let h = counters.spawn();
            scheduler.insert(t(1, 0.0), h, &counters).unwrap();
            let err = scheduler.insert(t(2, 0.0), h, &counters).unwrap_err();
            assert!(matches!(err, EngineError::IllegalState { .. }));
        }
    }

    #[test]
    fn earlier_time_after_commit_violates_monotonicity() {
        for mut scheduler in both(&context()) {
            let mut counters = Counters::default();
            let (a, b) = (counters.spawn(), counters.spawn());
            scheduler.insert(t(0, 0.5), a, &counters).unwrap();
            scheduler.remove_min(&counters).unwrap();
            scheduler.insert(t(0, 0.3), b, &counters).unwrap();

            assert!(matches!(
                scheduler.peek_min(&counters),
                Err(EngineError::MonotonicityViolation { .. })
            ));
            match scheduler.remove_min(&counters) {
                Err(EngineError::MonotonicityViolation { previous, offending }) => {
                    assert_eq!(previous, t(0, 0.5));
                    assert_eq!(offending, t(0, 0.3));
                }
                other => panic!("expected a violation, got {other:?}"),
            }
        }
    }

    #[test]
    fn unchanged_minimum_follows_policy() {
        let warn = context_with(UnchangedMinimumPolicy::Warn, 0.5);
        for mut scheduler in both(&warn) {
            let mut counters = Counters::default();
            let (a, b) = (counters.spawn(), counters.spawn());
            scheduler.insert(t(1, 0.0), a, &counters).unwrap();
            scheduler.insert(t(1, 0.0), b, &counters).unwrap();
            assert!(scheduler.remove_min(&counters).unwrap().is_some());
            assert!(scheduler.remove_min(&counters).unwrap().is_some());
        }

        let strict = context_with(UnchangedMinimumPolicy::Error, 0.5);
        for mut scheduler in both(&strict) {
            let mut counters = Counters::default();
            let (a, b) = (counters.spawn(), counters.spawn());
            scheduler.insert(t(1, 0.0), a, &counters).unwrap();
            scheduler.insert(t(1, 0.0), b, &counters).unwrap();
            scheduler.remove_min(&counters).unwrap();
            assert!(matches!(
                scheduler.remove_min(&counters),
                Err(EngineError::UnchangedMinimum { .. })
            ));
        }
    }

    #[test]
    fn counter_bump_without_notice_is_still_caught() {
        for mut scheduler in both(&context()) {
            let mut counters = Counters::default();
            let (a, b) = (counters.spawn(), counters.spawn());
            scheduler.insert(t(0, 0.1), a, &counters).unwrap();
            scheduler.insert(t(0, 0.2), b, &counters).unwrap();
            counters.bump(a);

            let entry = scheduler.peek_min(&counters).unwrap().unwrap();
            assert_eq!(entry.instance, b);
            assert_eq!(scheduler.size(), 1);
        }
    }

    #[test]
    fn purge_then_reset_allows_counter_reuse() {
        for mut scheduler in both(&context_with(UnchangedMinimumPolicy::Warn, 1.0)) {
            let mut counters = Counters::default();
            let (a, b) = (counters.spawn(), counters.spawn());
            scheduler.insert(t(0, 0.1), a, &counters).unwrap();
            scheduler.insert(t(0, 0.4), b, &counters).unwrap();
            counters.bump(a);
            scheduler.invalidate_all(&[a]);
            scheduler.purge(a);
            counters.reset(a);
            assert_eq!(scheduler.physical_len(), 1);

            // The old (a, counter 0) entry is gone, so counter 0 is safe to reuse.
            scheduler.insert(t(0, 0.3), a, &counters).unwrap();
            let first = scheduler.remove_min(&counters).unwrap().unwrap();
            assert_eq!((first.instance, first.time), (a, t(0, 0.3)));
            let second = scheduler.remove_min(&counters).unwrap().unwrap();
            assert_eq!(second.instance, b);
        }
    }

    #[test]
    fn restore_rejects_duplicate_pending_entries() {
        for mut scheduler in both(&context()) {
            let mut counters = Counters::default();
            let a = counters.spawn();
            let entry = ScheduledEntry {
                time: t(1, 0.0),
                instance: a,
                counter: 0,
            };
            assert!(scheduler.restore(vec![entry, entry], None).is_err());
            scheduler.restore(vec![entry], Some(t(0, 0.5))).unwrap();
            assert_eq!(scheduler.size(), 1);
            assert_eq!(scheduler.last_committed(), Some(t(0, 0.5)));
            assert_eq!(scheduler.remove_min(&counters).unwrap(), Some(entry));
        }
    }
}
