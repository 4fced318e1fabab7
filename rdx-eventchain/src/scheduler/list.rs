//! Unordered-list scheduler.
//!
//! Appends in `O(1)` and scans the whole list on every peek or removal. It
//! serves as the reference the heap is checked against.

use super::{Bookkeeping, EntryHandle, ScheduledEntry, Scheduler};
use crate::common::{InstanceId, ValidCounters};
use crate::config::SchedulerKind;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::time::TimeValue;
use tracing::debug;

/// Vector-backed [`Scheduler`].
#[derive(Debug)]
pub struct ListScheduler {
    entries: Vec<ScheduledEntry>,
    book: Bookkeeping,
}

impl ListScheduler {
    /// Creates an empty list configured from `context`.
    pub fn new(context: &EngineContext) -> Self {
        Self {
            entries: Vec::new(),
            book: Bookkeeping::new(context),
        }
    }

    /// Drops stale entries and returns the index of the earliest remaining one.
    fn earliest(&mut self, counters: &dyn ValidCounters) -> Option<usize> {
        let mut index = 0;
        while index < self.entries.len() {
            if self.book.is_valid(&self.entries[index], counters) {
                index += 1;
            } else {
                let stale = self.entries.swap_remove(index);
                self.book.discard(&stale);
            }
        }
        self.entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.time.cmp(&b.time))
            .map(|(index, _)| index)
    }
}

impl Scheduler for ListScheduler {
    fn insert(
        &mut self,
        time: TimeValue,
        instance: InstanceId,
        counters: &dyn ValidCounters,
    ) -> Result<EntryHandle, EngineError> {
        let counter = self.book.register(instance, counters)?;
        self.entries.push(ScheduledEntry {
            time,
            instance,
            counter,
        });
        Ok(EntryHandle { instance, counter })
    }

    fn peek_min(
        &mut self,
        counters: &dyn ValidCounters,
    ) -> Result<Option<ScheduledEntry>, EngineError> {
        let Some(index) = self.earliest(counters) else {
            return Ok(None);
        };
        let entry = self.entries[index];
        self.book.check_order(entry.time)?;
        Ok(Some(entry))
    }

    fn remove_min(
        &mut self,
        counters: &dyn ValidCounters,
    ) -> Result<Option<ScheduledEntry>, EngineError> {
        let Some(index) = self.earliest(counters) else {
            return Ok(None);
        };
        self.book.commit(&self.entries[index])?;
        Ok(Some(self.entries.swap_remove(index)))
    }

    fn invalidate_all(&mut self, instances: &[InstanceId]) {
        self.book.forget(instances);
        if self.book.wants_compaction(self.entries.len()) {
            let before = self.entries.len();
            let book = &self.book;
            self.entries.retain(|entry| book.is_live(entry));
            debug!(
                removed = before - self.entries.len(),
                "compacted list scheduler"
            );
        }
    }

    fn purge(&mut self, instance: InstanceId) {
        self.book.forget(&[instance]);
        self.entries.retain(|entry| entry.instance != instance);
    }

    fn size(&self) -> usize {
        self.book.live_count()
    }

    fn physical_len(&self) -> usize {
        self.entries.len()
    }

    fn live_entries(&self) -> Vec<ScheduledEntry> {
        self.entries
            .iter()
            .filter(|entry| self.book.is_live(entry))
            .copied()
            .collect()
    }

    fn last_committed(&self) -> Option<TimeValue> {
        self.book.last_committed()
    }

    fn restore(
        &mut self,
        entries: Vec<ScheduledEntry>,
        last_committed: Option<TimeValue>,
    ) -> Result<(), EngineError> {
        self.book.restore(&entries, last_committed)?;
        self.entries = entries;
        Ok(())
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::List
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::HeapScheduler;
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Insert { slot: usize, delay: f64 },
        Trash { slot: usize },
        Commit,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..12usize, 0.0..5.0f64).prop_map(|(slot, delay)| Op::Insert { slot, delay }),
            1 => (0..12usize).prop_map(|slot| Op::Trash { slot }),
            2 => Just(Op::Commit),
        ]
    }

    proptest! {
        #[test]
        fn heap_and_list_commit_identical_time_sequences(ops in prop::collection::vec(op(), 1..200)) {
            let context = context();
            let mut heap = HeapScheduler::new(&context);
            let mut list = ListScheduler::new(&context);
            let mut counters = Counters::default();
            let ids: Vec<_> = (0..12).map(|_| counters.spawn()).collect();
            let mut pending = [false; 12];
            let mut now = TimeValue::ZERO;
            let mut committed = Vec::new();

            for op in ops {
                match op {
                    Op::Insert { slot, delay } if !pending[slot] => {
                        let time = now.add(delay).unwrap();
                        heap.insert(time, ids[slot], &counters).unwrap();
                        list.insert(time, ids[slot], &counters).unwrap();
                        pending[slot] = true;
                    }
                    Op::Insert { .. } => {}
                    Op::Trash { slot } => {
                        counters.bump(ids[slot]);
                        heap.invalidate_all(&[ids[slot]]);
                        list.invalidate_all(&[ids[slot]]);
                        pending[slot] = false;
                    }
                    Op::Commit => {
                        let h = heap.remove_min(&counters).unwrap();
                        let l = list.remove_min(&counters).unwrap();
                        prop_assert_eq!(h.map(|e| e.time), l.map(|e| e.time));
                        if let (Some(a), Some(b)) = (h, l) {
                            prop_assert!(a.time >= now);
                            now = a.time;
                            committed.push(a.time);
                            let mut done = vec![a.instance];
                            if a.instance != b.instance {
                                // An exact tie went different ways. Each side still
                                // holds the other's winner, so drop both everywhere.
                                counters.bump(a.instance);
                                counters.bump(b.instance);
                                heap.invalidate_all(&[a.instance, b.instance]);
                                list.invalidate_all(&[a.instance, b.instance]);
                                done.push(b.instance);
                            }
                            for instance in done {
                                if let Some(slot) = ids.iter().position(|&x| x == instance) {
                                    pending[slot] = false;
                                }
                            }
                        }
                    }
                }
                prop_assert_eq!(heap.size(), list.size());
            }
            prop_assert!(committed.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
