//! Binary min-heap scheduler with lazy deletion.
//!
//! Layout: `slots[0]` is a sentinel holding `TimeValue::ZERO`, the least
//! possible time, so it acts as minus infinity and bubbling up never needs a
//! bounds check. Elements occupy `slots[1..=len]`; the children of `i` are
//! `2i` and `2i + 1`. The backing vector always holds at least one slot past
//! `len`, used as scratch space while sifting down.

use super::{Bookkeeping, EntryHandle, ScheduledEntry, Scheduler};
use crate::common::{InstanceId, ValidCounters};
use crate::config::SchedulerKind;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::time::TimeValue;
use tracing::debug;

fn sentinel() -> ScheduledEntry {
    ScheduledEntry {
        time: TimeValue::ZERO,
        instance: InstanceId::default(),
        counter: 0,
    }
}

const INITIAL_SLOTS: usize = 16;

/// Heap-backed [`Scheduler`].
#[derive(Debug)]
pub struct HeapScheduler {
    slots: Vec<ScheduledEntry>,
    len: usize,
    book: Bookkeeping,
}

impl HeapScheduler {
    /// Creates an empty heap configured from `context`.
    pub fn new(context: &EngineContext) -> Self {
        Self {
            slots: vec![sentinel(); INITIAL_SLOTS],
            len: 0,
            book: Bookkeeping::new(context),
        }
    }

    /// Doubles the backing vector until it fits `len + 1` elements plus scratch.
    fn reserve_one(&mut self) {
        let needed = self.len + 3;
        if needed > self.slots.len() {
            let mut capacity = self.slots.len().max(INITIAL_SLOTS);
            while capacity < needed {
                capacity *= 2;
            }
            self.slots.resize(capacity, sentinel());
        }
    }

    fn push(&mut self, entry: ScheduledEntry) {
        self.reserve_one();
        self.len += 1;
        self.slots[self.len] = entry;
        self.sift_up(self.len);
    }

    fn sift_up(&mut self, mut index: usize) {
        // The sentinel at 0 is never greater, so this stops at the root.
        while self.slots[index / 2].time > self.slots[index].time {
            self.slots.swap(index, index / 2);
            index /= 2;
        }
    }

    fn sift_down(&mut self, index: usize) {
        let scratch = self.len + 1;
        self.slots[scratch] = self.slots[index];
        let moving = self.slots[scratch].time;
        let mut hole = index;
        loop {
            let left = 2 * hole;
            if left > self.len {
                break;
            }
            let right = left + 1;
            let child = if right <= self.len && self.slots[right].time < self.slots[left].time {
                right
            } else {
                left
            };
            if self.slots[child].time < moving {
                self.slots[hole] = self.slots[child];
                hole = child;
            } else {
                break;
            }
        }
        self.slots[hole] = self.slots[scratch];
        self.slots[scratch] = sentinel();
    }

    /// Moves the last element to the root and restores heap order.
    fn pop_root(&mut self) -> ScheduledEntry {
        let root = self.slots[1];
        self.slots[1] = self.slots[self.len];
        self.slots[self.len] = sentinel();
        self.len -= 1;
        if self.len > 1 {
            self.sift_down(1);
        }
        root
    }

    /// Drops stale entries from the top until the root is valid or the heap is empty.
    fn settle_root(&mut self, counters: &dyn ValidCounters) -> Option<ScheduledEntry> {
        while self.len > 0 {
            let root = self.slots[1];
            if self.book.is_valid(&root, counters) {
                return Some(root);
            }
            self.book.discard(&root);
            self.pop_root();
        }
        None
    }

    /// Removes every element matching `doomed` by swapping in the last
    /// element, then rebuilds the heap bottom-up since swaps can break order
    /// anywhere.
    fn sweep(&mut self, doomed: impl Fn(&ScheduledEntry, &Bookkeeping) -> bool) -> usize {
        let mut removed = 0;
        let mut index = 1;
        while index <= self.len {
            if doomed(&self.slots[index], &self.book) {
                self.slots[index] = self.slots[self.len];
                self.slots[self.len] = sentinel();
                self.len -= 1;
                removed += 1;
            } else {
                index += 1;
            }
        }
        self.heapify();
        removed
    }

    fn heapify(&mut self) {
        for index in (1..=self.len / 2).rev() {
            self.sift_down(index);
        }
    }

    fn compact(&mut self) {
        let removed = self.sweep(|entry, book| !book.is_live(entry));
        debug!(removed, remaining = self.len, "compacted heap scheduler");
    }

    #[cfg(test)]
    fn is_heap_ordered(&self) -> bool {
        (2..=self.len).all(|i| self.slots[i / 2].time <= self.slots[i].time)
    }
}

impl Scheduler for HeapScheduler {
    fn insert(
        &mut self,
        time: TimeValue,
        instance: InstanceId,
        counters: &dyn ValidCounters,
    ) -> Result<EntryHandle, EngineError> {
        let counter = self.book.register(instance, counters)?;
        self.push(ScheduledEntry {
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
        match self.settle_root(counters) {
            Some(root) => {
                self.book.check_order(root.time)?;
                Ok(Some(root))
            }
            None => Ok(None),
        }
    }

    fn remove_min(
        &mut self,
        counters: &dyn ValidCounters,
    ) -> Result<Option<ScheduledEntry>, EngineError> {
        let Some(root) = self.settle_root(counters) else {
            return Ok(None);
        };
        self.book.commit(&root)?;
        self.pop_root();
        Ok(Some(root))
    }

    fn invalidate_all(&mut self, instances: &[InstanceId]) {
        self.book.forget(instances);
        if self.book.wants_compaction(self.len) {
            self.compact();
        }
    }

    fn purge(&mut self, instance: InstanceId) {
        self.book.forget(&[instance]);
        let removed = self.sweep(|entry, _| entry.instance == instance);
        debug!(?instance, removed, "purged instance from heap scheduler");
    }

    fn size(&self) -> usize {
        self.book.live_count()
    }

    fn physical_len(&self) -> usize {
        self.len
    }

    fn live_entries(&self) -> Vec<ScheduledEntry> {
        self.slots[1..=self.len]
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
        self.slots = vec![sentinel(); INITIAL_SLOTS];
        self.len = 0;
        for entry in entries {
            self.push(entry);
        }
        Ok(())
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Heap
    }
}
