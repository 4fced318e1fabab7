//! Per-tag pools of cloned handler instances.
//!
//! Every instance of every tag lives in one slotmap arena owned by
//! [`HandlerPools`]. An instance is *busy* from the moment it is acquired for a
//! candidate until that candidate is committed or trashed, and *idle*
//! otherwise. The arena also owns each instance's valid counter, which is what
//! the scheduler compares against when deciding whether an entry is stale.

use crate::common::{InstanceId, TagId, ValidCounter, ValidCounters};
use crate::config::PoolSize;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::handler::PoolMember;
use slotmap::SlotMap;
use tracing::{debug, warn};

/// Arena record of one handler instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord<H> {
    pub tag: TagId,
    /// Position of the instance inside its tag's pool.
    pub ordinal: usize,
    pub valid_counter: ValidCounter,
    pub busy: bool,
    pub handler: H,
}

/// Membership lists of one tag.
#[derive(Debug, Clone)]
pub struct HandlerPool {
    tag: TagId,
    name: String,
    size: PoolSize,
    members: Vec<InstanceId>,
    idle: Vec<InstanceId>,
    busy: Vec<InstanceId>,
}

impl HandlerPool {
    pub fn tag(&self) -> TagId {
        self.tag
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> PoolSize {
        self.size
    }

    /// Every instance, indexed by ordinal.
    pub fn members(&self) -> &[InstanceId] {
        &self.members
    }

    /// Instances that currently own a pending candidate.
    pub fn busy(&self) -> &[InstanceId] {
        &self.busy
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

/// The arena of all handler instances plus one [`HandlerPool`] per tag.
#[derive(Debug, Clone)]
pub struct HandlerPools<H> {
    arena: SlotMap<InstanceId, InstanceRecord<H>>,
    pools: Vec<HandlerPool>,
    templates: Vec<H>,
    reset_threshold: ValidCounter,
}

impl<H: PoolMember> HandlerPools<H> {
    /// Clones the instances of every tag from `templates`, which is indexed
    /// by [`TagId`]. Unbounded pools start with one instance.
    pub fn new(
        context: &EngineContext,
        graph: &DependencyGraph,
        templates: Vec<H>,
    ) -> Result<Self, EngineError> {
        if templates.len() != graph.len() {
            return Err(EngineError::configuration(format!(
                "{} handler templates for {} tags",
                templates.len(),
                graph.len()
            )));
        }
        let mut pools = Self {
            arena: SlotMap::with_key(),
            pools: Vec::with_capacity(graph.len()),
            templates,
            reset_threshold: context.config().counter_reset_threshold,
        };
        for node in graph.nodes() {
            pools.pools.push(HandlerPool {
                tag: node.id,
                name: node.name.clone(),
                size: node.pool,
                members: Vec::new(),
                idle: Vec::new(),
                busy: Vec::new(),
            });
            let initial = match node.pool {
                PoolSize::Bounded(capacity) => capacity,
                PoolSize::Unbounded => 1,
            };
            for _ in 0..initial {
                pools.grow(node.id);
            }
            pools.pools[node.id.index()].idle.reverse();
            debug!(tag = %node.name, instances = initial, "handler pool ready");
        }
        Ok(pools)
    }

    /// Clones one more instance for `tag` and files it as idle.
    fn grow(&mut self, tag: TagId) -> InstanceId {
        let pool = &mut self.pools[tag.index()];
        let ordinal = pool.members.len();
        let mut handler = self.templates[tag.index()].clone();
        handler.on_clone(ordinal);
        let id = self.arena.insert(InstanceRecord {
            tag,
            ordinal,
            valid_counter: 0,
            busy: false,
            handler,
        });
        pool.members.push(id);
        pool.idle.push(id);
        id
    }

    /// Hands out an idle instance of `tag` and marks it busy.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PoolExhausted`] if the pool is bounded and every
    /// instance is busy. Unbounded pools grow instead.
    pub fn acquire_free_instance(&mut self, tag: TagId) -> Result<InstanceId, EngineError> {
        let id = match self.pools[tag.index()].idle.pop() {
            Some(id) => id,
            None => match self.pools[tag.index()].size {
                PoolSize::Bounded(capacity) => {
                    return Err(EngineError::PoolExhausted {
                        tag: self.pools[tag.index()].name.clone(),
                        capacity,
                    });
                }
                PoolSize::Unbounded => {
                    let id = self.grow(tag);
                    self.pools[tag.index()].idle.pop();
                    debug!(
                        tag = %self.pools[tag.index()].name,
                        instances = self.pools[tag.index()].members.len(),
                        "unbounded pool grew"
                    );
                    id
                }
            },
        };
        self.pools[tag.index()].busy.push(id);
        if let Some(record) = self.arena.get_mut(id) {
            record.busy = true;
        }
        Ok(id)
    }

    /// Returns a busy instance to the idle list. Releasing an idle instance is
    /// a no-op.
    pub fn release(&mut self, id: InstanceId) {
        let Some(record) = self.arena.get_mut(id) else {
            return;
        };
        if !record.busy {
            return;
        }
        record.busy = false;
        let pool = &mut self.pools[record.tag.index()];
        if let Some(position) = pool.busy.iter().position(|&busy| busy == id) {
            pool.busy.swap_remove(position);
        }
        pool.idle.push(id);
    }

    /// Trashes every pending candidate of `tag`: bumps the valid counter of each
    /// busy instance and releases it. Returns the affected instances, which the
    /// scheduler must then be told about.
    pub fn invalidate_tag(&mut self, tag: TagId) -> Vec<InstanceId> {
        let pool = &mut self.pools[tag.index()];
        let trashed = std::mem::take(&mut pool.busy);
        for &id in &trashed {
            if let Some(record) = self.arena.get_mut(id) {
                record.valid_counter = record.valid_counter.saturating_add(1);
                record.busy = false;
            }
        }
        pool.idle.extend_from_slice(&trashed);
        trashed
    }

    /// Instances among `ids` whose counters reached the reset threshold.
    pub fn due_for_reset(&self, ids: &[InstanceId]) -> Vec<InstanceId> {
        ids.iter()
            .copied()
            .filter(|&id| {
                self.arena
                    .get(id)
                    .is_some_and(|record| record.valid_counter >= self.reset_threshold)
            })
            .collect()
    }

    /// Sets the valid counter of `id` back to zero. Only safe once the
    /// scheduler holds no entry for the instance.
    pub fn reset_counter(&mut self, id: InstanceId) {
        if let Some(record) = self.arena.get_mut(id) {
            warn!(
                tag = %self.pools[record.tag.index()].name,
                ordinal = record.ordinal,
                counter = record.valid_counter,
                "valid counter reset to zero"
            );
            record.valid_counter = 0;
        }
    }

    pub fn record(&self, id: InstanceId) -> Option<&InstanceRecord<H>> {
        self.arena.get(id)
    }

    pub fn tag_of(&self, id: InstanceId) -> Result<TagId, EngineError> {
        self.arena
            .get(id)
            .map(|record| record.tag)
            .ok_or_else(|| EngineError::illegal(format!("instance {id:?} is not in the arena")))
    }

    pub fn handler(&self, id: InstanceId) -> Option<&H> {
        self.arena.get(id).map(|record| &record.handler)
    }

    pub fn handler_mut(&mut self, id: InstanceId) -> Option<&mut H> {
        self.arena.get_mut(id).map(|record| &mut record.handler)
    }

    /// Swaps in a handler that was computed on elsewhere.
    pub fn replace_handler(&mut self, id: InstanceId, handler: H) {
        if let Some(record) = self.arena.get_mut(id) {
            record.handler = handler;
        }
    }

    pub fn pool(&self, tag: TagId) -> &HandlerPool {
        &self.pools[tag.index()]
    }

    pub fn pools(&self) -> &[HandlerPool] {
        &self.pools
    }

    /// The instance of `tag` at position `ordinal`.
    pub fn instance(&self, tag: TagId, ordinal: usize) -> Option<InstanceId> {
        self.pools.get(tag.index())?.members.get(ordinal).copied()
    }

    /// Valid counters of `tag`, indexed by ordinal.
    pub fn counters(&self, tag: TagId) -> Vec<ValidCounter> {
        self.pools[tag.index()]
            .members
            .iter()
            .filter_map(|&id| self.arena.get(id).map(|record| record.valid_counter))
            .collect()
    }

    /// Ordinals of the busy instances of `tag`, sorted.
    pub fn busy_ordinals(&self, tag: TagId) -> Vec<usize> {
        let mut ordinals: Vec<usize> = self.pools[tag.index()]
            .busy
            .iter()
            .filter_map(|&id| self.arena.get(id).map(|record| record.ordinal))
            .collect();
        ordinals.sort_unstable();
        ordinals
    }

    /// Overwrites the counters and busy set of `tag` from saved data.
    ///
    /// Unbounded pools grow to `counters.len()`. Bounded pools must match their
    /// capacity exactly.
    pub fn restore_pool(
        &mut self,
        tag: TagId,
        counters: &[ValidCounter],
        busy: &[usize],
    ) -> Result<(), EngineError> {
        let name = self.pools[tag.index()].name.clone();
        match self.pools[tag.index()].size {
            PoolSize::Bounded(capacity) if capacity != counters.len() => {
                return Err(EngineError::snapshot(format!(
                    "pool '{name}' has {capacity} instances, snapshot has {}",
                    counters.len()
                )));
            }
            _ => {}
        }
        while self.pools[tag.index()].members.len() < counters.len() {
            self.grow(tag);
        }
        if let Some(&ordinal) = busy.iter().find(|&&ordinal| ordinal >= counters.len()) {
            return Err(EngineError::snapshot(format!(
                "pool '{name}' has no instance {ordinal}"
            )));
        }

        let pool = &mut self.pools[tag.index()];
        pool.idle.clear();
        pool.busy.clear();
        for (ordinal, &id) in pool.members.iter().enumerate() {
            let is_busy = busy.contains(&ordinal);
            if let Some(record) = self.arena.get_mut(id) {
                record.valid_counter = counters.get(ordinal).copied().unwrap_or(0);
                record.busy = is_busy;
            }
            if is_busy {
                pool.busy.push(id);
            } else {
                pool.idle.push(id);
            }
        }
        // Lowest ordinals are handed out first again.
        pool.idle.reverse();
        Ok(())
    }

    /// Total number of instances across all pools.
    pub fn instance_count(&self) -> usize {
        self.arena.len()
    }
}

impl<H> ValidCounters for HandlerPools<H> {
    fn valid_counter(&self, instance: InstanceId) -> Option<ValidCounter> {
        self.arena.get(instance).map(|record| record.valid_counter)
    }
}
