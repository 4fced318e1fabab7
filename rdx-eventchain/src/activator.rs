//! Resolves the dependency graph after each commit.
//!
//! For a committed tag `t` the [`Activator`] runs, in this order:
//! 1. the activation and deactivation lists of `t`,
//! 2. the trash set T(t): pool counters are bumped and the scheduler forgets
//!    the pending entries,
//! 3. the creation set C(t), in declared order: one pool instance per
//!    identifier group, one candidate time per instance, one scheduler insert
//!    per candidate.
//!
//! Trashing always precedes creation, so a tag listed in both sets ends up
//! with freshly created candidates only.

use crate::common::{InstanceId, TagId, ValidCounter, ValidCounters};
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::handler::{EventHandler, PoolMember, StateHandler};
use crate::pool::HandlerPools;
use crate::scheduler::Scheduler;
use crate::time::TimeValue;
use std::sync::Arc;
use tracing::{debug, trace};

/// A candidate computation waiting to run on an acquired instance.
#[derive(Debug)]
pub struct CandidateRequest<I> {
    pub tag: TagId,
    pub instance: InstanceId,
    /// The instance's valid counter when it was acquired.
    pub counter: ValidCounter,
    pub in_state: I,
}

/// What one activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    /// Instances whose pending candidates were trashed.
    pub trashed: Vec<InstanceId>,
    /// Number of candidates inserted.
    pub created: usize,
}

/// Ties commits to trashing and creation.
#[derive(Debug, Clone)]
pub struct Activator {
    context: Arc<EngineContext>,
    enabled: Vec<bool>,
}

impl Activator {
    pub fn new(context: Arc<EngineContext>, graph: &DependencyGraph) -> Self {
        Self {
            context,
            enabled: graph.nodes().map(|node| node.enabled).collect(),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn is_enabled(&self, tag: TagId) -> bool {
        self.enabled.get(tag.index()).copied().unwrap_or(false)
    }

    /// Per-tag enabled flags, indexed by [`TagId`].
    pub fn enabled_flags(&self) -> &[bool] {
        &self.enabled
    }

    pub fn restore_enabled(&mut self, flags: Vec<bool>) -> Result<(), EngineError> {
        if flags.len() != self.enabled.len() {
            return Err(EngineError::snapshot(format!(
                "{} enabled flags for {} tags",
                flags.len(),
                self.enabled.len()
            )));
        }
        self.enabled = flags;
        Ok(())
    }

    /// Applies the activation and deactivation lists of `tag`.
    pub fn apply_switches(&mut self, graph: &DependencyGraph, tag: TagId) {
        for &other in graph.activates(tag) {
            self.enabled[other.index()] = true;
            trace!(tag = graph.name(other), "tag enabled");
        }
        for &other in graph.deactivates(tag) {
            self.enabled[other.index()] = false;
            trace!(tag = graph.name(other), "tag disabled");
        }
    }

    /// Trashes the pending candidates of every tag in T(`tag`).
    ///
    /// Instances whose counters reached the reset threshold are purged from the
    /// scheduler and start over at zero.
    pub fn trash<H: PoolMember>(
        &self,
        graph: &DependencyGraph,
        tag: TagId,
        pools: &mut HandlerPools<H>,
        scheduler: &mut dyn Scheduler,
    ) -> Vec<InstanceId> {
        let mut trashed = Vec::new();
        for &victim in graph.trashes(tag) {
            let instances = pools.invalidate_tag(victim);
            if !instances.is_empty() {
                debug!(
                    by = graph.name(tag),
                    tag = graph.name(victim),
                    count = instances.len(),
                    "trashing pending candidates"
                );
            }
            scheduler.invalidate_all(&instances);
            trashed.extend(instances);
        }
        for id in pools.due_for_reset(&trashed) {
            scheduler.purge(id);
            pools.reset_counter(id);
        }
        trashed
    }

    /// Acquires one instance per identifier group of each enabled tag in
    /// `tags` and extracts its in-state. Nothing is computed yet.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PoolExhausted`] if a bounded pool runs dry.
    pub fn prepare_requests<S, H>(
        &self,
        graph: &DependencyGraph,
        tags: &[TagId],
        state: &S,
        pools: &mut HandlerPools<H>,
    ) -> Result<Vec<CandidateRequest<S::InState>>, EngineError>
    where
        S: StateHandler,
        H: EventHandler<S>,
    {
        let mut requests = Vec::new();
        for &tag in tags {
            if !self.is_enabled(tag) {
                trace!(tag = graph.name(tag), "skipping disabled tag");
                continue;
            }
            for identifiers in state.candidate_identifiers(graph.name(tag)) {
                let instance = pools.acquire_free_instance(tag)?;
                let counter = pools.valid_counter(instance).unwrap_or_default();
                requests.push(CandidateRequest {
                    tag,
                    instance,
                    counter,
                    in_state: state.extract(&identifiers),
                });
            }
        }
        Ok(requests)
    }

    /// Inserts a computed candidate unless its instance was trashed since the
    /// request was prepared. Returns whether it was inserted.
    pub fn accept<H>(
        &self,
        graph: &DependencyGraph,
        pools: &HandlerPools<H>,
        scheduler: &mut dyn Scheduler,
        tag: TagId,
        instance: InstanceId,
        counter: ValidCounter,
        time: TimeValue,
    ) -> Result<bool, EngineError> {
        if pools.valid_counter(instance) != Some(counter) {
            debug!(tag = graph.name(tag), ?instance, "ignoring candidate of a trashed instance");
            return Ok(false);
        }
        scheduler.insert(time, instance, pools)?;
        trace!(tag = graph.name(tag), time = %time, "candidate inserted");
        Ok(true)
    }

    /// Prepares, computes and inserts candidates for `tags` on this thread.
    pub fn create<S, H>(
        &self,
        graph: &DependencyGraph,
        tags: &[TagId],
        state: &S,
        pools: &mut HandlerPools<H>,
        scheduler: &mut dyn Scheduler,
        now: TimeValue,
    ) -> Result<usize, EngineError>
    where
        S: StateHandler,
        H: EventHandler<S>,
    {
        let requests = self.prepare_requests(graph, tags, state, pools)?;
        let mut created = 0;
        for request in requests {
            let handler = pools.handler_mut(request.instance).ok_or_else(|| {
                EngineError::illegal(format!("instance {:?} vanished", request.instance))
            })?;
            let time = handler
                .compute_candidate_time(&request.in_state, now)
                .map_err(|source| EngineError::HandlerFailed {
                    tag: graph.name(request.tag).to_string(),
                    source,
                })?;
            if self.accept(
                graph,
                pools,
                scheduler,
                request.tag,
                request.instance,
                request.counter,
                time,
            )? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Runs the start tag's switches and creates its candidate. Called once
    /// before the first commit.
    pub fn bootstrap<S, H>(
        &mut self,
        graph: &DependencyGraph,
        state: &S,
        pools: &mut HandlerPools<H>,
        scheduler: &mut dyn Scheduler,
        now: TimeValue,
    ) -> Result<usize, EngineError>
    where
        S: StateHandler,
        H: EventHandler<S>,
    {
        let start = graph.start();
        self.apply_switches(graph, start);
        self.create(graph, &[start], state, pools, scheduler, now)
    }

    /// Full activation after `committed` was committed at `now`.
    pub fn activate<S, H>(
        &mut self,
        graph: &DependencyGraph,
        committed: TagId,
        state: &S,
        pools: &mut HandlerPools<H>,
        scheduler: &mut dyn Scheduler,
        now: TimeValue,
    ) -> Result<Activation, EngineError>
    where
        S: StateHandler,
        H: EventHandler<S>,
    {
        self.apply_switches(graph, committed);
        let trashed = self.trash(graph, committed, pools, scheduler);
        let created = self.create(graph, graph.creates(committed), state, pools, scheduler, now)?;
        Ok(Activation { trashed, created })
    }
}
