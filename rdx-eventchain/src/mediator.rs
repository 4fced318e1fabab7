//! The mediator loop: repeated commit and activation until the run ends.
//!
//! ```text
//! INITIALIZING --start tag created--> RUNNING --end tag / stop--> TERMINATED
//!                                        |
//!                                        +--any fatal error--> FAILED
//! ```
//!
//! One step removes the earliest valid candidate, lets its handler build the
//! out-state, applies it through the state handler, releases the instance and
//! runs the activator for the committed tag. Nothing interleaves with a step.

use crate::activator::{Activation, Activator};
use crate::common::TagId;
use crate::config::TagConfig;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::events::{MediatorEvent, TerminationReason};
use crate::graph::DependencyGraph;
use crate::handler::{EventHandler, StateHandler};
use crate::pool::HandlerPools;
use crate::scheduler::{build_scheduler, ScheduledEntry, Scheduler};
use crate::snapshot::{EntryRecord, PoolRecord, Snapshot, SNAPSHOT_VERSION};
use crate::time::TimeValue;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediatorState {
    Initializing,
    Running,
    Terminated(TerminationReason),
    Failed,
}

/// Cloneable flag asking a running loop to stop after the current commit.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Committed { tag: TagId, time: TimeValue },
    Terminated(TerminationReason),
}

/// Totals reported when a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: TerminationReason,
    pub commits: u64,
    pub final_time: TimeValue,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorStats {
    pub state: MediatorState,
    pub current_time: TimeValue,
    pub commits: u64,
    /// Valid pending entries.
    pub pending: usize,
    /// Stored entries, stale ones included.
    pub stored: usize,
    pub instances: usize,
    /// Commits per tag name, in declaration order.
    pub per_tag: Vec<(String, u64)>,
}

/// A committed candidate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Commit {
    pub(crate) tag: TagId,
    pub(crate) time: TimeValue,
}

/// Drives one run over a state handler `S` and event handlers `H`.
pub struct Mediator<S: StateHandler, H: EventHandler<S>> {
    pub(crate) context: Arc<EngineContext>,
    pub(crate) graph: DependencyGraph,
    pub(crate) scheduler: Box<dyn Scheduler>,
    pub(crate) pools: HandlerPools<H>,
    pub(crate) activator: Activator,
    pub(crate) state: S,
    pub(crate) status: MediatorState,
    pub(crate) current_time: TimeValue,
    commits: u64,
    tag_commits: Vec<u64>,
    stop: StopHandle,
    events: broadcast::Sender<MediatorEvent>,
}

impl<S: StateHandler, H: EventHandler<S>> Mediator<S, H> {
    /// Wires a mediator from one handler template per tag, indexed like the
    /// configured tag list.
    pub fn new(
        context: Arc<EngineContext>,
        state: S,
        templates: Vec<H>,
    ) -> Result<Self, EngineError> {
        let graph = DependencyGraph::new(&context)?;
        let pools = HandlerPools::new(&context, &graph, templates)?;
        let activator = Activator::new(context.clone(), &graph);
        let scheduler = build_scheduler(&context);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            tag_commits: vec![0; graph.len()],
            context,
            graph,
            scheduler,
            pools,
            activator,
            state,
            status: MediatorState::Initializing,
            current_time: TimeValue::ZERO,
            commits: 0,
            stop: StopHandle::new(),
            events,
        })
    }

    /// Like [`Mediator::new`], building each template from its tag declaration.
    pub fn from_config(
        context: Arc<EngineContext>,
        state: S,
        mut build: impl FnMut(&TagConfig) -> Result<H, EngineError>,
    ) -> Result<Self, EngineError> {
        let templates = context
            .config()
            .tags
            .iter()
            .map(&mut build)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(context, state, templates)
    }

    /// Bootstraps the start tag. [`Mediator::step`] does this on first use.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.status != MediatorState::Initializing {
            return Err(EngineError::illegal("mediator is already initialized"));
        }
        info!(
            run_id = %self.context.run_id(),
            scheduler = ?self.scheduler.kind(),
            tags = self.graph.len(),
            "mediator starting"
        );
        self.guard(|m| {
            m.activator.bootstrap(
                &m.graph,
                &m.state,
                &mut m.pools,
                m.scheduler.as_mut(),
                m.current_time,
            )
        })?;
        self.mark_started();
        Ok(())
    }

    pub(crate) fn mark_started(&mut self) {
        self.status = MediatorState::Running;
        self.events
            .send(MediatorEvent::Started {
                run_id: self.context.run_id(),
                time: self.current_time,
            })
            .ok();
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Commits the next candidate and activates its tag.
    ///
    /// # Errors
    ///
    /// Any error is fatal and leaves the mediator in [`MediatorState::Failed`].
    /// Stepping a finished mediator returns [`EngineError::NotRunning`].
    pub fn step(&mut self) -> Result<StepOutcome, EngineError> {
        match self.status {
            MediatorState::Initializing => self.initialize()?,
            MediatorState::Running => {}
            MediatorState::Terminated(_) | MediatorState::Failed => {
                return Err(EngineError::NotRunning)
            }
        }
        if self.stop_requested() {
            return Ok(self.terminate(TerminationReason::Stopped));
        }

        let commit = self.guard(|m| m.commit_next())?;
        if self.graph.end() == Some(commit.tag) {
            return Ok(self.terminate(TerminationReason::EndOfRun));
        }
        self.guard(|m| m.activate(commit.tag))?;
        Ok(StepOutcome::Committed {
            tag: commit.tag,
            time: commit.time,
        })
    }

    /// Steps until the run terminates or fails.
    pub fn run(&mut self) -> Result<RunSummary, EngineError> {
        loop {
            if let StepOutcome::Terminated(reason) = self.step()? {
                return Ok(self.summary(reason));
            }
        }
    }

    /// Steps at most `steps` times. Returns the summary if the run ended.
    pub fn run_for(&mut self, steps: u64) -> Result<Option<RunSummary>, EngineError> {
        for _ in 0..steps {
            if let StepOutcome::Terminated(reason) = self.step()? {
                return Ok(Some(self.summary(reason)));
            }
        }
        Ok(None)
    }

    /// Removes the earliest valid candidate and applies its out-state.
    pub(crate) fn commit_next(&mut self) -> Result<Commit, EngineError> {
        let entry = self
            .scheduler
            .remove_min(&self.pools)?
            .ok_or(EngineError::Deadlock {
                commits: self.commits,
            })?;
        let tag = self.pools.tag_of(entry.instance)?;
        self.current_time = entry.time;

        let handler = self.pools.handler_mut(entry.instance).ok_or_else(|| {
            EngineError::illegal(format!("instance {:?} vanished", entry.instance))
        })?;
        let out_state = handler
            .compute_out_state(&self.state, entry.time)
            .map_err(|source| EngineError::HandlerFailed {
                tag: self.graph.name(tag).to_string(),
                source,
            })?;
        self.state
            .apply(out_state)
            .map_err(|source| EngineError::HandlerFailed {
                tag: self.graph.name(tag).to_string(),
                source,
            })?;
        self.pools.release(entry.instance);

        self.commits += 1;
        self.tag_commits[tag.index()] += 1;
        debug!(
            tag = self.graph.name(tag),
            time = %entry.time,
            commit = self.commits,
            "committed"
        );
        self.events
            .send(MediatorEvent::Committed {
                tag,
                instance: entry.instance,
                time: entry.time,
                commit: self.commits,
            })
            .ok();
        Ok(Commit {
            tag,
            time: entry.time,
        })
    }

    fn activate(&mut self, tag: TagId) -> Result<Activation, EngineError> {
        let activation = self.activator.activate(
            &self.graph,
            tag,
            &self.state,
            &mut self.pools,
            self.scheduler.as_mut(),
            self.current_time,
        )?;
        self.notify_trashed(tag, activation.trashed.len());
        Ok(activation)
    }

    pub(crate) fn notify_trashed(&self, by: TagId, count: usize) {
        if count > 0 {
            self.events.send(MediatorEvent::Trashed { by, count }).ok();
        }
    }

    /// Runs `f` and moves to `FAILED` if it returns a fatal error.
    pub(crate) fn guard<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        f(self).map_err(|err| self.failed(err))
    }

    /// Records `err` like [`Mediator::guard`] does and hands it back.
    pub(crate) fn failed(&mut self, err: EngineError) -> EngineError {
        if err.is_fatal() {
            self.fail(&err);
        }
        err
    }

    fn fail(&mut self, err: &EngineError) {
        self.status = MediatorState::Failed;
        error!(error = %err, commits = self.commits, time = %self.current_time, "mediator failed");
        self.events
            .send(MediatorEvent::Failed {
                reason: err.to_string(),
            })
            .ok();
    }

    pub(crate) fn terminate(&mut self, reason: TerminationReason) -> StepOutcome {
        self.status = MediatorState::Terminated(reason);
        info!(
            ?reason,
            commits = self.commits,
            time = %self.current_time,
            "mediator terminated"
        );
        self.events
            .send(MediatorEvent::Terminated {
                reason,
                time: self.current_time,
                commits: self.commits,
            })
            .ok();
        StepOutcome::Terminated(reason)
    }

    pub(crate) fn summary(&self, reason: TerminationReason) -> RunSummary {
        RunSummary {
            reason,
            commits: self.commits,
            final_time: self.current_time,
        }
    }

    /// The earliest valid candidate as `(tag name, time)`, without committing it.
    pub fn peek(&mut self) -> Result<Option<(String, TimeValue)>, EngineError> {
        let Some(entry) = self.guard(|m| m.scheduler.peek_min(&m.pools))? else {
            return Ok(None);
        };
        let tag = self.pools.tag_of(entry.instance)?;
        Ok(Some((self.graph.name(tag).to_string(), entry.time)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediatorEvent> {
        self.events.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn status(&self) -> MediatorState {
        self.status
    }

    pub fn current_time(&self) -> TimeValue {
        self.current_time
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn pools(&self) -> &HandlerPools<H> {
        &self.pools
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn stats(&self) -> MediatorStats {
        MediatorStats {
            state: self.status,
            current_time: self.current_time,
            commits: self.commits,
            pending: self.scheduler.size(),
            stored: self.scheduler.physical_len(),
            instances: self.pools.instance_count(),
            per_tag: self
                .graph
                .nodes()
                .map(|node| (node.name.clone(), self.tag_commits[node.id.index()]))
                .collect(),
        }
    }

    /// Captures the scheduling state as plain data.
    pub fn snapshot(&self) -> Snapshot {
        let mut entries: Vec<EntryRecord> = self
            .scheduler
            .live_entries()
            .into_iter()
            .filter_map(|entry| {
                let record = self.pools.record(entry.instance)?;
                Some(EntryRecord {
                    tag: self.graph.name(record.tag).to_string(),
                    ordinal: record.ordinal,
                    time: entry.time,
                    counter: entry.counter,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| a.tag.cmp(&b.tag))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });

        let pools = self
            .graph
            .nodes()
            .map(|node| PoolRecord {
                tag: node.name.clone(),
                counters: self.pools.counters(node.id),
                busy: self.pools.busy_ordinals(node.id),
                enabled: self.activator.is_enabled(node.id),
                commits: self.tag_commits[node.id.index()],
            })
            .collect();

        Snapshot {
            version: SNAPSHOT_VERSION,
            run_id: self.context.run_id(),
            created_at: Utc::now(),
            tags: self.graph.names(),
            current_time: self.current_time,
            last_committed: self.scheduler.last_committed(),
            commits: self.commits,
            pools,
            entries,
        }
    }

    /// Replaces the scheduling state with `snapshot` and resumes `RUNNING`.
    ///
    /// The external state handler is not part of a snapshot; it must already
    /// hold the matching physical state.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        snapshot.check_compatible(&self.graph)?;

        // Everything is rebuilt on copies; `self` is untouched until all checks pass.
        let mut pools = self.pools.clone();
        let mut activator = self.activator.clone();
        for (position, record) in snapshot.pools.iter().enumerate() {
            pools.restore_pool(TagId(position as u16), &record.counters, &record.busy)?;
        }
        activator.restore_enabled(snapshot.pools.iter().map(|record| record.enabled).collect())?;

        let mut entries = Vec::with_capacity(snapshot.entries.len());
        for saved in &snapshot.entries {
            let tag = self.graph.id(&saved.tag).ok_or_else(|| {
                EngineError::snapshot(format!("entry references unknown tag '{}'", saved.tag))
            })?;
            let instance = pools.instance(tag, saved.ordinal).ok_or_else(|| {
                EngineError::snapshot(format!("tag '{}' has no instance {}", saved.tag, saved.ordinal))
            })?;
            let consistent = pools
                .record(instance)
                .is_some_and(|record| record.busy && record.valid_counter == saved.counter);
            if !consistent {
                return Err(EngineError::snapshot(format!(
                    "entry of '{}' instance {} does not match its pool record",
                    saved.tag, saved.ordinal
                )));
            }
            entries.push(ScheduledEntry {
                time: saved.time,
                instance,
                counter: saved.counter,
            });
        }
        let busy: usize = snapshot.pools.iter().map(|record| record.busy.len()).sum();
        if busy != entries.len() {
            return Err(EngineError::snapshot(format!(
                "{busy} busy instances but {} pending entries",
                entries.len()
            )));
        }
        let mut scheduler = build_scheduler(&self.context);
        scheduler.restore(entries, snapshot.last_committed)?;

        self.pools = pools;
        self.activator = activator;
        self.scheduler = scheduler;
        self.current_time = snapshot.current_time;
        self.commits = snapshot.commits;
        self.tag_commits = snapshot.pools.iter().map(|record| record.commits).collect();
        self.status = MediatorState::Running;
        info!(
            run_id = %snapshot.run_id,
            commits = self.commits,
            time = %self.current_time,
            "restored from snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::reference_mediator;
    use crate::config::EngineConfig;

    fn default_mediator() -> Mediator<crate::components::TimeLedger, crate::components::BuiltinHandler> {
        reference_mediator(EngineContext::new(EngineConfig::default())).unwrap()
    }

    #[test]
    fn default_run_ends_at_final_time() {
        let mut mediator = default_mediator();
        let summary = mediator.run().unwrap();
        assert_eq!(summary.reason, TerminationReason::EndOfRun);
        assert_eq!(summary.final_time, TimeValue::from_f64(20.0).unwrap());
        assert_eq!(
            mediator.status(),
            MediatorState::Terminated(TerminationReason::EndOfRun)
        );
        assert!(matches!(mediator.step(), Err(EngineError::NotRunning)));

        let stats = mediator.stats();
        let samples = stats
            .per_tag
            .iter()
            .find(|(name, _)| name == "sample")
            .map(|(_, count)| *count);
        // Samples at 1..=19, plus one more if it wins the tie with "end" at 20.
        assert!(samples.unwrap() >= 19);
    }

    #[test]
    fn stop_handle_ends_the_run_between_commits() {
        let mut mediator = default_mediator();
        let stop = mediator.stop_handle();
        mediator.run_for(3).unwrap();
        stop.stop();
        let summary = mediator.run().unwrap();
        assert_eq!(summary.reason, TerminationReason::Stopped);
        assert_eq!(summary.commits, 3);
    }

    #[test]
    fn empty_scheduler_is_a_deadlock() {
        let config = EngineConfig::from_toml_str(
            r#"
            start_tag = "start"

            [[tags]]
            name = "start"
            kind = { type = "start_of_run" }
            creates = ["once"]

            [[tags]]
            name = "once"
            kind = { type = "constant_displacement", displacement = 1.0 }
            "#,
        )
        .unwrap();
        let mut mediator = reference_mediator(EngineContext::new(config)).unwrap();
        let mut events = mediator.subscribe();
        match mediator.run() {
            Err(EngineError::Deadlock { commits }) => assert_eq!(commits, 2),
            other => panic!("expected a deadlock, got {other:?}"),
        }
        assert_eq!(mediator.status(), MediatorState::Failed);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(MediatorEvent::Started { .. })));
        assert!(matches!(seen.last(), Some(MediatorEvent::Failed { .. })));
        let commits = seen
            .iter()
            .filter(|event| matches!(event, MediatorEvent::Committed { .. }))
            .count();
        assert_eq!(commits, 2);
    }

    #[test]
    fn snapshot_restores_into_a_fresh_mediator() {
        let mut original = default_mediator();
        original.run_for(10).unwrap();
        let snapshot = original.snapshot();

        let mut resumed = default_mediator();
        resumed.restore(&snapshot).unwrap();
        assert_eq!(resumed.status(), MediatorState::Running);
        assert_eq!(resumed.commits(), 10);
        assert_eq!(resumed.scheduler().size(), original.scheduler().size());
        assert_eq!(resumed.peek().unwrap(), original.peek().unwrap());
    }

    #[test]
    fn rejected_restore_leaves_the_mediator_as_it_was() {
        let mut original = default_mediator();
        original.run_for(1).unwrap();
        let mut snapshot = original.snapshot();
        let last = snapshot.entries.len() - 1;
        snapshot.entries[last].counter += 7;

        let mut other = default_mediator();
        assert!(matches!(
            other.restore(&snapshot),
            Err(EngineError::Snapshot { .. })
        ));
        assert_eq!(other.status(), MediatorState::Initializing);
        assert_eq!(other.commits(), 0);
        assert!(other.pools().pools().iter().all(|pool| pool.busy().is_empty()));

        let summary = other.run().unwrap();
        assert_eq!(summary.reason, TerminationReason::EndOfRun);
    }

    #[test]
    fn peek_below_the_last_commit_fails_the_run() {
        let config = EngineConfig::from_toml_str(
            r#"
            start_tag = "start"

            [[tags]]
            name = "start"
            kind = { type = "start_of_run" }
            creates = ["tick"]

            [[tags]]
            name = "tick"
            kind = { type = "constant_displacement", displacement = 1.0 }
            creates = ["tick"]

            [[tags]]
            name = "late"
            kind = { type = "constant_displacement", displacement = 1.0 }
            "#,
        )
        .unwrap();
        let mut mediator = reference_mediator(EngineContext::new(config)).unwrap();
        mediator.run_for(2).unwrap();

        let late = mediator.graph.id("late").unwrap();
        let instance = mediator.pools.acquire_free_instance(late).unwrap();
        mediator
            .scheduler
            .insert(TimeValue::from_f64(0.5).unwrap(), instance, &mediator.pools)
            .unwrap();

        assert!(matches!(
            mediator.peek(),
            Err(EngineError::MonotonicityViolation { .. })
        ));
        assert_eq!(mediator.status(), MediatorState::Failed);
    }

    #[test]
    fn restore_rejects_foreign_snapshots() {
        let mut original = default_mediator();
        original.run_for(2).unwrap();
        let mut snapshot = original.snapshot();
        snapshot.version += 1;
        let mut other = default_mediator();
        assert!(matches!(
            other.restore(&snapshot),
            Err(EngineError::Snapshot { .. })
        ));
    }
}
