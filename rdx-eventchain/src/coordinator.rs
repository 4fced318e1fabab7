//! Distributed candidate computation.
//!
//! The [`Coordinator`] drives the same commit and activation cycle as the
//! [`Mediator`], but hands candidate-time computations to blocking worker
//! tasks. Each worker owns a clone of its instance's handler; the clone comes
//! back with the result and replaces the pooled one.
//!
//! Every computation dispatched for a commit is awaited before the next
//! minimum is looked up. Results are inserted in request order, so a run is
//! reproducible no matter how the workers are scheduled. A result for an
//! instance that was trashed while it was in flight is dropped.

use crate::activator::CandidateRequest;
use crate::common::{InstanceId, TagId, ValidCounter, ValidCounters};
use crate::error::{EngineError, HandlerError};
use crate::events::TerminationReason;
use crate::handler::{EventHandler, StateHandler};
use crate::mediator::{Mediator, MediatorState, RunSummary, StepOutcome};
use crate::time::TimeValue;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// A finished computation, with the handler clone that produced it.
struct WorkResult<H> {
    sequence: usize,
    tag: TagId,
    instance: InstanceId,
    counter: ValidCounter,
    handler: H,
    outcome: Result<TimeValue, HandlerError>,
}

/// Runs a [`Mediator`] with candidate times computed on worker tasks.
pub struct Coordinator<S: StateHandler, H: EventHandler<S>> {
    mediator: Mediator<S, H>,
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl<S, H> Coordinator<S, H>
where
    S: StateHandler,
    H: EventHandler<S> + Send + 'static,
{
    /// Wraps `mediator`, allowing at most `workers` computations in flight.
    pub fn new(mediator: Mediator<S, H>, workers: usize) -> Self {
        let max_workers = workers.max(1);
        Self {
            mediator,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn mediator(&self) -> &Mediator<S, H> {
        &self.mediator
    }

    pub fn mediator_mut(&mut self) -> &mut Mediator<S, H> {
        &mut self.mediator
    }

    pub fn into_inner(self) -> Mediator<S, H> {
        self.mediator
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Bootstraps the start tag through the workers.
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        if self.mediator.status != MediatorState::Initializing {
            return Err(EngineError::illegal("mediator is already initialized"));
        }
        info!(
            run_id = %self.mediator.context.run_id(),
            workers = self.max_workers,
            "coordinator starting"
        );
        let start = self.mediator.graph.start();
        self.mediator.activator.apply_switches(&self.mediator.graph, start);
        match self.create(&[start]).await {
            Ok(_) => {
                self.mediator.mark_started();
                Ok(())
            }
            Err(err) => Err(self.mediator.failed(err)),
        }
    }

    /// One commit followed by a distributed activation.
    pub async fn step(&mut self) -> Result<StepOutcome, EngineError> {
        match self.mediator.status {
            MediatorState::Initializing => self.initialize().await?,
            MediatorState::Running => {}
            MediatorState::Terminated(_) | MediatorState::Failed => {
                return Err(EngineError::NotRunning)
            }
        }
        if self.mediator.stop_requested() {
            return Ok(self.mediator.terminate(TerminationReason::Stopped));
        }

        let commit = self.mediator.guard(|m| m.commit_next())?;
        if self.mediator.graph.end() == Some(commit.tag) {
            return Ok(self.mediator.terminate(TerminationReason::EndOfRun));
        }

        let m = &mut self.mediator;
        m.activator.apply_switches(&m.graph, commit.tag);
        let trashed = m
            .activator
            .trash(&m.graph, commit.tag, &mut m.pools, m.scheduler.as_mut());
        m.notify_trashed(commit.tag, trashed.len());

        let creates = m.graph.creates(commit.tag).to_vec();
        if let Err(err) = self.create(&creates).await {
            return Err(self.mediator.failed(err));
        }
        Ok(StepOutcome::Committed {
            tag: commit.tag,
            time: commit.time,
        })
    }

    /// Steps until the run terminates or fails.
    pub async fn run(&mut self) -> Result<RunSummary, EngineError> {
        loop {
            if let StepOutcome::Terminated(reason) = self.step().await? {
                return Ok(self.mediator.summary(reason));
            }
        }
    }

    /// Prepares, dispatches and accepts candidates for `tags`.
    async fn create(&mut self, tags: &[TagId]) -> Result<usize, EngineError> {
        let m = &mut self.mediator;
        let requests = m
            .activator
            .prepare_requests(&m.graph, tags, &m.state, &mut m.pools)?;
        if requests.is_empty() {
            return Ok(0);
        }

        let mut jobs = Vec::with_capacity(requests.len());
        for request in requests {
            let handler = m.pools.handler(request.instance).cloned().ok_or_else(|| {
                EngineError::illegal(format!("instance {:?} vanished", request.instance))
            })?;
            jobs.push((request, handler));
        }
        let results = dispatch::<S, H>(self.workers.clone(), jobs, m.current_time).await?;
        self.accept_all(results)
    }

    fn accept_all(&mut self, results: Vec<WorkResult<H>>) -> Result<usize, EngineError> {
        let m = &mut self.mediator;
        let mut created = 0;
        for result in results {
            if m.pools.valid_counter(result.instance) != Some(result.counter) {
                debug!(
                    tag = m.graph.name(result.tag),
                    instance = ?result.instance,
                    "dropping late result of a trashed instance"
                );
                continue;
            }
            let time = result.outcome.map_err(|source| EngineError::HandlerFailed {
                tag: m.graph.name(result.tag).to_string(),
                source,
            })?;
            m.pools.replace_handler(result.instance, result.handler);
            if m.activator.accept(
                &m.graph,
                &m.pools,
                m.scheduler.as_mut(),
                result.tag,
                result.instance,
                result.counter,
                time,
            )? {
                created += 1;
            }
        }
        Ok(created)
    }
}

/// Computes every job on a blocking worker and returns the results in job
/// order.
async fn dispatch<S, H>(
    workers: Arc<Semaphore>,
    jobs: Vec<(CandidateRequest<S::InState>, H)>,
    now: TimeValue,
) -> Result<Vec<WorkResult<H>>, EngineError>
where
    S: StateHandler,
    H: EventHandler<S> + Send + 'static,
{
    let expected = jobs.len();
    let mut set = JoinSet::new();
    for (sequence, (request, mut handler)) in jobs.into_iter().enumerate() {
        let permit = workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::illegal(format!("worker pool closed: {e}")))?;
        set.spawn_blocking(move || {
            let outcome = handler.compute_candidate_time(&request.in_state, now);
            drop(permit);
            WorkResult {
                sequence,
                tag: request.tag,
                instance: request.instance,
                counter: request.counter,
                handler,
                outcome,
            }
        });
    }

    let mut results = Vec::with_capacity(expected);
    while let Some(joined) = set.join_next().await {
        let result =
            joined.map_err(|e| EngineError::illegal(format!("candidate worker failed: {e}")))?;
        results.push(result);
    }
    results.sort_by_key(|result| result.sequence);
    debug!(count = results.len(), "candidate computations returned");
    Ok(results)
}
