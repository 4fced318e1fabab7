//! End-to-end runs over small hand-written tag graphs.

use eventchain::config::HandlerKindConfig;
use eventchain::prelude::*;

/// Records every committed tag with its time.
#[derive(Debug, Default)]
struct Trace {
    log: Vec<String>,
}

impl StateHandler for Trace {
    type Identifier = String;
    type InState = String;
    type OutState = String;

    fn candidate_identifiers(&self, tag: &str) -> Vec<Vec<String>> {
        vec![vec![tag.to_string()]]
    }

    fn extract(&self, identifiers: &[String]) -> String {
        identifiers.concat()
    }

    fn apply(&mut self, tag: String) -> Result<(), HandlerError> {
        self.log.push(tag);
        Ok(())
    }
}

/// Fires a constant delay after the current time and reports its tag.
#[derive(Debug, Clone)]
struct Delay {
    tag: String,
    delay: f64,
}

impl PoolMember for Delay {}

impl EventHandler<Trace> for Delay {
    fn compute_candidate_time(
        &mut self,
        _in_state: &String,
        current_time: TimeValue,
    ) -> Result<TimeValue, HandlerError> {
        current_time
            .add(self.delay)
            .map_err(|e| HandlerError::new(e.to_string()))
    }

    fn compute_out_state(&mut self, _state: &Trace, time: TimeValue) -> Result<String, HandlerError> {
        // The time is stamped here because `apply` only sees the out-state.
        Ok(format!("{}@{}", self.tag, time.as_f64()))
    }
}

fn delay_for(tag: &eventchain::config::TagConfig) -> Result<Delay, EngineError> {
    let delay = match tag.kind {
        HandlerKindConfig::ConstantDisplacement { displacement } => displacement,
        _ => 0.0,
    };
    Ok(Delay {
        tag: tag.name.clone(),
        delay,
    })
}

fn mediator(toml: &str) -> Result<Mediator<Trace, Delay>, EngineError> {
    let config = EngineConfig::from_toml_str(toml)?;
    Mediator::from_config(EngineContext::new(config), Trace::default(), delay_for)
}

fn committed(mediator: &Mediator<Trace, Delay>) -> Vec<String> {
    mediator.state().log.clone()
}

const TRASH_AND_RECREATE: &str = r#"
    start_tag = "start"
    end_tag = "end"

    [[tags]]
    name = "start"
    kind = { type = "start_of_run" }
    creates = ["a", "b"]

    [[tags]]
    name = "a"
    kind = { type = "constant_displacement", displacement = 0.25 }
    trashes = ["b"]
    creates = ["b", "end"]

    [[tags]]
    name = "b"
    kind = { type = "constant_displacement", displacement = 0.5 }

    [[tags]]
    name = "end"
    kind = { type = "constant_displacement", displacement = 4.0 }
"#;

#[test]
fn trashed_candidate_is_replaced_by_a_fresh_one() {
    let mut mediator = mediator(TRASH_AND_RECREATE).unwrap();
    let mut events = mediator.subscribe();
    let summary = mediator.run().unwrap();

    // The b scheduled by start at 0.5 never commits; the one created by a does.
    assert_eq!(
        committed(&mediator),
        vec!["start@0", "a@0.25", "b@0.75", "end@4.25"]
    );
    assert_eq!(summary.reason, TerminationReason::EndOfRun);
    assert_eq!(summary.commits, 4);

    let mut trashed = 0;
    while let Ok(event) = events.try_recv() {
        if let MediatorEvent::Trashed { count, .. } = event {
            trashed += count;
        }
    }
    assert_eq!(trashed, 1);
}

#[test]
fn same_run_on_the_list_scheduler() {
    let toml = format!("scheduler = \"list\"\n{TRASH_AND_RECREATE}");
    let mut mediator = mediator(&toml).unwrap();
    assert_eq!(mediator.scheduler().kind(), SchedulerKind::List);
    mediator.run().unwrap();
    assert_eq!(
        committed(&mediator),
        vec!["start@0", "a@0.25", "b@0.75", "end@4.25"]
    );
}

const OVERLAPPING: &str = r#"
    start_tag = "start"
    end_tag = "end"

    [[tags]]
    name = "start"
    kind = { type = "start_of_run" }
    creates = ["a", "b"]

    [[tags]]
    name = "a"
    kind = { type = "constant_displacement", displacement = 0.1 }
    creates = ["b", "end"]

    [[tags]]
    name = "b"
    kind = { type = "constant_displacement", displacement = 1.0 }
    pool = POOL

    [[tags]]
    name = "end"
    kind = { type = "constant_displacement", displacement = 5.0 }
"#;

#[test]
fn second_pending_candidate_exhausts_a_single_instance_pool() {
    let mut mediator = mediator(&OVERLAPPING.replace("POOL", "1")).unwrap();
    match mediator.run() {
        Err(EngineError::PoolExhausted { tag, capacity }) => {
            assert_eq!(tag, "b");
            assert_eq!(capacity, 1);
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    assert_eq!(mediator.status(), MediatorState::Failed);
}

#[test]
fn unbounded_pool_absorbs_the_overlap() {
    let mut mediator = mediator(&OVERLAPPING.replace("POOL", "\"unbounded\"")).unwrap();
    let summary = mediator.run().unwrap();
    assert_eq!(summary.reason, TerminationReason::EndOfRun);
    assert_eq!(
        committed(&mediator),
        vec!["start@0", "a@0.1", "b@1", "b@1.1", "end@5.1"]
    );
    let b = mediator.graph().id("b").unwrap();
    assert_eq!(mediator.pools().pool(b).members().len(), 2);
}

#[test]
fn reference_to_an_undeclared_tag_is_rejected() {
    let toml = TRASH_AND_RECREATE.replace("trashes = [\"b\"]", "trashes = [\"ghost\"]");
    match mediator(&toml) {
        Err(EngineError::UnknownTag {
            owner,
            list,
            referenced,
        }) => {
            assert_eq!(owner, "a");
            assert_eq!(list, "trashes");
            assert_eq!(referenced, "ghost");
        }
        other => panic!("expected UnknownTag, got {:?}", other.err()),
    }
}

const TICKER: &str = r#"
    start_tag = "start"
    end_tag = "end"

    [[tags]]
    name = "start"
    kind = { type = "start_of_run" }
    creates = ["tick", "end"]

    [[tags]]
    name = "tick"
    kind = { type = "constant_displacement", displacement = 0.25 }
    creates = ["tick"]

    [[tags]]
    name = "end"
    kind = { type = "constant_displacement", displacement = 3.1 }
"#;

#[test]
fn snapshot_file_resumes_the_same_run() {
    let mut original = mediator(TICKER).unwrap();
    original.run_for(5).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ticker.json");
    original.snapshot().save(&path).unwrap();

    let mut resumed = mediator(TICKER).unwrap();
    resumed.restore(&Snapshot::load(&path).unwrap()).unwrap();
    assert_eq!(resumed.current_time(), original.current_time());

    let expected = original.run().unwrap();
    let summary = resumed.run().unwrap();
    assert_eq!(summary, expected);
    assert_eq!(summary.final_time, TimeValue::from_f64(3.1).unwrap());
    // start, twelve ticks up to 3.0, end.
    assert_eq!(summary.commits, 14);
}

#[test]
fn reference_run_reaches_its_final_time() {
    let mut mediator = reference_mediator(EngineContext::new(EngineConfig::default())).unwrap();
    let summary = mediator.run().unwrap();
    assert_eq!(summary.reason, TerminationReason::EndOfRun);
    assert_eq!(summary.final_time, TimeValue::from_f64(20.0).unwrap());
    assert!(mediator.state().finished);
    assert!(mediator.state().chains_ended >= 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinator_commits_what_the_mediator_commits() {
    let mut sequential = mediator(TRASH_AND_RECREATE).unwrap();
    let expected = sequential.run().unwrap();

    let mut coordinator = Coordinator::new(mediator(TRASH_AND_RECREATE).unwrap(), 3);
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary, expected);
    assert_eq!(committed(coordinator.mediator()), committed(&sequential));
}
