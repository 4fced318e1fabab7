//! Versioned, resumable snapshot format.
//!
//! A snapshot is a data contract, not an object dump: times, pending entries
//! addressed by `(tag name, ordinal)`, per-pool valid counters and busy sets,
//! and the tag list they refer to. Instance keys are never written, since
//! they are only meaningful inside one arena.

use crate::common::ValidCounter;
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::time::TimeValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The whole resumable state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Tag names in declaration order. Must match the graph on restore.
    pub tags: Vec<String>,
    pub current_time: TimeValue,
    pub last_committed: Option<TimeValue>,
    pub commits: u64,
    /// One record per tag, in the same order as `tags`.
    pub pools: Vec<PoolRecord>,
    pub entries: Vec<EntryRecord>,
}

/// Saved state of one tag's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub tag: String,
    /// Valid counters indexed by ordinal.
    pub counters: Vec<ValidCounter>,
    /// Ordinals of instances owning a pending entry.
    pub busy: Vec<usize>,
    pub enabled: bool,
    pub commits: u64,
}

/// One pending scheduler entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub tag: String,
    pub ordinal: usize,
    pub time: TimeValue,
    pub counter: ValidCounter,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::snapshot(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::snapshot(e.to_string()))
    }

    /// Writes the snapshot as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)
            .map_err(|e| EngineError::snapshot(format!("writing {}: {e}", path.display())))?;
        info!(path = %path.display(), commits = self.commits, "snapshot written");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::snapshot(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Checks the version and that the snapshot was taken over the same tags.
    pub fn check_compatible(&self, graph: &DependencyGraph) -> Result<(), EngineError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(EngineError::snapshot(format!(
                "version {} is not supported, expected {SNAPSHOT_VERSION}",
                self.version
            )));
        }
        let names = graph.names();
        if self.tags != names {
            return Err(EngineError::snapshot(format!(
                "snapshot tags {:?} do not match graph tags {:?}",
                self.tags, names
            )));
        }
        if self.pools.len() != names.len()
            || self.pools.iter().zip(&names).any(|(pool, name)| &pool.tag != name)
        {
            return Err(EngineError::snapshot(
                "pool records do not line up with the tag list",
            ));
        }
        if let Some(last) = self.last_committed {
            if self.current_time < last {
                return Err(EngineError::snapshot(format!(
                    "current time {} precedes last commit {last}",
                    self.current_time
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::EngineContext;

    fn sample() -> Snapshot {
        let t = |v: f64| TimeValue::from_f64(v).unwrap();
        Snapshot {
            version: SNAPSHOT_VERSION,
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            tags: vec!["start".into(), "tick".into()],
            current_time: t(1.5),
            last_committed: Some(t(1.5)),
            commits: 4,
            pools: vec![
                PoolRecord {
                    tag: "start".into(),
                    counters: vec![0],
                    busy: vec![],
                    enabled: true,
                    commits: 1,
                },
                PoolRecord {
                    tag: "tick".into(),
                    counters: vec![2, 0],
                    busy: vec![0],
                    enabled: true,
                    commits: 3,
                },
            ],
            entries: vec![EntryRecord {
                tag: "tick".into(),
                ordinal: 0,
                time: t(2.0),
                counter: 2,
            }],
        }
    }

    fn graph() -> DependencyGraph {
        let config = EngineConfig::from_toml_str(
            r#"
            start_tag = "start"

            [[tags]]
            name = "start"
            kind = { type = "start_of_run" }
            creates = ["tick"]

            [[tags]]
            name = "tick"
            kind = { type = "fixed_interval", interval = 0.5 }
            pool = 2
            creates = ["tick"]
            "#,
        )
        .unwrap();
        DependencyGraph::new(&EngineContext::new(config)).unwrap()
    }

    #[test]
    fn json_is_plain_inspectable_data() {
        let snapshot = sample();
        let json = snapshot.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["entries"][0]["tag"], "tick");
        assert_eq!(value["current_time"]["quotient"], 1);
        assert_eq!(value["current_time"]["remainder"], 0.5);
        assert_eq!(Snapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn json_keeps_every_remainder_bit() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(11);
        let mut snapshot = sample();
        snapshot.entries = (0..5_000)
            .map(|ordinal| EntryRecord {
                tag: "tick".into(),
                ordinal,
                time: TimeValue::new(rng.gen_range(0..1 << 40), rng.gen::<f64>()).unwrap(),
                counter: 0,
            })
            .collect();

        let back = Snapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        for (saved, loaded) in snapshot.entries.iter().zip(&back.entries) {
            assert_eq!(saved.time.quotient(), loaded.time.quotient());
            assert_eq!(
                saved.time.remainder().to_bits(),
                loaded.time.remainder().to_bits(),
                "remainder of entry {} changed",
                saved.ordinal
            );
        }
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let snapshot = sample();
        snapshot.save(&path).unwrap();
        assert_eq!(Snapshot::load(&path).unwrap(), snapshot);
        assert!(Snapshot::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn compatibility_checks_version_and_tags() {
        let graph = graph();
        sample().check_compatible(&graph).unwrap();

        let mut newer = sample();
        newer.version = SNAPSHOT_VERSION + 1;
        assert!(newer.check_compatible(&graph).is_err());

        let mut renamed = sample();
        renamed.tags[1] = "tock".into();
        assert!(renamed.check_compatible(&graph).is_err());

        let mut shuffled = sample();
        shuffled.pools.swap(0, 1);
        assert!(shuffled.check_compatible(&graph).is_err());
    }

    #[test]
    fn malformed_time_is_rejected_on_load() {
        let json = sample()
            .to_json()
            .unwrap()
            .replace("\"remainder\": 0.5", "\"remainder\": 1.5");
        assert!(matches!(
            Snapshot::from_json(&json),
            Err(EngineError::Snapshot { .. })
        ));
    }
}
