//! The immutable run context handed to every kernel component.
//!
//! There are no process-wide settings: the run identifier, the start stamp and
//! the configuration travel in one `EngineContext` shared through an `Arc`.

use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Read-only facts about the current run.
#[derive(Debug)]
pub struct EngineContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    config: Arc<EngineConfig>,
}

impl EngineContext {
    /// Creates a context for a fresh run with a new random run identifier.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            config: Arc::new(config),
        })
    }

    /// Creates a context that continues an earlier run under its identifier.
    pub fn resumed(config: EngineConfig, run_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            started_at: Utc::now(),
            config: Arc::new(config),
        })
    }

    /// Identifier logged with every run and stored in snapshots.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wall-clock time at which this context was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The static configuration of the run.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
