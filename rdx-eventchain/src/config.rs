//! Defines all configuration structures for the Eventchain kernel.
//!
//! These structs are deserialized from a TOML file with the `config` crate.
//! The tag set, pool sizes and the creation/trash/activation lists form the
//! static dependency graph of a run, so the whole causal wiring is defined
//! outside of application code.

use crate::error::EngineError;
use serde::Deserialize;
use std::path::Path;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "EVENTCHAIN";

/// The top-level configuration of a run.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Which priority structure backs the scheduler.
    #[serde(default)]
    pub scheduler: SchedulerKind,

    /// What to do when two consecutive commits share the same time.
    #[serde(default)]
    pub unchanged_minimum: UnchangedMinimumPolicy,

    /// Fraction of stale entries above which the scheduler compacts itself
    /// after an invalidation.
    #[serde(default = "default_compaction_ratio")]
    pub compaction_ratio: f64,

    /// Valid-counter value at which an instance is purged from the scheduler
    /// and its counter reset to zero.
    #[serde(default = "default_counter_reset_threshold")]
    pub counter_reset_threshold: u32,

    /// Tag run once to bootstrap the initial candidates.
    pub start_tag: String,

    /// Tag whose commit ends the run.
    #[serde(default)]
    pub end_tag: Option<String>,

    /// Every tag of the run, in declaration order.
    pub tags: Vec<TagConfig>,

    /// Settings of the reference state handler.
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Selects the scheduler implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Binary min-heap with lazy deletion.
    #[default]
    Heap,
    /// Unordered list scanned on every removal.
    List,
}

/// Policy for a global minimum that does not advance between two commits.
///
/// Zero-length chains legitimately produce this, so the default only warns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnchangedMinimumPolicy {
    /// Say nothing.
    Ignore,
    /// Log a warning and continue.
    #[default]
    Warn,
    /// Abort the run.
    Error,
}

/// Declares one tag: its handler kind, pool and dependency lists.
#[derive(Debug, Clone, Deserialize)]
pub struct TagConfig {
    /// Unique tag name, referenced by the dependency lists.
    pub name: String,

    /// Which handler kind the pool instances are cloned from.
    pub kind: HandlerKindConfig,

    /// Number of cloned instances.
    #[serde(default)]
    pub pool: PoolSize,

    /// Tags asked for new candidates after this tag commits, in order.
    #[serde(default)]
    pub creates: Vec<String>,

    /// Tags whose pending candidates become stale after this tag commits.
    #[serde(default)]
    pub trashes: Vec<String>,

    /// Tags enabled after this tag commits.
    #[serde(default)]
    pub activates: Vec<String>,

    /// Tags disabled after this tag commits. A disabled tag creates nothing.
    #[serde(default)]
    pub deactivates: Vec<String>,

    /// Whether the tag creates candidates before any activation list touches it.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Size of a tag's handler pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "PoolSizeRepr")]
pub enum PoolSize {
    /// Exactly this many instances; one more concurrent acquire is fatal.
    Bounded(usize),
    /// Grows on demand.
    Unbounded,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PoolSizeRepr {
    Count(usize),
    Word(String),
}

impl TryFrom<PoolSizeRepr> for PoolSize {
    type Error = String;

    fn try_from(repr: PoolSizeRepr) -> Result<Self, Self::Error> {
        match repr {
            PoolSizeRepr::Count(0) => Err("pool size must be at least 1".to_string()),
            PoolSizeRepr::Count(n) => Ok(PoolSize::Bounded(n)),
            PoolSizeRepr::Word(word) if word.eq_ignore_ascii_case("unbounded") => {
                Ok(PoolSize::Unbounded)
            }
            PoolSizeRepr::Word(word) => Err(format!(
                "pool size '{word}' is neither a number nor \"unbounded\""
            )),
        }
    }
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::Bounded(1)
    }
}

/// Typed description of a built-in handler kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerKindConfig {
    /// Fires once at the current time to bootstrap the run.
    StartOfRun,
    /// Fires every `interval` after its own previous firing.
    FixedInterval { interval: f64 },
    /// Fires a constant `displacement` after the current time.
    ConstantDisplacement { displacement: f64 },
    /// Fires after an exponentially distributed displacement.
    Exponential {
        rate: f64,
        #[serde(default)]
        seed: u64,
    },
    /// Ends the current chain `chain_length` after the current time.
    EndOfChain { chain_length: f64 },
    /// Fires at the absolute time `end_time`.
    FinalTime { end_time: f64 },
}

/// Settings of the reference `TimeLedger` state handler.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Number of units the active label rotates over.
    #[serde(default = "default_units")]
    pub units: usize,

    /// Tags that get one candidate per inactive unit instead of a single one.
    #[serde(default)]
    pub fan_out: Vec<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            units: default_units(),
            fan_out: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file, applying `EVENTCHAIN_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        let parsed: Self = settings
            .try_deserialize()
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        let parsed: Self = settings
            .try_deserialize()
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Checks the scalar settings. Graph consistency is checked by `DependencyGraph`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.compaction_ratio > 0.0 && self.compaction_ratio <= 1.0) {
            return Err(EngineError::configuration(format!(
                "compaction_ratio {} must be in (0, 1]",
                self.compaction_ratio
            )));
        }
        if self.counter_reset_threshold == 0 {
            return Err(EngineError::configuration(
                "counter_reset_threshold must be at least 1",
            ));
        }
        if self.tags.is_empty() {
            return Err(EngineError::configuration("at least one tag must be declared"));
        }
        if self.ledger.units == 0 {
            return Err(EngineError::configuration("ledger.units must be at least 1"));
        }
        Ok(())
    }

    /// Looks up a tag declaration by name.
    pub fn tag(&self, name: &str) -> Option<&TagConfig> {
        self.tags.iter().find(|tag| tag.name == name)
    }
}

// A small, runnable graph used when no configuration file is given.
impl Default for EngineConfig {
    fn default() -> Self {
        let tag = |name: &str, kind: HandlerKindConfig, pool: PoolSize| TagConfig {
            name: name.to_string(),
            kind,
            pool,
            creates: Vec::new(),
            trashes: Vec::new(),
            activates: Vec::new(),
            deactivates: Vec::new(),
            enabled: true,
        };
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let mut start = tag("start", HandlerKindConfig::StartOfRun, PoolSize::Bounded(1));
        start.creates = names(&["displacement", "chain_end", "sample", "end"]);

        let mut displacement = tag(
            "displacement",
            HandlerKindConfig::Exponential { rate: 1.0, seed: 7 },
            PoolSize::Bounded(3),
        );
        displacement.creates = names(&["displacement"]);
        displacement.trashes = names(&["displacement"]);

        let mut chain_end = tag(
            "chain_end",
            HandlerKindConfig::EndOfChain { chain_length: 2.5 },
            PoolSize::Bounded(1),
        );
        chain_end.creates = names(&["displacement", "chain_end"]);
        chain_end.trashes = names(&["displacement"]);

        let mut sample = tag(
            "sample",
            HandlerKindConfig::FixedInterval { interval: 1.0 },
            PoolSize::Bounded(1),
        );
        sample.creates = names(&["sample"]);

        let end = tag(
            "end",
            HandlerKindConfig::FinalTime { end_time: 20.0 },
            PoolSize::Bounded(1),
        );

        Self {
            scheduler: SchedulerKind::Heap,
            unchanged_minimum: UnchangedMinimumPolicy::Warn,
            compaction_ratio: default_compaction_ratio(),
            counter_reset_threshold: default_counter_reset_threshold(),
            start_tag: "start".to_string(),
            end_tag: Some("end".to_string()),
            tags: vec![start, displacement, chain_end, sample, end],
            ledger: LedgerConfig {
                units: 4,
                fan_out: names(&["displacement"]),
            },
        }
    }
}

// --- Default value functions for serde ---

fn default_compaction_ratio() -> f64 {
    0.5
}

fn default_counter_reset_threshold() -> u32 {
    u32::MAX - 1
}

fn default_enabled() -> bool {
    true
}

fn default_units() -> usize {
    1
}
