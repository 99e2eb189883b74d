//! Stage parameters.
//!
//! A stage receives its configuration as a set of named parameters
//! produced when the stream graph was translated. They arrive here as
//! JSON and are validated once, at stage initialization.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::StageError;
use crate::errors::StageResult;

/// Default delay between two periodic metric refreshes.
pub const DEFAULT_METRICS_REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn duration(&self, size: u64) -> Duration {
        match self {
            Self::Milliseconds => Duration::from_millis(size),
            Self::Seconds => Duration::from_secs(size),
            Self::Minutes => Duration::from_secs(size.saturating_mul(60)),
            Self::Hours => Duration::from_secs(size.saturating_mul(60 * 60)),
            Self::Days => Duration::from_secs(size.saturating_mul(60 * 60 * 24)),
        }
    }
}

/// A window or trigger policy as it appears in the parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum PolicyParams {
    Count { size: u64 },
    Time { size: u64, unit: TimeUnit },
}

/// When elements leave a window partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Keep at most this many elements, evicting the oldest.
    Count(usize),
    /// Keep only elements younger than this.
    Time(Duration),
}

/// When an aggregation fires over a window partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Fire after every `n` insertions into a partition. A count of
    /// one is per-modification and also fires after time evictions.
    Count(u64),
    /// Fire over every partition on a fixed approximate period.
    Periodic(Duration),
}

impl TriggerPolicy {
    pub const PER_MODIFICATION: Self = Self::Count(1);

    pub fn is_per_modification(&self) -> bool {
        *self == Self::PER_MODIFICATION
    }
}

impl PolicyParams {
    pub fn eviction(&self) -> StageResult<EvictionPolicy> {
        match self {
            Self::Count { size: 0 } | Self::Time { size: 0, .. } => {
                Err(StageError::config("window size must be greater than zero"))
            }
            Self::Count { size } => usize::try_from(*size)
                .map(EvictionPolicy::Count)
                .map_err(|_| StageError::config(format!("window size {size} is too large"))),
            Self::Time { size, unit } => Ok(EvictionPolicy::Time(unit.duration(*size))),
        }
    }

    pub fn trigger(&self) -> StageResult<TriggerPolicy> {
        match self {
            Self::Count { size: 0 } | Self::Time { size: 0, .. } => {
                Err(StageError::config("trigger size must be greater than zero"))
            }
            Self::Count { size } => Ok(TriggerPolicy::Count(*size)),
            Self::Time { size, unit } => Ok(TriggerPolicy::Periodic(unit.duration(*size))),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    #[default]
    Disabled,
    Periodic,
    OperatorDriven,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistentRegion {
    #[default]
    None,
    Member,
    Start,
}

fn default_max_channels() -> i32 {
    1
}

fn default_metrics_refresh_ms() -> u64 {
    DEFAULT_METRICS_REFRESH.as_millis() as u64
}

/// The named parameters of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageParams {
    pub name: String,
    #[serde(default)]
    pub window: Option<PolicyParams>,
    #[serde(default)]
    pub trigger: Option<PolicyParams>,
    /// A partition key function was declared for the window.
    #[serde(default)]
    pub keyed: bool,
    #[serde(default)]
    pub queue_size: Option<usize>,
    /// Input is already delivered by a dedicated thread.
    #[serde(default)]
    pub input_threaded: bool,
    #[serde(default)]
    pub checkpoint: CheckpointMode,
    #[serde(default)]
    pub consistent_region: ConsistentRegion,
    #[serde(default)]
    pub relaunch_count: u32,
    #[serde(default)]
    pub channel: i32,
    #[serde(default = "default_max_channels")]
    pub max_channels: i32,
    #[serde(default = "default_metrics_refresh_ms")]
    pub metrics_refresh_ms: u64,
    #[serde(default)]
    pub submission_params: HashMap<String, String>,
}

impl StageParams {
    /// Parameters for a stage with no window, queue or fault
    /// tolerance.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            window: None,
            trigger: None,
            keyed: false,
            queue_size: None,
            input_threaded: false,
            checkpoint: CheckpointMode::Disabled,
            consistent_region: ConsistentRegion::None,
            relaunch_count: 0,
            channel: 0,
            max_channels: default_max_channels(),
            metrics_refresh_ms: default_metrics_refresh_ms(),
            submission_params: HashMap::new(),
        }
    }

    pub fn from_json(json: &str) -> StageResult<Self> {
        let params: Self = serde_json::from_str(json)
            .map_err(|err| StageError::config(format!("invalid stage parameters: {err}")))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> StageResult<()> {
        if self.name.is_empty() {
            return Err(StageError::config("stage name must not be empty"));
        }
        if let Some(window) = &self.window {
            window.eviction()?;
        }
        if let Some(trigger) = &self.trigger {
            trigger.trigger()?;
        }
        if self.checkpoint == CheckpointMode::OperatorDriven {
            return Err(StageError::config(format!(
                "operator driven checkpointing is not supported by stage {}",
                self.name
            )));
        }
        if self.consistent_region == ConsistentRegion::Start {
            return Err(StageError::config(format!(
                "stage {} cannot be the start of a consistent region",
                self.name
            )));
        }
        if self.metrics_refresh_ms == 0 {
            return Err(StageError::config("metrics refresh period must be greater than zero"));
        }
        Ok(())
    }

    /// Whether logic state has to survive recovery boundaries.
    pub fn is_fault_tolerant(&self) -> bool {
        self.checkpoint != CheckpointMode::Disabled
            || self.consistent_region != ConsistentRegion::None
    }

    /// Capacity of the decoupling queue, if one should be used.
    pub fn queue_capacity(&self) -> Option<usize> {
        match self.queue_size {
            Some(size) if size > 0 && !self.input_threaded => Some(size),
            _ => None,
        }
    }

    pub fn eviction(&self) -> StageResult<EvictionPolicy> {
        self.window
            .as_ref()
            .ok_or_else(|| StageError::config(format!("stage {} has no window", self.name)))?
            .eviction()
    }

    /// Trigger for an aggregate window, per-modification if absent.
    pub fn aggregate_trigger(&self) -> StageResult<TriggerPolicy> {
        self.trigger
            .as_ref()
            .map_or(Ok(TriggerPolicy::PER_MODIFICATION), PolicyParams::trigger)
    }

    pub fn metrics_refresh(&self) -> Duration {
        Duration::from_millis(self.metrics_refresh_ms)
    }
}

/// Values supplied at submission time, shared read-only by every
/// stage in the process.
#[derive(Debug, Clone, Default)]
pub struct ConfigContext {
    submission_params: HashMap<String, String>,
}

impl ConfigContext {
    pub fn new(submission_params: HashMap<String, String>) -> Self {
        Self { submission_params }
    }

    pub fn from_params(params: &StageParams) -> Self {
        Self::new(params.submission_params.clone())
    }

    pub fn raw(&self, name: &str) -> Option<&str> {
        self.submission_params.get(name).map(String::as_str)
    }

    /// Parse a submission parameter.
    pub fn get<V>(&self, name: &str) -> StageResult<V>
    where
        V: FromStr,
        V::Err: Display,
    {
        let value = self.raw(name).ok_or_else(|| {
            StageError::config(format!("Unexpected submission parameter name {name}"))
        })?;
        value.parse().map_err(|err| {
            StageError::config(format!("invalid value {value:?} for submission parameter {name}: {err}"))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.submission_params.keys().map(String::as_str)
    }
}
