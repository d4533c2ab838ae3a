//! Engine Configuration
//!
//! Tunables for the orchestration engine, loaded from an optional YAML
//! file. Every field has a default so an empty file (or no file) is valid.
//!
//! # Example
//!
//! ```yaml
//! workers: 8
//! task_timeout_secs: 600
//! dispatch_max_attempts: 5
//! retention_ttl_secs: 86400
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file, resolved once per process.
///
/// Priority: `PLANRUNNER_CONFIG` env var, then `planrunner.yaml` next to
/// the executable, then `planrunner.yaml` in the current directory.
pub static DEFAULT_CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(path) = std::env::var("PLANRUNNER_CONFIG") {
        debug!("Using config from PLANRUNNER_CONFIG: {}", path);
        return PathBuf::from(path);
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let prod_path = exe_dir.join("planrunner.yaml");
            if prod_path.exists() {
                debug!("Using config next to executable: {}", prod_path.display());
                return prod_path;
            }
        }
    }

    PathBuf::from("planrunner.yaml")
});

/// Configuration for the engine and its background loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of queue consumers the binary starts.
    pub workers: usize,

    /// Deadline for TASK nodes that do not declare their own timeout.
    pub task_timeout_secs: u64,

    /// Deadline for ASYNC nodes that do not declare their own timeout.
    pub async_timeout_secs: u64,

    /// Deadline for nodes waiting on manual intervention.
    pub intervention_timeout_secs: u64,

    /// Total submission attempts before a transport error fails the step.
    pub dispatch_max_attempts: u32,

    /// Base backoff between submission attempts; doubled each attempt.
    pub dispatch_backoff_ms: u64,

    /// Interval of the expiry / retention sweep.
    pub sweep_interval_ms: u64,

    /// How long records stay queryable after their plan finishes.
    pub retention_ttl_secs: u64,

    /// Delivery attempts per event listener before the event is dropped.
    pub event_delivery_attempts: u32,

    /// Time an unacknowledged message stays invisible before redelivery.
    pub queue_visibility_timeout_secs: u64,

    /// Re-read bound when a compare-and-swap keeps conflicting.
    pub max_conflict_retries: u32,

    /// Deliveries of one message before it is dropped as poisoned.
    pub max_message_deliveries: u32,

    /// Directory holding execution snapshots.
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            task_timeout_secs: 300,
            async_timeout_secs: 3600,
            intervention_timeout_secs: 3600,
            dispatch_max_attempts: 3,
            dispatch_backoff_ms: 200,
            sweep_interval_ms: 1000,
            retention_ttl_secs: 30 * 24 * 3600,
            event_delivery_attempts: 3,
            queue_visibility_timeout_secs: 30,
            max_conflict_retries: 8,
            max_message_deliveries: 5,
            state_dir: PathBuf::from(".planrunner"),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Loads the default config file if it exists, otherwise defaults.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = &*DEFAULT_CONFIG_PATH;
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config file at {} - using defaults", path.display());
            Ok(Self::default())
        }
    }

    fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.dispatch_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatch_max_attempts must be at least 1".into(),
            ));
        }
        if self.event_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "event_delivery_attempts must be at least 1".into(),
            ));
        }
        if self.max_conflict_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_conflict_retries must be at least 1".into(),
            ));
        }
        if self.max_message_deliveries == 0 {
            return Err(ConfigError::Invalid(
                "max_message_deliveries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_secs(self.async_timeout_secs)
    }

    pub fn intervention_timeout(&self) -> Duration {
        Duration::from_secs(self.intervention_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retention_ttl(&self) -> Duration {
        Duration::from_secs(self.retention_ttl_secs)
    }

    pub fn queue_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_timeout_secs)
    }

    /// Backoff before submission attempt `attempt` (1-based, after a failure).
    pub fn dispatch_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.dispatch_backoff_ms.saturating_mul(factor))
    }
}
