//! Configuration for the conveyor core.
//!
//! Loaded by [`ConfigManager`]: an optional TOML file named by
//! `CONVEYOR_CONFIG_PATH`, overridden by `CONVEYOR__`-prefixed environment
//! variables (`CONVEYOR__DATABASE__URL`, `CONVEYOR__EXECUTION__MAX_CONCURRENT_STEPS`,
//! ...). `.env` files are honored via dotenvy. Every field has a code-level
//! default so a bare `DATABASE_URL` is enough to run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ConveyorError, ConveyorResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConveyorConfig {
    pub database: DatabaseConfig,
    pub execution: ExecutionConfig,
    pub backoff: BackoffConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL; falls back to `DATABASE_URL` when unset.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_url(&self) -> ConveyorResult<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        std::env::var("DATABASE_URL").map_err(|_| {
            ConveyorError::Configuration(
                "no database URL configured (set database.url or DATABASE_URL)".to_string(),
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// In-flight step bound per coordinator invocation; additional ready
    /// steps wait for a slot.
    pub max_concurrent_steps: usize,
    /// Deadline applied to a handler invocation when the step template does
    /// not declare its own.
    pub default_step_timeout_seconds: u64,
    /// Upper bound on discovery->execute cycles per coordinator invocation;
    /// remaining work is re-enqueued rather than looped forever.
    pub max_discovery_cycles: u32,
    /// Sequential mode only: stop the batch on the first failure instead of
    /// attempting all siblings.
    pub halt_batch_on_first_failure: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            default_step_timeout_seconds: 300,
            max_discovery_cycles: 100,
            halt_batch_on_first_failure: false,
        }
    }
}

impl ExecutionConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Cap on the exponential window; 30 seconds is normative.
    pub max_backoff_seconds: u32,
    /// Full jitter on scheduled wake-ups; disabled in deterministic tests.
    pub jitter: bool,
    /// Re-enqueue delay while another worker still has steps in progress.
    pub reenqueue_processing_delay_seconds: u32,
    /// Re-enqueue delay when no retry window could be computed.
    pub reenqueue_default_delay_seconds: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_backoff_seconds: 30,
            jitter: true,
            reenqueue_processing_delay_seconds: 2,
            reenqueue_default_delay_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue carrying "process task" messages.
    pub task_queue: String,
    pub visibility_timeout_seconds: u32,
    pub batch_size: i32,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            task_queue: "conveyor_task_processing".to_string(),
            visibility_timeout_seconds: 30,
            batch_size: 10,
            poll_interval_ms: 500,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_timeout_seconds))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Loads and holds the merged configuration.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ConveyorConfig,
}

impl ConfigManager {
    /// Merge defaults, the optional TOML file at `CONVEYOR_CONFIG_PATH`, and
    /// `CONVEYOR__`-prefixed environment overrides.
    pub fn load() -> ConveyorResult<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CONVEYOR_CONFIG_PATH") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CONVEYOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ConveyorError::Configuration(e.to_string()))?
            .try_deserialize::<ConveyorConfig>()
            .map_err(|e| ConveyorError::Configuration(e.to_string()))?;

        Ok(Self { config })
    }

    pub fn from_config(config: ConveyorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConveyorConfig {
        &self.config
    }

    pub fn into_config(self) -> ConveyorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ConveyorConfig::default();
        assert_eq!(config.backoff.max_backoff_seconds, 30);
        assert!(config.execution.max_concurrent_steps >= 1);
        assert_eq!(config.queue.task_queue, "conveyor_task_processing");
        assert!(!config.execution.halt_batch_on_first_failure);
    }

    #[test]
    fn database_url_falls_back_to_env() {
        let config = DatabaseConfig {
            url: Some("postgres://localhost/conveyor".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_url().unwrap(),
            "postgres://localhost/conveyor"
        );
    }
}
