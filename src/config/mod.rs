//! # Pipeline Configuration
//!
//! Typed configuration for every tunable the orchestrator reads: per-stage
//! dispatch policy, retry backoff, queue visibility, leases and snapshots,
//! worker concurrency, and infrastructure retry.
//!
//! Every section deserializes with defaults, so a deployment file only needs
//! the keys it changes. [`ConfigManager`] layers files and environment
//! overrides on top of [`PipelineConfig::default`].

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::{queues, system, timeouts};
use crate::models::{PartialFailurePolicy, Stage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub stages: StagesConfig,
    pub backoff: BackoffConfig,
    pub policy: PolicyConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub workers: WorkersConfig,
    pub infra_retry: InfraRetryConfig,
    pub database: DatabaseConfig,
}

/// Dispatch policy for every stage that sends work to a queue
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StagesConfig {
    pub metadata_fetch: StageConfig,
    pub enumerate_items: StageConfig,
    pub process_items: StageConfig,
    pub analyze_results: StageConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            metadata_fetch: StageConfig::new(queues::METADATA, timeouts::METADATA_FETCH_SECONDS),
            enumerate_items: StageConfig::new(queues::STORAGE, timeouts::ENUMERATE_ITEMS_SECONDS),
            process_items: StageConfig::new(queues::CV, timeouts::PROCESS_ITEMS_SECONDS),
            analyze_results: StageConfig::new(queues::ML, timeouts::ANALYZE_RESULTS_SECONDS),
        }
    }
}

impl StagesConfig {
    /// Policy for a stage; `None` for Aggregate, which dispatches nothing
    pub fn get(&self, stage: Stage) -> Option<&StageConfig> {
        match stage {
            Stage::MetadataFetch => Some(&self.metadata_fetch),
            Stage::EnumerateItems => Some(&self.enumerate_items),
            Stage::ProcessItems => Some(&self.process_items),
            Stage::AnalyzeResults => Some(&self.analyze_results),
            Stage::Aggregate => None,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> Option<&mut StageConfig> {
        match stage {
            Stage::MetadataFetch => Some(&mut self.metadata_fetch),
            Stage::EnumerateItems => Some(&mut self.enumerate_items),
            Stage::ProcessItems => Some(&mut self.process_items),
            Stage::AnalyzeResults => Some(&mut self.analyze_results),
            Stage::Aggregate => None,
        }
    }

    /// Dispatching stages and their policies, in pipeline order
    pub fn iter(&self) -> impl Iterator<Item = (Stage, &StageConfig)> {
        Stage::ALL
            .into_iter()
            .filter_map(move |stage| self.get(stage).map(|config| (stage, config)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StageConfig {
    pub queue_name: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    /// Stage-specific backoff; falls back to the global `backoff` section
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffConfig>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::new(queues::CV, timeouts::PROCESS_ITEMS_SECONDS)
    }
}

impl StageConfig {
    pub fn new(queue_name: &str, timeout_seconds: u64) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            timeout_seconds,
            max_attempts: system::DEFAULT_MAX_ATTEMPTS,
            backoff: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

/// Delay between a failed attempt and its retry
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay that may be added as jitter, in [0, 1)
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Captured into each run record at submission
    pub partial_failure: PartialFailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub visibility_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub results_queue_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: system::DEFAULT_VISIBILITY_TIMEOUT_SECONDS,
            poll_interval_ms: system::DEFAULT_POLL_INTERVAL_MS,
            results_queue_name: queues::RESULTS.to_string(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub lease_duration_seconds: u64,
    /// Take a snapshot after this many events since the previous one
    pub snapshot_interval_events: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lease_duration_seconds: system::DEFAULT_LEASE_SECONDS,
            snapshot_interval_events: system::DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl StoreConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub deadline_tick_ms: u64,
    pub max_conflict_retries: u32,
    pub status_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deadline_tick_ms: system::DEFAULT_DEADLINE_TICK_MS,
            max_conflict_retries: system::DEFAULT_MAX_CONFLICT_RETRIES,
            status_poll_interval_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn deadline_tick(&self) -> Duration {
        Duration::from_millis(self.deadline_tick_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub default_concurrency: usize,
    /// Consumer count keyed by queue name
    pub per_queue: HashMap<String, usize>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            default_concurrency: system::DEFAULT_WORKER_CONCURRENCY,
            per_queue: HashMap::new(),
        }
    }
}

impl WorkersConfig {
    pub fn concurrency_for(&self, queue_name: &str) -> usize {
        self.per_queue
            .get(queue_name)
            .copied()
            .unwrap_or(self.default_concurrency)
    }
}

/// Retry of store/queue calls that fail for infrastructure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InfraRetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for InfraRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Only the Postgres backends read this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl PipelineConfig {
    /// Effective backoff for a stage
    pub fn backoff_for(&self, stage: Stage) -> &BackoffConfig {
        self.stages
            .get(stage)
            .and_then(|config| config.backoff.as_ref())
            .unwrap_or(&self.backoff)
    }

    /// Every queue the pipeline uses, stage queues first
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stages
            .iter()
            .map(|(_, config)| config.queue_name.clone())
            .collect();
        names.push(self.queue.results_queue_name.clone());
        names
    }

    /// Validate configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen: Vec<(&str, Stage)> = Vec::new();

        for (stage, config) in self.stages.iter() {
            let field = |key: &str| format!("stages.{stage}.{key}");

            if config.queue_name.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    field("queue_name"),
                    "stage configuration",
                ));
            }
            if config.max_attempts == 0 {
                return Err(ConfigurationError::invalid_value(
                    field("max_attempts"),
                    "0",
                    "every task needs at least one attempt",
                ));
            }
            if config.timeout_seconds == 0 {
                return Err(ConfigurationError::invalid_value(
                    field("timeout_seconds"),
                    "0",
                    "timeout must be greater than 0",
                ));
            }
            if let Some(backoff) = &config.backoff {
                validate_backoff(&field("backoff"), backoff)?;
            }

            if let Some((_, other)) = seen.iter().find(|(name, _)| *name == config.queue_name) {
                return Err(ConfigurationError::duplicate_queue(
                    config.queue_name.clone(),
                    other.as_str(),
                    stage.as_str(),
                ));
            }
            seen.push((config.queue_name.as_str(), stage));
        }

        let results = self.queue.results_queue_name.as_str();
        if results.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "queue.results_queue_name",
                "queue configuration",
            ));
        }
        if let Some((_, stage)) = seen.iter().find(|(queue, _)| *queue == results) {
            return Err(ConfigurationError::duplicate_queue(
                results,
                stage.as_str(),
                "results",
            ));
        }

        validate_backoff("backoff", &self.backoff)?;

        if self.queue.visibility_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.visibility_timeout_seconds",
                "0",
                "visibility timeout must be greater than 0",
            ));
        }
        if self.store.lease_duration_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "store.lease_duration_seconds",
                "0",
                "lease duration must be greater than 0",
            ));
        }
        if self.store.snapshot_interval_events == 0 {
            return Err(ConfigurationError::invalid_value(
                "store.snapshot_interval_events",
                "0",
                "snapshot interval must be greater than 0",
            ));
        }
        if self.engine.deadline_tick_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.deadline_tick_ms",
                "0",
                "deadline tick must be greater than 0",
            ));
        }
        if self.workers.default_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "workers.default_concurrency",
                "0",
                "each queue needs at least one consumer",
            ));
        }

        Ok(())
    }
}

fn validate_backoff(field: &str, backoff: &BackoffConfig) -> ConfigResult<()> {
    if !(0.0..1.0).contains(&backoff.jitter_fraction) {
        return Err(ConfigurationError::invalid_value(
            format!("{field}.jitter_fraction"),
            backoff.jitter_fraction.to_string(),
            "jitter fraction must be in [0, 1)",
        ));
    }
    if backoff.strategy == BackoffStrategy::Exponential && backoff.multiplier < 1.0 {
        return Err(ConfigurationError::invalid_value(
            format!("{field}.multiplier"),
            backoff.multiplier.to_string(),
            "exponential multiplier must be at least 1.0",
        ));
    }
    if backoff.max_delay_ms < backoff.initial_delay_ms {
        return Err(ConfigurationError::invalid_value(
            format!("{field}.max_delay_ms"),
            backoff.max_delay_ms.to_string(),
            "max delay must not be below the initial delay",
        ));
    }
    Ok(())
}
