//! # System Constants
//!
//! Default names and limits shared between configuration, the engine and the
//! queue backends.

/// Default queue names, one per dispatching stage
pub mod queues {
    pub const METADATA: &str = "metadata-queue";
    pub const STORAGE: &str = "storage-queue";
    pub const CV: &str = "cv-queue";
    pub const ML: &str = "ml-queue";
    /// Channel workers report outcomes on
    pub const RESULTS: &str = "pipeline-results";
}

/// Default timeouts in seconds, per stage
pub mod timeouts {
    pub const METADATA_FETCH_SECONDS: u64 = 5 * 60;
    pub const ENUMERATE_ITEMS_SECONDS: u64 = 5 * 60;
    pub const PROCESS_ITEMS_SECONDS: u64 = 30 * 60;
    pub const ANALYZE_RESULTS_SECONDS: u64 = 60 * 60;
}

/// Engine and store defaults
pub mod system {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_LEASE_SECONDS: u64 = 30;
    pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 500;
    pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: u64 = 60;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
    pub const DEFAULT_DEADLINE_TICK_MS: u64 = 1000;
    pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;
    pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
    /// Prefix for run ids derived from a dataset id
    pub const DATASET_RUN_PREFIX: &str = "dataset-";
}

/// Environment variables consulted at startup
pub mod env {
    pub const ENVIRONMENT: &str = "PIPELINE_ENV";
    pub const CONFIG_DIR: &str = "PIPELINE_CONFIG_DIR";
    pub const LOG_FORMAT: &str = "PIPELINE_LOG_FORMAT";
    /// Prefix for `PIPELINE__SECTION__KEY` overrides
    pub const OVERRIDE_PREFIX: &str = "PIPELINE";
}
