//! # Resilience Module
//!
//! Retry with exponential backoff for store and queue calls that fail
//! because the backend is unreachable. These retries happen below the task
//! retry policy and never consume a task's attempt budget.

pub mod retry;

pub use retry::{with_infra_retry, InfraFailure};
