//! Crate-level error taxonomy.
//!
//! Each layer owns a structured error type ([`StoreError`], [`MessagingError`],
//! [`ConfigurationError`], [`ReplayError`]); they all fold into [`PipelineError`]
//! at the orchestrator boundary.

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::models::{RunId, Stage};
use crate::state_machine::ReplayError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Another orchestrator instance holds the run's lease. The caller must stop
    /// advancing the run; the run itself is unaffected.
    #[error("Run {run_id} is leased by another orchestrator: {holder}")]
    RunLeaseConflict { run_id: RunId, holder: String },

    /// A concurrent append claimed the sequence number first. The caller must
    /// re-read the log and re-evaluate its decision.
    #[error("Concurrent append detected for run {run_id} at sequence {sequence_no}")]
    LogAppendConflict { run_id: RunId, sequence_no: u64 },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No dispatch policy configured for stage {0}")]
    MissingStagePolicy(Stage),

    #[error("Event log for run {run_id} cannot be replayed: {source}")]
    Replay {
        run_id: RunId,
        #[source]
        source: ReplayError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this error means the caller lost (or never had) ownership of the run.
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::RunLeaseConflict { .. })
    }

    /// Whether the caller should re-read the log and try again.
    pub fn is_append_conflict(&self) -> bool {
        matches!(self, Self::LogAppendConflict { .. })
    }

    /// Whether the failure came from an unavailable store or queue.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Store(e) => e.is_infrastructure(),
            Self::Messaging(e) => e.is_infrastructure(),
            _ => false,
        }
    }

    /// Translate store-level conflicts into the orchestrator taxonomy.
    pub(crate) fn from_store(run_id: &RunId, err: StoreError) -> Self {
        match err {
            StoreError::SequenceConflict { sequence_no, .. } => Self::LogAppendConflict {
                run_id: run_id.clone(),
                sequence_no,
            },
            StoreError::LeaseNotHeld { holder, .. } => Self::RunLeaseConflict {
                run_id: run_id.clone(),
                holder: holder.unwrap_or_else(|| "unknown".to_string()),
            },
            StoreError::RunNotFound { .. } => Self::RunNotFound(run_id.clone()),
            other => Self::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflicts_map_to_orchestrator_errors() {
        let run_id = RunId::for_dataset(7);

        let err = PipelineError::from_store(
            &run_id,
            StoreError::SequenceConflict {
                run_id: run_id.clone(),
                sequence_no: 4,
            },
        );
        assert!(err.is_append_conflict());

        let err = PipelineError::from_store(
            &run_id,
            StoreError::LeaseNotHeld {
                run_id: run_id.clone(),
                holder: Some("orch-b".to_string()),
            },
        );
        assert!(err.is_lease_conflict());
        assert!(err.to_string().contains("orch-b"));
    }

    #[test]
    fn test_infrastructure_classification() {
        let err: PipelineError = StoreError::unavailable("append", "connection refused").into();
        assert!(err.is_infrastructure());

        let err = PipelineError::InvalidInput("bad".to_string());
        assert!(!err.is_infrastructure());
    }
}
