#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dataflow Core
//!
//! Durable, crash-resumable orchestration for a fixed dataset pipeline:
//!
//! ```text
//! MetadataFetch -> EnumerateItems -> ProcessItems (fan-out) -> AnalyzeResults (fan-out) -> Aggregate
//! ```
//!
//! ## Architecture
//!
//! Every run is an append-only event log. Run state is never stored as
//! mutable fields; it is rebuilt by folding the log (optionally on top of a
//! snapshot), and the next step is computed by a pure function of that fold.
//! Replaying the same log always leads to the same decisions, which is what
//! makes a restarted orchestrator pick up exactly where the last one stopped.
//!
//! Work reaches the stage handlers through at-least-once queues with a
//! visibility window. Outcomes come back on a result channel and are matched
//! to the outstanding attempt; anything else is ignored.
//!
//! ## Module Organization
//!
//! - [`models`] - identities, stages, invocations, fan-out sets, payloads
//! - [`events`] - the event log entries
//! - [`state_machine`] - run/stage/member states and the pure fold
//! - [`orchestration`] - decisions, dispatch policy, the engine, background loops
//! - [`store`] - run state store contract, in-memory and PostgreSQL backends
//! - [`messaging`] - task queue contract, in-memory and pgmq backends
//! - [`worker`] - handler contract, registry, worker pools
//! - [`client`] - submission and result retrieval
//! - [`resilience`] - infrastructure retry
//! - [`config`] - layered configuration
//! - [`error`] - error taxonomy
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dataflow_core::config::PipelineConfig;
//! use dataflow_core::messaging::InMemoryTaskQueue;
//! use dataflow_core::orchestration::{OrchestrationSystem, SystemClock};
//! use dataflow_core::store::InMemoryRunStateStore;
//! use dataflow_core::worker::HandlerRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> dataflow_core::Result<()> {
//! let registry = HandlerRegistry::new(); // register one handler per queue
//! let system = OrchestrationSystem::new(
//!     PipelineConfig::default(),
//!     Arc::new(InMemoryRunStateStore::default()),
//!     Arc::new(InMemoryTaskQueue::default()),
//!     Arc::new(SystemClock),
//!     registry,
//! );
//! let handle = system.start().await?;
//! let client = handle.client();
//! let submitted = client.submit(42).await?;
//! let result = client.get_result(submitted.run_id(), true).await?;
//! println!("{result:?}");
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod resilience;
pub mod state_machine;
pub mod store;
pub mod worker;

pub use client::{PipelineClient, RunResult, SubmitOutcome};
pub use config::{ConfigManager, PipelineConfig};
pub use error::{PipelineError, Result};
pub use events::{EventKind, EventPayload, StageEvent};
pub use models::{
    PipelineInput, PipelineOutput, PipelineRun, RunId, RunStatus, Stage, TaskId, TaskInvocation,
    TaskOutcome,
};
pub use orchestration::{OrchestrationSystem, Orchestrator, RunHandle, SignalResult, SystemHandle};
pub use state_machine::{RunState, StageState};
