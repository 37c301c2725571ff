//! # Orchestration
//!
//! The durable pipeline engine.
//!
//! ## Core Components
//!
//! - **decision**: pure `decide(run)`; what happens next, from the folded run alone
//! - **dispatcher**: per-stage policy and the pure retry/backoff resolution
//! - **deadlines**: deadline tracking for in-flight attempts
//! - **engine**: the [`Orchestrator`]; leases, appends, conflict handling, status
//! - **orchestration_system**: background loops around an orchestrator
//! - **clock**: injectable time source

pub mod clock;
pub mod deadlines;
pub mod decision;
pub mod dispatcher;
pub mod engine;
pub mod orchestration_system;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use deadlines::DeadlineTracker;
pub use decision::{aggregate, decide, plan_stage, validate_output, Action, PlanError, PlannedTask};
pub use dispatcher::{BackoffPolicy, DispatchDecision, Dispatcher, StagePolicy};
pub use engine::{IgnoredReason, Orchestrator, RunHandle, SignalResult};
pub use orchestration_system::{OrchestrationSystem, SystemHandle};
