//! # Run State Machine
//!
//! Run, stage and member states, and the pure fold that turns an ordered
//! event log into a [`PipelineRun`](crate::models::PipelineRun).

pub mod errors;
pub mod fold;
pub mod states;

pub use errors::{ReplayError, ReplayResult};
pub use fold::{apply, replay, replay_from};
pub use states::{MemberState, RunState, StageState};
