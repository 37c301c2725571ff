//! # Run Event Log Entries
//!
//! The append-only record of everything that happened to a run. Replaying
//! these in sequence order is the only way run state is reconstructed.

pub mod stage_event;

pub use stage_event::{EventKind, EventPayload, StageEvent};
