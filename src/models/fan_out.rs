use super::{RunId, Stage, TaskFailure, TaskId, TaskInvocation};
use crate::state_machine::MemberState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Latest known attempt of one task, plus its terminal result if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutMember {
    pub task_id: TaskId,
    pub queue_name: String,
    pub input: Value,
    pub attempt_number: u32,
    pub available_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: MemberState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}

impl FanOutMember {
    pub fn from_invocation(invocation: &TaskInvocation) -> Self {
        Self {
            task_id: invocation.task_id,
            queue_name: invocation.queue_name.clone(),
            input: invocation.input.clone(),
            attempt_number: invocation.attempt_number,
            available_at: invocation.available_at,
            deadline: invocation.deadline,
            state: MemberState::Dispatched,
            output: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Rebuild the queue invocation for the member's current attempt
    pub fn to_invocation(&self, run_id: &RunId, stage: Stage) -> TaskInvocation {
        TaskInvocation {
            run_id: run_id.clone(),
            stage,
            task_id: self.task_id,
            queue_name: self.queue_name.clone(),
            input: self.input.clone(),
            attempt_number: self.attempt_number,
            available_at: self.available_at,
            deadline: self.deadline,
            previous_error: None,
        }
    }
}

/// All tasks belonging to one stage instance, keyed by their planned index.
///
/// Iteration is always in index order, never arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutSet {
    members: BTreeMap<u32, FanOutMember>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutCounts {
    pub total: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

impl FanOutSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.members.contains_key(&index)
    }

    pub fn get(&self, index: u32) -> Option<&FanOutMember> {
        self.members.get(&index)
    }

    pub(crate) fn get_mut(&mut self, index: u32) -> Option<&mut FanOutMember> {
        self.members.get_mut(&index)
    }

    pub(crate) fn insert(&mut self, member: FanOutMember) {
        self.members.insert(member.task_id.index, member);
    }

    pub fn members(&self) -> impl Iterator<Item = &FanOutMember> {
        self.members.values()
    }

    /// Members with an attempt still outstanding
    pub fn in_flight(&self) -> impl Iterator<Item = &FanOutMember> {
        self.members.values().filter(|m| !m.is_terminal())
    }

    /// Successful members and their outputs, in index order
    pub fn completed(&self) -> impl Iterator<Item = (&FanOutMember, &Value)> {
        self.members
            .values()
            .filter_map(|m| m.output.as_ref().map(|output| (m, output)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &FanOutMember> {
        self.members
            .values()
            .filter(|m| m.state == MemberState::Failed)
    }

    /// True once every one of `planned` members has been dispatched and reached
    /// a terminal outcome.
    pub fn is_fully_terminal(&self, planned: usize) -> bool {
        self.members.len() == planned && self.members.values().all(FanOutMember::is_terminal)
    }

    pub fn counts(&self) -> FanOutCounts {
        let mut counts = FanOutCounts {
            total: self.members.len(),
            ..Default::default()
        };
        for member in self.members.values() {
            match member.state {
                MemberState::Dispatched => counts.in_flight += 1,
                MemberState::Completed => counts.completed += 1,
                MemberState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
