use serde::{Deserialize, Serialize};
use std::fmt;

/// Run-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Stages are still being advanced
    #[default]
    Running,
    /// Every stage completed with all members successful
    Completed,
    /// Completed, but at least one fan-out proceeded with a partial result set
    Degraded,
    /// A stage failed unrecoverably
    Failed,
    /// Cancelled by a client; no further dispatch
    Cancelled,
}

impl RunState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether the run produced an output
    pub fn has_output(&self) -> bool {
        matches!(self, Self::Completed | Self::Degraded)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run state: {s}")),
        }
    }
}

/// Per-stage state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Stage started, nothing dispatched yet
    #[default]
    Pending,
    /// Single-task stage with its task in flight
    Dispatched,
    /// Fan-out stage with members in flight
    FannedOut,
    /// All members succeeded
    Completed,
    /// Some members failed permanently, the run proceeds with the rest
    Degraded,
    /// The stage cannot produce a usable result
    Failed,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Degraded | Self::Failed)
    }

    /// Whether the next stage may start from this one
    pub fn allows_progress(&self) -> bool {
        matches!(self, Self::Completed | Self::Degraded)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::FannedOut => write!(f, "fanned_out"),
            Self::Completed => write!(f, "completed"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "fanned_out" => Ok(Self::FannedOut),
            "completed" => Ok(Self::Completed),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid stage state: {s}")),
        }
    }
}

/// State of one fan-out member (one task, across all of its attempts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    /// An attempt is queued or running
    Dispatched,
    Completed,
    /// Failed permanently or exhausted its attempts
    Failed,
}

impl MemberState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Dispatched)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatched => write!(f, "dispatched"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
