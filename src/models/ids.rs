use super::Stage;
use crate::constants::system::DATASET_RUN_PREFIX;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a pipeline run.
///
/// Callers may supply any id; [`RunId::for_dataset`] derives the conventional
/// `dataset-<id>` form so that resubmitting the same dataset is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn for_dataset(dataset_id: i64) -> Self {
        Self(format!("{DATASET_RUN_PREFIX}{dataset_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of one task within a stage, unique per run.
///
/// The index is the task's position in the stage's planned input order, which
/// is also the order results are aggregated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    pub stage: Stage,
    pub index: u32,
}

impl TaskId {
    pub fn new(stage: Stage, index: u32) -> Self {
        Self { stage, index }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:05}", self.stage, self.index)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stage, index) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid task id: {s}"))?;
        let stage = stage.parse::<Stage>()?;
        let index = index
            .parse::<u32>()
            .map_err(|e| format!("Invalid task index in {s}: {e}"))?;
        Ok(Self { stage, index })
    }
}

impl TryFrom<String> for TaskId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.to_string()
    }
}
