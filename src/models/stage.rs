use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed stage sequence of the dataset pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Look up dataset metadata (single task)
    MetadataFetch,
    /// List the dataset's files from object storage (single task)
    EnumerateItems,
    /// Per-file heavy processing (fan-out over enumerated files)
    ProcessItems,
    /// Per-result secondary analysis (fan-out, one-to-one with ProcessItems results)
    AnalyzeResults,
    /// In-engine aggregation of the ordered result lists
    Aggregate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::MetadataFetch,
        Stage::EnumerateItems,
        Stage::ProcessItems,
        Stage::AnalyzeResults,
        Stage::Aggregate,
    ];

    pub const FIRST: Stage = Stage::MetadataFetch;

    pub fn next(self) -> Option<Stage> {
        match self {
            Self::MetadataFetch => Some(Self::EnumerateItems),
            Self::EnumerateItems => Some(Self::ProcessItems),
            Self::ProcessItems => Some(Self::AnalyzeResults),
            Self::AnalyzeResults => Some(Self::Aggregate),
            Self::Aggregate => None,
        }
    }

    /// Whether the stage fans out into many independent tasks
    pub fn is_fan_out(self) -> bool {
        matches!(self, Self::ProcessItems | Self::AnalyzeResults)
    }

    /// Whether the stage dispatches work to a queue at all
    pub fn dispatches_tasks(self) -> bool {
        !matches!(self, Self::Aggregate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetadataFetch => "metadata_fetch",
            Self::EnumerateItems => "enumerate_items",
            Self::ProcessItems => "process_items",
            Self::AnalyzeResults => "analyze_results",
            Self::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata_fetch" => Ok(Self::MetadataFetch),
            "enumerate_items" => Ok(Self::EnumerateItems),
            "process_items" => Ok(Self::ProcessItems),
            "analyze_results" => Ok(Self::AnalyzeResults),
            "aggregate" => Ok(Self::Aggregate),
            _ => Err(format!("Invalid stage: {s}")),
        }
    }
}
