//! # Pipeline Data Model
//!
//! Identities, the fixed stage sequence, dispatched invocations and their
//! outcomes, the fan-out set, and the folded [`PipelineRun`].

pub mod fan_out;
pub mod ids;
pub mod invocation;
pub mod outcome;
pub mod payloads;
pub mod pipeline_run;
pub mod run_record;
pub mod stage;
pub mod status;

pub use fan_out::{FanOutCounts, FanOutMember, FanOutSet};
pub use ids::{RunId, TaskId};
pub use invocation::{InvocationKey, TaskInvocation};
pub use outcome::{OutcomeResult, TaskErrorKind, TaskFailure, TaskOutcome};
pub use payloads::{
    AnalyzeRequest, CvResult, DatasetInfo, FileList, ListFilesRequest, MlResult, PipelineInput,
    PipelineOutput, ProcessFileRequest,
};
pub use pipeline_run::{PipelineRun, RunFailure, StageProgress};
pub use run_record::{PartialFailurePolicy, RunRecord};
pub use stage::Stage;
pub use status::{RunStatus, StageSummary};
