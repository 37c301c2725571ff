//! Typed payloads exchanged with the stage handlers.
//!
//! Handlers see these as JSON; the engine decodes them when planning the next
//! stage and when validating a reported output.

use serde::{Deserialize, Serialize};

/// Pipeline input: the dataset to process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInput {
    pub dataset_id: i64,
}

/// MetadataFetch output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    #[serde(default)]
    pub dataset_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    pub s3_bucket: String,
    pub s3_prefix: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// EnumerateItems input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesRequest {
    pub s3_bucket: String,
    pub s3_prefix: String,
}

/// EnumerateItems output
pub type FileList = Vec<String>;

/// ProcessItems input, one per enumerated file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFileRequest {
    pub file: String,
    pub dataset_id: i64,
    pub dataset_info: DatasetInfo,
}

/// ProcessItems output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvResult {
    pub file: String,
    pub detections: u32,
    #[serde(default)]
    pub features: Vec<f64>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_secs: Option<f64>,
}

/// AnalyzeResults input, one per successful ProcessItems result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub dataset_id: i64,
    pub cv_result: CvResult,
    pub dataset_info: DatasetInfo,
}

/// AnalyzeResults output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlResult {
    pub file: String,
    pub predicted_class: String,
    pub confidence: f64,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cv_confidence: Option<f64>,
}

/// Final pipeline output. Both result lists follow the enumeration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub dataset_id: i64,
    pub files_processed: usize,
    pub cv_results: Vec<CvResult>,
    pub ml_results: Vec<MlResult>,
}
