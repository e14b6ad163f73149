use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Test-and-set condition failed: {0}")]
    PreconditionFailed(String),

    #[error("Bucket info mismatch for {bucket}: backend {backend}, index {index}")]
    ConsistencyViolation {
        bucket: String,
        backend: String,
        index: String,
    },

    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A merge is already active for bucket {0}")]
    MergeAlreadyActive(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

impl From<std::io::Error> for FeedError {
    fn from(e: std::io::Error) -> Self {
        FeedError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Json(e.to_string())
    }
}

/// Status carried by every persistence reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    NotFound,
    TestAndSetConditionFailed,
    BucketInfoMismatch,
    InternalFailure,
    IllegalParameters,
    Busy,
    Rejected,
    Aborted,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

impl FeedError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            FeedError::NotFound(_) => ResultCode::NotFound,
            FeedError::PreconditionFailed(_) => ResultCode::TestAndSetConditionFailed,
            FeedError::ConsistencyViolation { .. } => ResultCode::BucketInfoMismatch,
            FeedError::BackendFailure(_) => ResultCode::InternalFailure,
            FeedError::InvalidRequest(_) => ResultCode::IllegalParameters,
            FeedError::MergeAlreadyActive(_) => ResultCode::Busy,
            FeedError::Rejected(_) => ResultCode::Rejected,
            FeedError::Aborted(_) => ResultCode::Aborted,
            FeedError::Io(_) => ResultCode::InternalFailure,
            FeedError::Json(_) => ResultCode::IllegalParameters,
            FeedError::Config(_) => ResultCode::InternalFailure,
            FeedError::Compression(_) => ResultCode::InternalFailure,
        }
    }

    /// Whether the error signals that the bucket index and backend diverged.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, FeedError::ConsistencyViolation { .. })
    }
}
