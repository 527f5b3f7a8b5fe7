//! Pipeline-specific error types

use shared::{SharedError, StoreError};
use thiserror::Error;

use crate::types::{JobId, Stage};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("Stage {stage} is missing its {missing} result")]
    DependencyMissing { stage: Stage, missing: Stage },

    #[error("Job {job_id} is still running")]
    JobInProgress { job_id: JobId },

    #[error("Job {job_id} has used all {max_retries} retries")]
    RetryBudgetExhausted { job_id: JobId, max_retries: u32 },

    #[error("Stage {stage} produced unusable output: {reason}")]
    InvalidOutput { stage: Stage, reason: String },

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Shared component error: {0}")]
    SharedError(#[from] SharedError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
