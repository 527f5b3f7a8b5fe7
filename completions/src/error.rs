//! Router error types

use shared::{ApiFailure, ProviderId, StoreError};
use thiserror::Error;

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Router error types
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Provider request failed: {provider} - {reason}")]
    ProviderError { provider: ProviderId, reason: ApiFailure },

    #[error("All {attempts} attempts against the credential pool failed, last error: {last_failure}")]
    PoolExhausted { attempts: u32, last_failure: ApiFailure },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl RouterError {
    pub fn config(message: impl Into<String>) -> Self {
        RouterError::ConfigError { message: message.into() }
    }
}
