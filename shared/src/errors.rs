//! Shared error types for the completion routing system

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Invalid identifier: {input}")]
    InvalidId { input: String },

    #[error("Invalid configuration: {field} = {value}")]
    InvalidConfig { field: String, value: String },
}

pub type SharedResult<T> = Result<T, SharedError>;

/// Errors raised by a key/value store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection error: {message}")]
    Connection { message: String },

    #[error("Store command {command} failed: {message}")]
    Command { command: String, message: String },
}

impl StoreError {
    pub fn command(command: &str, message: impl Into<String>) -> Self {
        StoreError::Command {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
