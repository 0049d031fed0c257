//! Application-level errors (wraps domain errors)

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::DomainError;

/// Application errors wrap domain errors and add application-level context.
#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("{0}")]
    Domain(#[from] DomainError),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("map is read-only: {0}")]
    ReadOnlyMap(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("no lock held on {0}")]
    LockNotHeld(PathBuf),

    #[error("config error: {message}")]
    Config { message: String },

    #[error("operation failed: {context}")]
    OperationFailed {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for application layer operations.
pub type ApplicationResult<T> = Result<T, ApplicationError>;
