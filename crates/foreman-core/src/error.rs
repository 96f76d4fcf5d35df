//! Error types for Foreman.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("executable could not be created: {0}")]
    Instantiation(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("dependency collection failed: {0}")]
    DependencyCollection(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
