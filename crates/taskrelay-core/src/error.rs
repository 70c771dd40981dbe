//! Core domain errors.

use thiserror::Error;

/// Core domain errors for TaskRelay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Unknown task type name.
    #[error("Invalid task type: {0}")]
    InvalidTaskType(String),

    /// Unknown engine name.
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// Unknown task status name.
    #[error("Invalid task status: {0}")]
    InvalidStatus(String),

    /// Invalid input to the workload analyzer or a constructor.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
