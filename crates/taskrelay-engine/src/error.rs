//! Execution layer errors.

use std::time::Duration;

use thiserror::Error;

use taskrelay_core::{CoreError, Engine, TaskId};

/// Errors surfaced by the task engine.
///
/// Cloneable so a single coalesced failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Oversized or malformed payload, invalid type or parameter.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Origin call chain is deeper than allowed.
    #[error("Delegation depth {depth} exceeds maximum of {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },

    /// Engine admission blocked by its circuit breaker.
    #[error("Circuit open for engine '{engine}', retry in {}ms", .retry_after.as_millis())]
    CircuitOpen { engine: Engine, retry_after: Duration },

    /// Shared execution exceeded the coalescer timeout.
    #[error("Execution timed out after {}ms", .timeout.as_millis())]
    CoalesceTimeout { timeout: Duration },

    /// The engine dispatch itself failed.
    #[error("Engine '{engine}' failed: {message}")]
    EngineExecution { engine: Engine, message: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task expired: {0}")]
    TaskExpired(TaskId),

    /// Task is not in a state that allows the operation.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::DelegationDepthExceeded { .. } => "DELEGATION_DEPTH_EXCEEDED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::CoalesceTimeout { .. } => "COALESCE_TIMEOUT",
            Self::EngineExecution { .. } => "ENGINE_EXECUTION_ERROR",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::TaskExpired(_) => "TASK_EXPIRED",
            Self::InvalidStateTransition { .. } => "INVALID_STATE",
        }
    }

    /// Suggested wait before retrying, for admission failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}
