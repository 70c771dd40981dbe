//! Engine execution contract.
//!
//! The task engine does not know how to talk to any particular AI provider.
//! It hands a [`DispatchRequest`] to an [`EngineExecutor`] and treats any
//! error it returns as a failure signal for that engine's circuit breaker.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use taskrelay_core::{Engine, TaskId, TaskType};

/// A unit of work handed to an engine.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    pub engine: Engine,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: Value,
}

/// Failure reported by an engine executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DispatchError {
    pub message: String,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Sends work to external AI engines.
#[async_trait]
pub trait EngineExecutor: Send + Sync {
    /// Execute `request` on `request.engine` and return its result.
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError>;
}
