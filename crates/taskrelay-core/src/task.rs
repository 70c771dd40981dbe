//! Task types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, Engine, EngineChoice, OriginContext, TaskId, TaskStatus};

/// Kind of work a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    WebSearch,
    CodeReview,
    CodeGeneration,
    Analysis,
    Custom,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        Self::WebSearch,
        Self::CodeReview,
        Self::CodeGeneration,
        Self::Analysis,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::CodeReview => "code_review",
            Self::CodeGeneration => "code_generation",
            Self::Analysis => "analysis",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| CoreError::InvalidTaskType(s.to_string()))
    }
}

/// A Task represents a unit of deferred work destined for an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Kind of work.
    pub task_type: TaskType,

    /// Deflate-compressed JSON payload.
    #[serde(skip)]
    pub compressed_payload: Vec<u8>,

    /// Size of the serialized payload before compression.
    pub payload_size_bytes: usize,

    /// `compressed / original` size.
    pub compression_ratio: f64,

    /// Engine requested by the caller.
    pub requested_engine: EngineChoice,

    /// Engine the analyzer suggested at creation time.
    pub estimated_engine: Option<Engine>,

    /// Engine the task was actually admitted to.
    pub resolved_engine: Option<Engine>,

    /// Priority from 1 (lowest) to 10 (highest).
    pub priority: u8,

    /// Stored status. Readers should use [`Task::effective_status`].
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Who created this task and through which delegation chain.
    pub origin: OriginContext,

    /// Engine result on success.
    pub result: Option<Value>,

    /// Error message on failure.
    pub error: Option<String>,

    /// Number of dispatch attempts.
    pub attempts: u32,
}

impl Task {
    /// Create a new pending Task that expires `ttl` after now.
    pub fn new(
        task_type: TaskType,
        requested_engine: EngineChoice,
        priority: u8,
        ttl: Duration,
        origin: OriginContext,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: TaskId::generate(),
            task_type,
            compressed_payload: Vec::new(),
            payload_size_bytes: 0,
            compression_ratio: 1.0,
            requested_engine,
            estimated_engine: requested_engine.engine(),
            resolved_engine: requested_engine.engine(),
            priority,
            status: TaskStatus::Pending,
            created_at,
            expires_at: created_at + ttl,
            started_at: None,
            finished_at: None,
            origin,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    /// Builder method to attach the compressed payload.
    pub fn with_payload(mut self, compressed: Vec<u8>, original_size: usize) -> Self {
        self.compression_ratio = if original_size == 0 {
            1.0
        } else {
            compressed.len() as f64 / original_size as f64
        };
        self.payload_size_bytes = original_size;
        self.compressed_payload = compressed;
        self
    }

    /// Builder method to record the analyzer's suggestion.
    pub fn with_estimated_engine(mut self, engine: Option<Engine>) -> Self {
        if self.requested_engine.is_auto() {
            self.estimated_engine = engine;
        }
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Status as observed at `now`: expiry overrides whatever is stored.
    pub fn effective_status(&self, now: DateTime<Utc>) -> TaskStatus {
        if self.is_expired_at(now) {
            TaskStatus::Expired
        } else {
            self.status
        }
    }

    /// True once the task is past its expiry by more than `grace`.
    pub fn is_sweepable(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now > self.expires_at + grace
    }

    /// Engine used for display and filtering: resolved, else estimated.
    pub fn engine(&self) -> Option<Engine> {
        self.resolved_engine.or(self.estimated_engine)
    }

    /// Mark the task as dispatched to `engine`.
    pub fn start(&mut self, engine: Engine) {
        self.status = TaskStatus::Running;
        self.resolved_engine = Some(engine);
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.result = None;
        self.error = None;
        self.attempts += 1;
    }

    /// Mark the task as succeeded.
    pub fn succeed(&mut self, result: Value) {
        self.status = TaskStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
        self.error = None;
    }

    /// Mark the task as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}
