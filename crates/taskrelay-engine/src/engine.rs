//! Task engine - owns tasks and routes their execution to engines.
//!
//! `run_task` control flow:
//! 1. look up the task (missing -> not found, past expiry -> expired);
//! 2. pick candidate engines: the pinned engine, or the stored engine
//!    followed by the analyzer's preference list for `auto` tasks;
//! 3. ask each candidate's circuit breaker for admission, in order;
//! 4. mark the task running and dispatch through the request coalescer;
//! 5. record the outcome on the task, and on the breaker when this run
//!    started the dispatch rather than joining one.
//!
//! A blocked task is never marked running. Every dispatch failure updates
//! both the breaker and the task before it is returned to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskrelay_core::{
    Engine, EngineChoice, OriginContext, Task, TaskId, TaskStatus, TaskType, WorkloadAnalyzer,
    WorkloadRequest,
};

use crate::breaker::{Admission, BreakerStats, CircuitBreaker, CircuitBreakerRegistry, StateTransition};
use crate::codec;
use crate::coalescer::{
    CoalesceError, CoalesceKey, CoalescerStats, Participation, RequestCoalescer,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{DispatchRequest, EngineExecutor};
use crate::metrics::{MetricsSink, TracingMetricsSink};
use crate::store::TaskStore;

/// Payload fields tried, in order, when the payload has no `prompt`.
const PROMPT_FALLBACK_FIELDS: &[&str] = &["query", "code", "content"];

/// Parameters for [`TaskEngine::create_task`].
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    pub payload: Value,
    pub engine: EngineChoice,
    pub priority: Option<u8>,
    pub ttl_hours: Option<u32>,
    pub origin: OriginContext,
}

impl CreateTaskRequest {
    pub fn new(task_type: TaskType, payload: Value) -> Self {
        Self {
            task_type,
            payload,
            engine: EngineChoice::Auto,
            priority: None,
            ttl_hours: None,
            origin: OriginContext::default(),
        }
    }

    pub fn with_engine(mut self, engine: impl Into<EngineChoice>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl_hours(mut self, ttl_hours: u32) -> Self {
        self.ttl_hours = Some(ttl_hours);
        self
    }

    pub fn with_origin(mut self, origin: OriginContext) -> Self {
        self.origin = origin;
        self
    }
}

/// Result of [`TaskEngine::create_task`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedTask {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub estimated_engine: Option<Engine>,
    pub expires_at: DateTime<Utc>,
    pub payload_size_bytes: usize,
    pub compression_ratio: f64,
}

/// Filters for [`TaskEngine::list_tasks`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub engine: Option<Engine>,
    pub limit: Option<usize>,
}

/// Owns tasks and executes them against engines.
pub struct TaskEngine {
    config: EngineConfig,
    store: TaskStore,
    breakers: CircuitBreakerRegistry,
    coalescer: RequestCoalescer<Value, EngineError>,
    analyzer: WorkloadAnalyzer,
    executor: Arc<dyn EngineExecutor>,
    metrics: Arc<dyn MetricsSink>,
}

impl TaskEngine {
    /// Create an engine that reports metrics as tracing events.
    pub fn new(config: EngineConfig, executor: Arc<dyn EngineExecutor>) -> Self {
        Self::with_metrics(config, executor, Arc::new(TracingMetricsSink))
    }

    pub fn with_metrics(
        config: EngineConfig,
        executor: Arc<dyn EngineExecutor>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let breakers = CircuitBreakerRegistry::new(&config.breaker);
        let sink = Arc::clone(&metrics);
        breakers.on_transition(Arc::new(move |t: &StateTransition| {
            sink.record_metric(
                "taskrelay_circuit_transitions_total",
                1.0,
                &[("engine", t.engine.as_str()), ("to", t.to.as_str())],
            );
        }));

        Self {
            coalescer: RequestCoalescer::new(config.coalescer.clone()),
            config,
            store: TaskStore::new(),
            breakers,
            analyzer: WorkloadAnalyzer::new(),
            executor,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn breaker(&self, engine: Engine) -> Arc<CircuitBreaker> {
        self.breakers.get(engine)
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Validate, compress and store a new pending task.
    pub fn create_task(&self, request: CreateTaskRequest) -> Result<CreatedTask, EngineError> {
        self.sweep_expired();

        if !request.payload.is_object() {
            return Err(EngineError::Validation(
                "payload must be a JSON object".to_string(),
            ));
        }
        if request.origin.exceeds(self.config.max_delegation_depth) {
            warn!(
                origin = %request.origin.origin_client,
                depth = request.origin.depth,
                max = self.config.max_delegation_depth,
                "Rejected task: delegation depth exceeded"
            );
            self.metrics
                .record_metric("taskrelay_tasks_rejected_total", 1.0, &[("reason", "depth")]);
            return Err(EngineError::DelegationDepthExceeded {
                depth: request.origin.depth,
                max: self.config.max_delegation_depth,
            });
        }
        let priority = request.priority.unwrap_or(self.config.default_priority);
        if !(1..=10).contains(&priority) {
            return Err(EngineError::Validation(format!(
                "priority must be between 1 and 10, got {priority}"
            )));
        }

        let encoded = match codec::encode(&request.payload, self.config.max_payload_bytes) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.metrics
                    .record_metric("taskrelay_tasks_rejected_total", 1.0, &[("reason", "payload")]);
                return Err(err);
            }
        };

        let estimated_engine = match request.engine {
            EngineChoice::Specific(engine) => Some(engine),
            EngineChoice::Auto => {
                let workload = workload_request(&request.payload, priority)?;
                self.analyzer.route(&workload)?.primary()
            }
        };

        let ttl_hours = self.config.ttl_hours(request.ttl_hours);
        let task = Task::new(
            request.task_type,
            request.engine,
            priority,
            chrono::Duration::hours(i64::from(ttl_hours)),
            request.origin,
        )
        .with_payload(encoded.compressed, encoded.original_size)
        .with_estimated_engine(estimated_engine);

        let created = CreatedTask {
            task_id: task.id.clone(),
            status: task.status,
            estimated_engine,
            expires_at: task.expires_at,
            payload_size_bytes: task.payload_size_bytes,
            compression_ratio: task.compression_ratio,
        };

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            requested_engine = %task.requested_engine,
            estimated_engine = ?estimated_engine,
            payload_size = task.payload_size_bytes,
            ttl_hours,
            "Created task"
        );
        self.metrics.record_metric(
            "taskrelay_tasks_created_total",
            1.0,
            &[("type", task.task_type.as_str())],
        );
        self.store.insert(task);

        Ok(created)
    }

    /// Execute a task on an admitted engine and return its terminal record.
    ///
    /// Identical concurrent runs share one dispatch. Only the run that
    /// started the dispatch records its outcome on the breaker, so a shared
    /// failure counts once. If this future is dropped before the dispatch
    /// settles, any half-open trial slot it holds is released and the task is
    /// marked failed.
    pub async fn run_task(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        let task = self.live_task(task_id)?;
        if !task.status.can_run() {
            return Err(EngineError::InvalidStateTransition {
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }
        let payload = codec::decode(&task.compressed_payload)?;

        let candidates = self.candidates(&task, &payload)?;
        let (breaker, admission) = self.admit(task_id, &candidates)?;
        let engine = breaker.engine();

        let started = self.store.update(task_id, |t| {
            let now = Utc::now();
            if t.is_expired_at(now) {
                Err(EngineError::TaskExpired(t.id.clone()))
            } else if !t.status.can_run() {
                Err(EngineError::InvalidStateTransition {
                    from: t.status.to_string(),
                    to: TaskStatus::Running.to_string(),
                })
            } else {
                t.start(engine);
                Ok(())
            }
        });
        match started {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                breaker.release(admission);
                return Err(err);
            }
            None => {
                breaker.release(admission);
                return Err(EngineError::TaskNotFound(task_id.clone()));
            }
        }

        info!(task_id = %task_id, engine = %engine, "Dispatching task");
        let mut guard = AbandonGuard {
            breaker: Arc::clone(&breaker),
            admission,
            store: &self.store,
            task_id,
            armed: true,
        };

        let key = CoalesceKey::from_identity(&json!({
            "engine": engine,
            "type": task.task_type,
            "payload": payload,
        }));
        let request = DispatchRequest {
            engine,
            task_id: task_id.clone(),
            task_type: task.task_type,
            payload,
        };
        let executor = Arc::clone(&self.executor);
        let (participation, outcome) = self
            .coalescer
            .execute_tracked(key, move || async move {
                executor
                    .dispatch(request)
                    .await
                    .map_err(|e| EngineError::EngineExecution {
                        engine,
                        message: e.message,
                    })
            })
            .await;
        let outcome = outcome.map_err(|err| match err {
            CoalesceError::Timeout(timeout) => EngineError::CoalesceTimeout { timeout },
            CoalesceError::Failed(err) => err,
            CoalesceError::Panicked => EngineError::EngineExecution {
                engine,
                message: "engine executor panicked".to_string(),
            },
        });
        guard.armed = false;

        let owns_outcome = participation != Participation::Joined;
        if !owns_outcome {
            breaker.release(admission);
        }

        match outcome {
            Ok(result) => {
                if owns_outcome {
                    breaker.record_success_for(admission);
                }
                self.store.update(task_id, |t| t.succeed(result));
                info!(task_id = %task_id, engine = %engine, "Task succeeded");
                self.record_run(engine, "succeeded");
                self.store
                    .get(task_id)
                    .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))
            }
            Err(err) => {
                if owns_outcome {
                    breaker.record_failure_for(admission);
                }
                self.store.update(task_id, |t| t.fail(err.to_string()));
                warn!(task_id = %task_id, engine = %engine, error = %err, "Task failed");
                self.record_run(engine, "failed");
                Err(err)
            }
        }
    }

    /// Current task record, with expiry applied to its status.
    pub fn get_task_result(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        let now = Utc::now();
        self.store
            .get(task_id)
            .map(|task| observed(task, now))
            .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))
    }

    /// Tasks matching `filter`, newest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.sweep_expired();
        let now = Utc::now();

        let mut tasks: Vec<Task> = self
            .store
            .filter(|task| {
                filter.task_type.map_or(true, |t| task.task_type == t)
                    && filter.engine.map_or(true, |e| task.engine() == Some(e))
                    && filter
                        .status
                        .map_or(true, |s| task.effective_status(now) == s)
            })
            .into_iter()
            .map(|task| observed(task, now))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Delete a task. Returns false if it did not exist.
    pub fn delete_task(&self, task_id: &TaskId) -> bool {
        let removed = self.store.remove(task_id).is_some();
        if removed {
            info!(task_id = %task_id, "Deleted task");
        }
        removed
    }

    /// Remove tasks past expiry plus the grace period.
    pub fn sweep_expired(&self) -> usize {
        let grace = chrono::Duration::from_std(self.config.expiry_grace)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let removed = self.store.sweep_expired(Utc::now(), grace);
        if !removed.is_empty() {
            info!(count = removed.len(), "Swept expired tasks");
            self.metrics.record_metric(
                "taskrelay_tasks_swept_total",
                removed.len() as f64,
                &[],
            );
        }
        removed.len()
    }

    // ------------------------------------------------------------------
    // Operator controls and statistics
    // ------------------------------------------------------------------

    pub fn force_open(&self, engine: Engine) {
        self.breakers.get(engine).force_open();
    }

    pub fn force_close(&self, engine: Engine) {
        self.breakers.get(engine).force_close();
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers.stats()
    }

    pub fn coalescer_stats(&self) -> CoalescerStats {
        self.coalescer.stats()
    }

    /// Number of stored tasks per effective status.
    pub fn task_counts(&self) -> HashMap<TaskStatus, u64> {
        let now = Utc::now();
        let mut counts = HashMap::new();
        for task in self.store.filter(|_| true) {
            *counts.entry(task.effective_status(now)).or_insert(0) += 1;
        }
        counts
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Stored task that has not expired.
    fn live_task(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        let task = self
            .store
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))?;
        if task.is_expired_at(Utc::now()) {
            debug!(task_id = %task_id, "Task observed as expired");
            return Err(EngineError::TaskExpired(task_id.clone()));
        }
        Ok(task)
    }

    /// Engines to try, in order.
    fn candidates(&self, task: &Task, payload: &Value) -> Result<Vec<Engine>, EngineError> {
        if let Some(engine) = task.requested_engine.engine() {
            return Ok(vec![engine]);
        }
        let workload = workload_request(payload, task.priority)?;
        let recommendation = self.analyzer.route(&workload)?;
        debug!(
            task_id = %task.id,
            engines = ?recommendation.engines,
            reason = %recommendation.reason,
            "Routing recommendation"
        );

        let mut engines: Vec<Engine> = task.resolved_engine.into_iter().collect();
        for engine in recommendation.engines {
            if !engines.contains(&engine) {
                engines.push(engine);
            }
        }
        Ok(engines)
    }

    /// First candidate whose breaker admits the request.
    fn admit(
        &self,
        task_id: &TaskId,
        candidates: &[Engine],
    ) -> Result<(Arc<CircuitBreaker>, Admission), EngineError> {
        let mut shortest: Option<(Engine, Duration)> = None;
        for &engine in candidates {
            let breaker = self.breakers.get(engine);
            if let Some(admission) = breaker.try_acquire() {
                return Ok((breaker, admission));
            }
            let retry_after = breaker.time_until_retry();
            if shortest.map_or(true, |(_, best)| retry_after < best) {
                shortest = Some((engine, retry_after));
            }
        }

        let (engine, retry_after) = shortest.ok_or_else(|| {
            EngineError::Validation("no candidate engine for task".to_string())
        })?;
        warn!(
            task_id = %task_id,
            engine = %engine,
            retry_after_ms = retry_after.as_millis() as u64,
            "Task blocked by open circuit"
        );
        self.metrics.record_metric(
            "taskrelay_runs_blocked_total",
            1.0,
            &[("engine", engine.as_str())],
        );
        Err(EngineError::CircuitOpen {
            engine,
            retry_after,
        })
    }

    fn record_run(&self, engine: Engine, outcome: &str) {
        self.metrics.record_metric(
            "taskrelay_runs_total",
            1.0,
            &[("engine", engine.as_str()), ("outcome", outcome)],
        );
    }
}

/// Periodically sweep expired tasks until the handle is aborted.
pub fn spawn_sweeper(engine: Arc<TaskEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            engine.sweep_expired();
        }
    })
}

/// Marks an in-flight run as abandoned if its future is dropped.
struct AbandonGuard<'a> {
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    store: &'a TaskStore,
    task_id: &'a TaskId,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.breaker.release(self.admission);
        self.store
            .update(self.task_id, |t| t.fail("execution abandoned by caller"));
        warn!(
            task_id = %self.task_id,
            engine = %self.breaker.engine(),
            "Task run abandoned before completion"
        );
    }
}

/// Snapshot with the lazy expiry override applied.
fn observed(mut task: Task, now: DateTime<Utc>) -> Task {
    task.status = task.effective_status(now);
    task
}

/// Build analyzer input from a task payload.
fn workload_request(payload: &Value, priority: u8) -> Result<WorkloadRequest, EngineError> {
    let prompt = match payload.get("prompt") {
        Some(Value::String(prompt)) => prompt.clone(),
        Some(_) => {
            return Err(EngineError::Validation(
                "payload.prompt must be a string".to_string(),
            ))
        }
        None => PROMPT_FALLBACK_FIELDS
            .iter()
            .find_map(|field| payload.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
    };

    let mut request = WorkloadRequest::new(prompt).with_priority(priority);
    if let Some(spec) = ["spec", "description"]
        .iter()
        .find_map(|field| payload.get(*field).and_then(Value::as_str))
    {
        request = request.with_spec_description(spec);
    }
    match payload.get("max_tokens") {
        None | Some(Value::Null) => {}
        Some(value) => {
            let max_tokens = value.as_i64().ok_or_else(|| {
                EngineError::Validation("max_tokens must be a non-negative integer".to_string())
            })?;
            request = request.with_max_tokens(max_tokens);
        }
    }
    Ok(request)
}
