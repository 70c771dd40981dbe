//! TaskRelay Engine Library
//!
//! This crate provides the resilient execution layer for TaskRelay:
//! per-engine circuit breakers, request coalescing, the task store, and
//! the [`TaskEngine`] orchestrator that ties them together.

pub mod breaker;
pub mod codec;
pub mod coalescer;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod store;

pub use breaker::{Admission, BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerRegistry, StateTransition};
pub use coalescer::{CoalesceError, CoalesceKey, CoalescerStats, Participation, RequestCoalescer};
pub use config::{BreakerConfig, CoalescerConfig, EngineConfig};
pub use engine::{spawn_sweeper, CreateTaskRequest, CreatedTask, TaskEngine, TaskFilter};
pub use error::EngineError;
pub use executor::{DispatchError, DispatchRequest, EngineExecutor};
pub use metrics::{InMemoryMetrics, MetricsSink, TracingMetricsSink};
pub use store::TaskStore;
