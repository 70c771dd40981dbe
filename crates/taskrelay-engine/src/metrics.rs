//! Metrics sink and Prometheus text exposition.
//!
//! The engine reports counters through a [`MetricsSink`] without caring
//! where they go. [`collect_metrics`] renders engine state (tasks, circuit
//! breakers, coalescer) plus any counters held by an [`InMemoryMetrics`]
//! sink in Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write;

use parking_lot::Mutex;
use tracing::debug;

use taskrelay_core::TaskStatus;

use crate::breaker::BreakerState;
use crate::engine::TaskEngine;

/// Destination for engine metrics.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to the metric `name` with the given labels.
    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Sink that emits every metric as a `tracing` debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        debug!(metric = name, value, labels = ?labels, "metric");
    }
}

/// Sink that accumulates counters in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never recorded.
    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.counters
            .lock()
            .get(&series(name, labels))
            .copied()
            .unwrap_or(0.0)
    }

    /// Render all counters in Prometheus text format.
    pub fn render(&self, output: &mut String) {
        for (series, value) in self.counters.lock().iter() {
            writeln!(output, "{series} {value}").ok();
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        *self.counters.lock().entry(series(name, labels)).or_insert(0.0) += value;
    }
}

fn series(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted = labels.to_vec();
    sorted.sort();
    let labels: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{name}{{{}}}", labels.join(","))
}

/// Collect all metrics from the engine and format as Prometheus text.
pub fn collect_metrics(engine: &TaskEngine, counters: Option<&InMemoryMetrics>) -> String {
    let mut output = String::new();

    collect_task_metrics(engine, &mut output);
    collect_breaker_metrics(engine, &mut output);
    collect_coalescer_metrics(engine, &mut output);

    if let Some(counters) = counters {
        writeln!(output).ok();
        counters.render(&mut output);
    }

    output
}

/// Collect task counts by effective status.
fn collect_task_metrics(engine: &TaskEngine, output: &mut String) {
    let counts = engine.task_counts();

    writeln!(
        output,
        "# HELP taskrelay_tasks_total Number of stored tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE taskrelay_tasks_total gauge").ok();
    for status in TaskStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        writeln!(output, "taskrelay_tasks_total{{status=\"{status}\"}} {count}").ok();
    }
}

/// Collect circuit breaker state per engine.
fn collect_breaker_metrics(engine: &TaskEngine, output: &mut String) {
    let stats = engine.breaker_stats();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskrelay_circuit_state Circuit state per engine (0=closed, 1=half_open, 2=open)"
    )
    .ok();
    writeln!(output, "# TYPE taskrelay_circuit_state gauge").ok();
    for s in &stats {
        let value = match s.state {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        };
        writeln!(output, "taskrelay_circuit_state{{engine=\"{}\"}} {value}", s.engine).ok();
    }

    writeln!(
        output,
        "# HELP taskrelay_circuit_blocked_total Requests blocked by the circuit breaker"
    )
    .ok();
    writeln!(output, "# TYPE taskrelay_circuit_blocked_total counter").ok();
    for s in &stats {
        writeln!(
            output,
            "taskrelay_circuit_blocked_total{{engine=\"{}\"}} {}",
            s.engine, s.blocked_requests
        )
        .ok();
    }

    writeln!(
        output,
        "# HELP taskrelay_circuit_failures_in_window Failures inside the sliding window"
    )
    .ok();
    writeln!(output, "# TYPE taskrelay_circuit_failures_in_window gauge").ok();
    for s in &stats {
        writeln!(
            output,
            "taskrelay_circuit_failures_in_window{{engine=\"{}\"}} {}",
            s.engine, s.failures_in_window
        )
        .ok();
    }
}

/// Collect coalescer counters.
fn collect_coalescer_metrics(engine: &TaskEngine, output: &mut String) {
    let stats = engine.coalescer_stats();

    writeln!(output).ok();
    writeln!(output, "# TYPE taskrelay_coalescer_requests_total counter").ok();
    writeln!(
        output,
        "taskrelay_coalescer_requests_total {}",
        stats.total_requests
    )
    .ok();
    writeln!(output, "# TYPE taskrelay_coalescer_coalesced_total counter").ok();
    writeln!(
        output,
        "taskrelay_coalescer_coalesced_total {}",
        stats.coalesced_requests
    )
    .ok();
    writeln!(output, "# TYPE taskrelay_coalescer_bypassed_total counter").ok();
    writeln!(
        output,
        "taskrelay_coalescer_bypassed_total {}",
        stats.bypassed_requests
    )
    .ok();
    writeln!(output, "# TYPE taskrelay_coalescer_pending gauge").ok();
    writeln!(output, "taskrelay_coalescer_pending {}", stats.pending).ok();
}
