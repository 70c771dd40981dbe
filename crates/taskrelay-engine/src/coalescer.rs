//! Request coalescing ("singleflight").
//!
//! Concurrent calls that carry the same [`CoalesceKey`] share one execution:
//! the first caller starts it, later callers attach to the same shared
//! future, and every caller observes the same outcome. A failing execution
//! rejects every attached waiter with the same error; waiters do not get
//! an individual retry.
//!
//! The shared future is also spawned onto the runtime, so an execution runs
//! to completion (and its pending entry is removed) even if every caller
//! goes away. The entry is removed before the result is published, so a
//! call that arrives after settlement always starts a fresh execution.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::CoalescerConfig;

/// Stable identity of a request: the full SHA-256 of its canonical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey(String);

impl CoalesceKey {
    /// Hash a JSON identity. Object keys are sorted recursively; array
    /// order is preserved.
    pub fn from_identity(identity: &Value) -> Self {
        let digest = Sha256::digest(canonical_json(identity).as_bytes());
        Self(hex::encode(digest))
    }

    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated digest, for logs only.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for CoalesceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Serialize `value` with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Outcome of a failed shared execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalesceError<E> {
    #[error("shared execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Failed(E),

    #[error("shared execution panicked")]
    Panicked,
}

/// How a call took part in an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    /// Started the shared execution.
    Started,
    /// Attached to an execution another caller started.
    Joined,
    /// Ran alone because the pending map was full.
    Bypassed,
}

type SharedExecution<T, E> = Shared<BoxFuture<'static, Result<T, CoalesceError<E>>>>;

struct PendingEntry<T, E> {
    future: SharedExecution<T, E>,
    waiters: u64,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    fresh_executions: AtomicU64,
    bypassed_requests: AtomicU64,
}

/// Coalescer statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoalescerStats {
    pub total_requests: u64,
    pub coalesced_requests: u64,
    pub fresh_executions: u64,
    /// Executions run without coalescing because the pending map was full.
    pub bypassed_requests: u64,
    pub waiters_saved: u64,
    pub coalesce_rate: f64,
    pub pending: usize,
}

enum Plan<T, E, F> {
    Join(SharedExecution<T, E>),
    Start(SharedExecution<T, E>),
    Bypass(F),
}

/// Deduplicates concurrent identical executions.
pub struct RequestCoalescer<T, E> {
    config: CoalescerConfig,
    pending: Arc<Mutex<HashMap<CoalesceKey, PendingEntry<T, E>>>>,
    counters: Arc<Counters>,
}

impl<T, E> RequestCoalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Run `executor` under `key`, or attach to an execution already in
    /// flight for the same key. `executor` is not invoked when attaching.
    pub async fn execute<F, Fut>(&self, key: CoalesceKey, executor: F) -> Result<T, CoalesceError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_tracked(key, executor).await.1
    }

    /// Like [`execute`](Self::execute), also reporting whether this call
    /// ran the execution or attached to one started by another caller.
    ///
    /// `executor` is invoked after the pending map lock is released, so it
    /// may call back into the coalescer.
    pub async fn execute_tracked<F, Fut>(
        &self,
        key: CoalesceKey,
        executor: F,
    ) -> (Participation, Result<T, CoalesceError<E>>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let plan = {
            let mut pending = self.pending.lock();
            if let Some(entry) = pending.get_mut(&key) {
                entry.waiters += 1;
                debug!(
                    key = %key,
                    waiters = entry.waiters,
                    in_flight_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Joining in-flight execution"
                );
                Plan::Join(entry.future.clone())
            } else if pending.len() >= self.config.max_pending {
                Plan::Bypass(executor)
            } else {
                let future = self.shared_execution(key.clone(), executor);
                pending.insert(
                    key.clone(),
                    PendingEntry {
                        future: future.clone(),
                        waiters: 1,
                        started_at: Instant::now(),
                    },
                );
                Plan::Start(future)
            }
        };

        match plan {
            Plan::Join(future) => {
                self.counters.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                (Participation::Joined, future.await)
            }
            Plan::Start(future) => {
                self.counters.fresh_executions.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(future.clone());
                (Participation::Started, future.await)
            }
            Plan::Bypass(executor) => {
                self.counters.fresh_executions.fetch_add(1, Ordering::Relaxed);
                self.counters.bypassed_requests.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    max_pending = self.config.max_pending,
                    "Pending map full, executing without coalescing"
                );
                (
                    Participation::Bypassed,
                    run_guarded(self.config.timeout, executor).await,
                )
            }
        }
    }

    fn shared_execution<F, Fut>(&self, key: CoalesceKey, executor: F) -> SharedExecution<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        let timeout = self.config.timeout;
        async move {
            let result = run_guarded(timeout, executor).await;
            pending.lock().remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// Number of executions currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Callers attached to the execution for `key`, if one is in flight.
    pub fn waiter_count(&self, key: &CoalesceKey) -> Option<u64> {
        self.pending.lock().get(key).map(|entry| entry.waiters)
    }

    pub fn stats(&self) -> CoalescerStats {
        let total = self.counters.total_requests.load(Ordering::Relaxed);
        let coalesced = self.counters.coalesced_requests.load(Ordering::Relaxed);
        CoalescerStats {
            total_requests: total,
            coalesced_requests: coalesced,
            fresh_executions: self.counters.fresh_executions.load(Ordering::Relaxed),
            bypassed_requests: self.counters.bypassed_requests.load(Ordering::Relaxed),
            waiters_saved: coalesced,
            coalesce_rate: if total == 0 {
                0.0
            } else {
                coalesced as f64 / total as f64
            },
            pending: self.pending_count(),
        }
    }
}

/// Invoke `executor` and await it under `timeout`. A panic anywhere in the
/// execution becomes [`CoalesceError::Panicked`] instead of unwinding
/// through the shared future.
async fn run_guarded<T, E, F, Fut>(timeout: Duration, executor: F) -> Result<T, CoalesceError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let execution = AssertUnwindSafe(async move { executor().await }).catch_unwind();
    match tokio::time::timeout(timeout, execution).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(CoalesceError::Failed(err)),
        Ok(Err(_)) => {
            error!("Shared execution panicked");
            Err(CoalesceError::Panicked)
        }
        Err(_) => Err(CoalesceError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn coalescer(config: CoalescerConfig) -> RequestCoalescer<u32, String> {
        RequestCoalescer::new(config)
    }

    fn key(name: &str) -> CoalesceKey {
        CoalesceKey::from_identity(&json!({ "name": name }))
    }

    #[test]
    fn test_key_ignores_object_key_order() {
        let a = json!({"engine": "claude", "payload": {"b": 1, "a": [1, 2]}, "type": "analysis"});
        let b = json!({"type": "analysis", "payload": {"a": [1, 2], "b": 1}, "engine": "claude"});
        assert_eq!(CoalesceKey::from_identity(&a), CoalesceKey::from_identity(&b));
        assert_eq!(CoalesceKey::from_identity(&a).as_str().len(), 64);

        let reordered = json!({"engine": "claude", "payload": {"b": 1, "a": [2, 1]}, "type": "analysis"});
        assert_ne!(
            CoalesceKey::from_identity(&a),
            CoalesceKey::from_identity(&reordered)
        );
    }

    #[test]
    fn test_canonical_json() {
        let value = json!({"z": {"y": null, "x": "q\"uote"}, "a": [true, 1.5]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[true,1.5],"z":{"x":"q\"uote","y":null}}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_execute_once() {
        let coalescer = coalescer(CoalescerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..10).map(|_| {
            let calls = Arc::clone(&calls);
            coalescer.execute(key("same"), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(42)
                }
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(42)));

        let stats = coalescer.stats();
        assert_eq!(stats.total_requests, 10);
        assert_eq!(stats.fresh_executions, 1);
        assert_eq!(stats.waiters_saved, 9);
        assert!((stats.coalesce_rate - 0.9).abs() < 1e-9);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_fans_out_to_every_waiter() {
        let coalescer = coalescer(CoalescerConfig::default());

        let results = join_all((0..10).map(|_| {
            coalescer.execute(key("fails"), || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<u32, _>("engine exploded".to_string())
            })
        }))
        .await;

        for result in results {
            assert_eq!(
                result,
                Err(CoalesceError::Failed("engine exploded".to_string()))
            );
        }
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_clears_entry() {
        let coalescer = coalescer(CoalescerConfig {
            timeout: Duration::from_secs(1),
            ..Default::default()
        });

        let result = coalescer
            .execute(key("slow"), || async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok::<_, String>(1)
            })
            .await;
        assert_eq!(result, Err(CoalesceError::Timeout(Duration::from_secs(1))));
        assert_eq!(coalescer.pending_count(), 0);

        let result = coalescer
            .execute(key("slow"), || async { Ok::<_, String>(2) })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(coalescer.stats().fresh_executions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_when_pending_map_full() {
        let coalescer = coalescer(CoalescerConfig {
            max_pending: 1,
            ..Default::default()
        });

        let slow = coalescer.execute(key("a"), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(1)
        });
        let other = coalescer.execute(key("b"), || async { Ok::<_, String>(2) });
        let (a, b) = tokio::join!(slow, other);

        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(2));
        let stats = coalescer.stats();
        assert_eq!(stats.bypassed_requests, 1);
        assert_eq!(stats.fresh_executions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_survives_dropped_caller() {
        let coalescer = coalescer(CoalescerConfig::default());
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);

        let call = coalescer.execute(key("dropped"), move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(7)
        });
        // Poll once so the execution starts, then abandon it.
        assert!(futures_util::poll!(Box::pin(call)).is_pending());
        assert_eq!(coalescer.waiter_count(&key("dropped")), Some(1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_executor_rejects_waiters_and_clears_entry() {
        let coalescer = coalescer(CoalescerConfig::default());

        let results = join_all((0..3).map(|_| {
            coalescer.execute(key("panics"), || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if true {
                    panic!("executor bug");
                }
                Ok::<u32, String>(0)
            })
        }))
        .await;

        assert!(results.iter().all(|r| r == &Err(CoalesceError::Panicked)));
        assert_eq!(coalescer.pending_count(), 0);

        let result = coalescer
            .execute(key("panics"), || async { Ok::<_, String>(5) })
            .await;
        assert_eq!(result, Ok(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_may_call_back_into_coalescer() {
        let coalescer = Arc::new(coalescer(CoalescerConfig::default()));
        let inner = Arc::clone(&coalescer);

        let result = coalescer
            .execute(key("reentrant"), move || {
                let pending = inner.pending_count() as u32;
                async move { Ok::<_, String>(pending) }
            })
            .await;

        assert_eq!(result, Ok(1));
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_participation_reports_starter_and_joiners() {
        let coalescer = coalescer(CoalescerConfig::default());

        let results = join_all((0..3).map(|_| {
            coalescer.execute_tracked(key("shared"), || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<u32, _>("down".to_string())
            })
        }))
        .await;

        let started = results
            .iter()
            .filter(|(p, _)| *p == Participation::Started)
            .count();
        let joined = results
            .iter()
            .filter(|(p, _)| *p == Participation::Joined)
            .count();
        assert_eq!((started, joined), (1, 2));
    }
}
