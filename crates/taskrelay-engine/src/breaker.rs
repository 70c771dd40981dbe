//! Per-engine circuit breakers.
//!
//! Each engine gets its own breaker guarded by its own mutex, so admission
//! decisions for one engine never wait on another. Failure timestamps are
//! kept in a sliding window that is swept lazily whenever the breaker is
//! consulted; there is no background timer.
//!
//! Time is measured with [`tokio::time::Instant`] so tests can drive it with
//! a paused clock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskrelay_core::Engine;

use crate::config::BreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Normal operation - all requests admitted.
    Closed,
    /// Failing - requests blocked until the reset timeout elapses.
    Open,
    /// Recovering - a bounded number of trial requests admitted.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change, delivered to registered observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub engine: Engine,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

/// Observer invoked synchronously after every state change.
pub type TransitionListener = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// How a request was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while the circuit was closed.
    Normal,
    /// Admitted as a trial during the numbered half-open period.
    Trial { epoch: u64 },
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub engine: Engine,
    pub state: BreakerState,
    /// Failures inside the current window.
    pub failures_in_window: usize,
    pub success_count: u32,
    pub half_open_slots_in_use: u32,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub times_opened: u64,
    pub times_closed: u64,
    /// Milliseconds until an open circuit admits trial requests.
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    success_count: u32,
    half_open_slots_in_use: u32,
    opened_at: Option<Instant>,
    /// Incremented on every entry into half-open.
    half_open_epoch: u64,
    total_requests: u64,
    blocked_requests: u64,
    times_opened: u64,
    times_closed: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            half_open_slots_in_use: 0,
            opened_at: None,
            half_open_epoch: 0,
            total_requests: 0,
            blocked_requests: 0,
            times_opened: 0,
            times_closed: 0,
        }
    }

    fn sweep(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether a settling request speaks for the current half-open period.
    /// Untracked callers (`None`) are trusted.
    fn holds_trial(&self, admission: Option<Admission>) -> bool {
        match admission {
            None => true,
            Some(Admission::Normal) => false,
            Some(Admission::Trial { epoch }) => epoch == self.half_open_epoch,
        }
    }

    fn release_slot(&mut self) {
        self.half_open_slots_in_use = self.half_open_slots_in_use.saturating_sub(1);
    }

    fn time_until_retry(&self, now: Instant, reset_timeout: Duration) -> Duration {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at)) => {
                reset_timeout.saturating_sub(now.saturating_duration_since(opened_at))
            }
            _ => Duration::ZERO,
        }
    }
}

/// Failure-isolation state machine for one engine.
pub struct CircuitBreaker {
    engine: Engine,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    listeners: RwLock<Vec<TransitionListener>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("engine", &self.engine)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(engine: Engine, config: BreakerConfig) -> Self {
        Self {
            engine,
            config,
            inner: Mutex::new(BreakerInner::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Register an observer for state changes.
    pub fn on_transition(&self, listener: TransitionListener) {
        self.listeners.write().push(listener);
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Decide whether a request may be sent to the engine now.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// here, and the request is then judged as a half-open trial. Admitting
    /// a trial occupies a slot until `record_success`, `record_failure` or
    /// `release_half_open_slot` is called.
    pub fn can_execute(&self) -> bool {
        self.try_acquire().is_some()
    }

    /// Like [`can_execute`](Self::can_execute), but returns how the request
    /// was admitted. Settle the request with the `*_for` methods so that only
    /// trial requests of the current half-open period affect recovery.
    pub fn try_acquire(&self) -> Option<Admission> {
        let now = Instant::now();
        let mut transition = None;
        let admission = {
            let mut inner = self.inner.lock();
            inner.sweep(now, self.config.failure_window);
            inner.total_requests += 1;

            if inner.state == BreakerState::Open
                && inner.time_until_retry(now, self.config.reset_timeout).is_zero()
            {
                transition = self.transition(&mut inner, BreakerState::HalfOpen, now);
            }

            let admission = match inner.state {
                BreakerState::Closed => Some(Admission::Normal),
                BreakerState::Open => None,
                BreakerState::HalfOpen => {
                    if inner.half_open_slots_in_use < self.config.half_open_max_requests {
                        inner.half_open_slots_in_use += 1;
                        Some(Admission::Trial {
                            epoch: inner.half_open_epoch,
                        })
                    } else {
                        None
                    }
                }
            };
            if admission.is_none() {
                inner.blocked_requests += 1;
            }
            admission
        };

        self.notify(transition);
        if admission.is_none() {
            debug!(engine = %self.engine, "Request blocked by circuit breaker");
        }
        admission
    }

    /// Record a successful dispatch.
    pub fn record_success(&self) {
        self.settle_success(None);
    }

    /// Record a successful dispatch admitted as `admission`. Only a trial of
    /// the current half-open period counts toward closing the circuit.
    pub fn record_success_for(&self, admission: Admission) {
        self.settle_success(Some(admission));
    }

    /// Record a failed dispatch.
    pub fn record_failure(&self) {
        self.settle_failure(None);
    }

    /// Record a failed dispatch admitted as `admission`. The failure always
    /// enters the window; while half-open only a current trial reopens the
    /// circuit.
    pub fn record_failure_for(&self, admission: Admission) {
        self.settle_failure(Some(admission));
    }

    /// Give back a trial slot for a request that was abandoned before it
    /// settled. Success and failure counters are left alone.
    pub fn release_half_open_slot(&self) {
        self.inner.lock().release_slot();
    }

    /// Give back the slot held by `admission`, if it is a trial of the
    /// current half-open period.
    pub fn release(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.holds_trial(Some(admission)) {
            inner.release_slot();
        }
    }

    fn settle_success(&self, admission: Option<Admission>) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state != BreakerState::HalfOpen || !inner.holds_trial(admission) {
                return;
            }
            inner.release_slot();
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                self.transition(&mut inner, BreakerState::Closed, now)
            } else {
                None
            }
        };
        self.notify(transition);
    }

    fn settle_failure(&self, admission: Option<Admission>) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.failures.push_back(now);
            inner.sweep(now, self.config.failure_window);

            match inner.state {
                BreakerState::Closed => {
                    if inner.failures.len() >= self.config.failure_threshold as usize {
                        self.transition(&mut inner, BreakerState::Open, now)
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen if inner.holds_trial(admission) => {
                    inner.release_slot();
                    self.transition(&mut inner, BreakerState::Open, now)
                }
                BreakerState::HalfOpen => None,
                BreakerState::Open => {
                    // Continued failure signal keeps the circuit open longer.
                    inner.opened_at = Some(now);
                    None
                }
            }
        };
        self.notify(transition);
    }

    /// Manually open the circuit.
    pub fn force_open(&self) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Open => {
                    inner.opened_at = Some(now);
                    None
                }
                _ => self.transition(&mut inner, BreakerState::Open, now),
            }
        };
        warn!(engine = %self.engine, "Circuit forced open");
        self.notify(transition);
    }

    /// Manually close the circuit, clearing failure history.
    pub fn force_close(&self) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => {
                    inner.failures.clear();
                    None
                }
                _ => self.transition(&mut inner, BreakerState::Closed, now),
            }
        };
        info!(engine = %self.engine, "Circuit forced closed");
        self.notify(transition);
    }

    /// Time until an open circuit starts admitting trial requests.
    pub fn time_until_retry(&self) -> Duration {
        self.inner
            .lock()
            .time_until_retry(Instant::now(), self.config.reset_timeout)
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sweep(now, self.config.failure_window);
        BreakerStats {
            engine: self.engine,
            state: inner.state,
            failures_in_window: inner.failures.len(),
            success_count: inner.success_count,
            half_open_slots_in_use: inner.half_open_slots_in_use,
            total_requests: inner.total_requests,
            blocked_requests: inner.blocked_requests,
            times_opened: inner.times_opened,
            times_closed: inner.times_closed,
            retry_after_ms: inner
                .time_until_retry(now, self.config.reset_timeout)
                .as_millis() as u64,
        }
    }

    fn transition(
        &self,
        inner: &mut BreakerInner,
        to: BreakerState,
        now: Instant,
    ) -> Option<StateTransition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.success_count = 0;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(now);
                inner.times_opened += 1;
            }
            BreakerState::HalfOpen => {
                inner.half_open_slots_in_use = 0;
                inner.half_open_epoch += 1;
            }
            BreakerState::Closed => {
                inner.failures.clear();
                inner.half_open_slots_in_use = 0;
                inner.opened_at = None;
                inner.times_closed += 1;
            }
        }
        Some(StateTransition {
            engine: self.engine,
            from,
            to,
            at: Utc::now(),
        })
    }

    fn notify(&self, transition: Option<StateTransition>) {
        let Some(transition) = transition else {
            return;
        };
        info!(
            engine = %transition.engine,
            from = %transition.from,
            to = %transition.to,
            "Circuit breaker state changed"
        );
        for listener in self.listeners.read().iter() {
            listener(&transition);
        }
    }
}

/// One breaker per engine, created up front.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: HashMap<Engine, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        let breakers = Engine::ALL
            .into_iter()
            .map(|engine| (engine, Arc::new(CircuitBreaker::new(engine, config.clone()))))
            .collect();
        Self { breakers }
    }

    pub fn get(&self, engine: Engine) -> Arc<CircuitBreaker> {
        // Every engine is inserted in `new`.
        Arc::clone(&self.breakers[&engine])
    }

    /// Register the same observer on every breaker.
    pub fn on_transition(&self, listener: TransitionListener) {
        for breaker in self.breakers.values() {
            breaker.on_transition(Arc::clone(&listener));
        }
    }

    /// Stats for every engine, in `Engine::ALL` order.
    pub fn stats(&self) -> Vec<BreakerStats> {
        Engine::ALL
            .into_iter()
            .map(|engine| self.breakers[&engine].stats())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Engine::Claude, BreakerConfig::default())
    }

    fn trip(b: &CircuitBreaker) {
        for _ in 0..5 {
            b.record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_threshold() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.can_execute());

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(!b.can_execute());
        assert_eq!(b.time_until_retry(), Duration::from_millis(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert_eq!(b.stats().failures_in_window, 0);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_is_bounded() {
        let b = breaker();
        trip(&b);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(b.can_execute());
        assert!(!b.can_execute());
        assert_eq!(b.stats().half_open_slots_in_use, 1);

        b.release_half_open_slot();
        assert!(b.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_successes() {
        let b = breaker();
        trip(&b);
        tokio::time::advance(Duration::from_secs(30)).await;

        for _ in 0..3 {
            assert!(b.can_execute());
            b.record_success();
        }
        assert_eq!(b.state(), BreakerState::Closed);

        let stats = b.stats();
        assert_eq!(stats.failures_in_window, 0);
        assert_eq!(stats.half_open_slots_in_use, 0);
        assert_eq!(stats.times_opened, 1);
        assert_eq!(stats.times_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let b = breaker();
        trip(&b);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(b.can_execute());
        b.record_success();
        assert!(b.can_execute());
        b.record_failure();

        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.time_until_retry(), Duration::from_secs(30));
        assert_eq!(b.stats().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_open_extends_timeout() {
        let b = breaker();
        trip(&b);
        tokio::time::advance(Duration::from_secs(20)).await;
        b.record_failure();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(!b.can_execute());
        assert_eq!(b.time_until_retry(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_count_blocked_requests() {
        let b = breaker();
        assert!(b.can_execute());
        trip(&b);
        assert!(!b.can_execute());
        assert!(!b.can_execute());

        let stats = b.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.blocked_requests, 2);
        assert_eq!(stats.state, BreakerState::Open);
        assert_eq!(stats.retry_after_ms, 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_and_close() {
        let b = breaker();
        b.force_open();
        assert!(!b.can_execute());
        b.force_close();
        assert!(b.can_execute());
        assert_eq!(b.stats().failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_transitions() {
        let b = breaker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        b.on_transition(Arc::new(move |t: &StateTransition| {
            sink.lock().push((t.from, t.to));
        }));

        trip(&b);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.can_execute());

        assert_eq!(
            *seen.lock(),
            vec![
                (BreakerState::Closed, BreakerState::Open),
                (BreakerState::Open, BreakerState::HalfOpen),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_admission_cannot_free_trial_slot() {
        let b = breaker();
        let earlier = b.try_acquire().unwrap();
        assert_eq!(earlier, Admission::Normal);

        b.force_open();
        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = b.try_acquire().unwrap();
        assert!(matches!(trial, Admission::Trial { .. }));

        b.release(earlier);
        assert_eq!(b.stats().half_open_slots_in_use, 1);
        assert!(b.try_acquire().is_none());

        b.release(trial);
        assert_eq!(b.stats().half_open_slots_in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_successes_do_not_close_circuit() {
        let b = breaker();
        let earlier: Vec<Admission> = (0..3).map(|_| b.try_acquire().unwrap()).collect();

        b.force_open();
        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = b.try_acquire().unwrap();

        for admission in earlier {
            b.record_success_for(admission);
        }
        let stats = b.stats();
        assert_eq!(stats.state, BreakerState::HalfOpen);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.times_closed, 0);
        assert_eq!(stats.half_open_slots_in_use, 1);

        b.record_success_for(trial);
        assert_eq!(b.stats().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_from_previous_half_open_period_is_ignored() {
        let b = breaker();
        trip(&b);
        tokio::time::advance(Duration::from_secs(30)).await;
        let first = b.try_acquire().unwrap();
        b.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;
        let second = b.try_acquire().unwrap();
        assert_ne!(first, second);

        b.record_failure_for(first);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure_for(second);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_registry_has_one_breaker_per_engine() {
        let registry = CircuitBreakerRegistry::new(&BreakerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.on_transition(Arc::new(move |_: &StateTransition| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.get(Engine::Grok).force_open();
        assert_eq!(registry.get(Engine::Grok).state(), BreakerState::Open);
        assert_eq!(registry.get(Engine::Glm).state(), BreakerState::Closed);
        assert_eq!(registry.stats().len(), Engine::ALL.len());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
