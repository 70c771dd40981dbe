//! Execution layer configuration.

use std::time::Duration;

/// Circuit breaker tuning, shared by every engine's breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,

    /// Time the circuit stays open before admitting trial requests.
    pub reset_timeout: Duration,

    /// Sliding window for counting failures.
    pub failure_window: Duration,

    /// Concurrent trial requests allowed while half-open.
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_millis(30_000),
            failure_window: Duration::from_millis(60_000),
            half_open_max_requests: 1,
        }
    }
}

/// Request coalescer tuning.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Pending entries above which coalescing is bypassed.
    pub max_pending: usize,

    /// Hard timeout for one shared execution.
    pub timeout: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_pending: 1000,
            timeout: Duration::from_millis(120_000),
        }
    }
}

/// Task engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub breaker: BreakerConfig,

    pub coalescer: CoalescerConfig,

    /// Deepest delegation chain a new task may carry.
    pub max_delegation_depth: u32,

    /// Largest serialized payload accepted by `create_task`.
    pub max_payload_bytes: usize,

    pub default_ttl_hours: u32,
    pub min_ttl_hours: u32,
    pub max_ttl_hours: u32,

    /// How long an expired task is kept (and reported as expired) before
    /// the sweep removes it.
    pub expiry_grace: Duration,

    pub default_priority: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            coalescer: CoalescerConfig::default(),
            max_delegation_depth: 3,
            max_payload_bytes: 1024 * 1024,
            default_ttl_hours: 24,
            min_ttl_hours: 1,
            max_ttl_hours: 168,
            expiry_grace: Duration::from_secs(3600),
            default_priority: 5,
        }
    }
}

impl EngineConfig {
    /// Clamp a requested TTL into the configured range.
    pub fn ttl_hours(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_ttl_hours)
            .clamp(self.min_ttl_hours, self.max_ttl_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_clamped() {
        let config = EngineConfig::default();
        assert_eq!(config.ttl_hours(None), 24);
        assert_eq!(config.ttl_hours(Some(0)), 1);
        assert_eq!(config.ttl_hours(Some(500)), 168);
        assert_eq!(config.ttl_hours(Some(48)), 48);
    }
}
