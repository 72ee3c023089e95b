//! Per-service circuit breaker.
//!
//! State transitions:
//! - closed → open: `failure_threshold` consecutive call failures
//! - open → half-open: first check after `recovery_timeout` has elapsed
//! - half-open → closed: a trial call succeeds
//! - half-open → open: a trial call fails
//!
//! Consulted by the load balancer before every dispatch; state is mutated
//! only by the components that execute calls.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Circuit breaker state for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning, shared by all services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive call failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open trial.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Concurrent trial calls allowed while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }
}

/// Circuit breakers for all services, keyed by service name.
///
/// Each entry is mutated under its shard lock, so only one transition path
/// is taken at a time.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, BreakerState>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Gate check before a dispatch attempt.
    ///
    /// Fails fast with `CircuitOpen` while the circuit is open; the first
    /// check after the recovery timeout moves the circuit to half-open and
    /// admits the caller as a trial. Half-open admits at most
    /// `half_open_max_calls` concurrent trials.
    pub fn check(&self, service: &str) -> GatewayResult<()> {
        let mut entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(BreakerState::new);
        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= Duration::from_millis(self.config.recovery_timeout_ms) {
                    tracing::info!(service, "circuit half-open, admitting trial call");
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(service.to_string()))
                }
            }
            CircuitState::HalfOpen => {
                if entry.half_open_in_flight < self.config.half_open_max_calls {
                    entry.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(service.to_string()))
                }
            }
        }
    }

    /// Releases an admitted trial slot when the call was never executed
    /// (e.g. no selectable instance after the breaker check passed).
    pub fn release(&self, service: &str) {
        if let Some(mut entry) = self.breakers.get_mut(service) {
            if entry.state == CircuitState::HalfOpen && entry.half_open_in_flight > 0 {
                entry.half_open_in_flight -= 1;
            }
        }
    }

    /// Records a successful call: closes a half-open circuit and resets the
    /// failure streak.
    pub fn record_success(&self, service: &str) {
        let mut entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(BreakerState::new);
        match entry.state {
            CircuitState::HalfOpen => {
                tracing::info!(service, "circuit closed after successful trial");
                entry.state = CircuitState::Closed;
                entry.consecutive_failures = 0;
                entry.opened_at = None;
                entry.half_open_in_flight = 0;
            }
            CircuitState::Closed => {
                entry.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call: opens the circuit at the failure threshold,
    /// and re-opens it immediately from half-open.
    pub fn record_failure(&self, service: &str) {
        let mut entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(BreakerState::new);
        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        service,
                        failures = entry.consecutive_failures,
                        "circuit opened"
                    );
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(service, "trial call failed, circuit re-opened");
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                entry.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state; a service with no recorded calls is closed.
    pub fn state(&self, service: &str) -> CircuitState {
        self.breakers
            .get(service)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Drops breaker state for an unregistered service.
    pub fn remove(&self, service: &str) {
        self.breakers.remove(service);
    }
}
