//! Per-instance health state with threshold-based transitions.

use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::store::{ServiceRegistration, Tier};

/// Health status of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Registered but never probed.
    Unknown,
    Healthy,
    Unhealthy,
}

/// Probe-derived state for one instance of one service.
///
/// Status transitions only happen on threshold crossings, never on a single
/// observation (unless the threshold is configured to 1).
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub last_probe: Option<Instant>,
    pub last_error: Option<String>,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe: None,
            last_error: None,
        }
    }
}

/// Thread-safe store of instance health, keyed by (service, address).
///
/// Mutated only by the health monitor; read by the load balancer and the
/// routing engine. Each entry is updated under its shard lock, so readers
/// never observe a status paired with stale counters.
pub struct HealthStore {
    instances: DashMap<(String, String), InstanceHealth>,
}

impl HealthStore {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Seeds entries for every instance of a registration and drops entries
    /// for instances the registration no longer declares.
    pub fn sync_registration(&self, registration: &ServiceRegistration) {
        for instance in &registration.instances {
            self.instances
                .entry((registration.name.clone(), instance.address.clone()))
                .or_default();
        }
        let name = registration.name.clone();
        self.instances.retain(|(service, address), _| {
            service != &name
                || registration
                    .instances
                    .iter()
                    .any(|i| &i.address == address)
        });
    }

    /// Removes all health entries for a service.
    pub fn forget_service(&self, service: &str) {
        self.instances.retain(|(s, _), _| s != service);
    }

    /// Records a successful probe. Transitions to healthy once
    /// `success_threshold` consecutive successes accumulate.
    pub fn record_success(&self, service: &str, address: &str, success_threshold: u32) {
        let key = (service.to_string(), address.to_string());
        let mut entry = self.instances.entry(key).or_default();
        entry.consecutive_successes += 1;
        entry.consecutive_failures = 0;
        entry.last_probe = Some(Instant::now());
        entry.last_error = None;
        if entry.status != HealthStatus::Healthy
            && entry.consecutive_successes >= success_threshold
        {
            tracing::info!(service, address, "instance recovered");
            entry.status = HealthStatus::Healthy;
        }
    }

    /// Records a failed probe. Transitions to unhealthy once
    /// `failure_threshold` consecutive failures accumulate. All failure
    /// causes are recorded identically.
    pub fn record_failure(&self, service: &str, address: &str, failure_threshold: u32, error: &str) {
        let key = (service.to_string(), address.to_string());
        let mut entry = self.instances.entry(key).or_default();
        entry.consecutive_failures += 1;
        entry.consecutive_successes = 0;
        entry.last_probe = Some(Instant::now());
        entry.last_error = Some(error.to_string());
        if entry.status != HealthStatus::Unhealthy
            && entry.consecutive_failures >= failure_threshold
        {
            tracing::warn!(
                service,
                address,
                failures = entry.consecutive_failures,
                error,
                "instance marked unhealthy"
            );
            entry.status = HealthStatus::Unhealthy;
        }
    }

    /// Returns a snapshot of the health entry for an instance.
    pub fn get(&self, service: &str, address: &str) -> Option<InstanceHealth> {
        let key = (service.to_string(), address.to_string());
        self.instances.get(&key).map(|entry| entry.value().clone())
    }

    pub fn status(&self, service: &str, address: &str) -> HealthStatus {
        self.get(service, address)
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Whether the load balancer may select the instance.
    ///
    /// Unknown instances (never probed, or not yet tracked) are selectable;
    /// only an explicit unhealthy verdict excludes one. This avoids a
    /// blackout window between registration and the first probe tick.
    pub fn is_selectable(&self, service: &str, address: &str) -> bool {
        self.status(service, address) != HealthStatus::Unhealthy
    }

    pub fn last_probe(&self, service: &str, address: &str) -> Option<Instant> {
        self.get(service, address).and_then(|h| h.last_probe)
    }

    /// Fraction of selectable instances in a tier across the given
    /// registrations. A tier with no instances counts as fully healthy.
    pub fn tier_health(&self, registrations: &[ServiceRegistration], tier: Tier) -> f64 {
        let mut total = 0usize;
        let mut selectable = 0usize;
        for reg in registrations {
            for instance in reg.instances_in(tier) {
                total += 1;
                if self.is_selectable(&reg.name, &instance.address) {
                    selectable += 1;
                }
            }
        }
        if total == 0 {
            1.0
        } else {
            selectable as f64 / total as f64
        }
    }
}

impl Default for HealthStore {
    fn default() -> Self {
        Self::new()
    }
}
