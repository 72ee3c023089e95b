//! Thread-safe service registry storage using DashMap.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Backend tier a request can be routed to.
///
/// Closed set so dispatch sites handle every tier exhaustively; adding a
/// third tier is a compile-time-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Low-latency edge-function pool.
    Edge,
    /// Heavier stateful container pool.
    Container,
}

impl Tier {
    /// Returns the other tier, used for the single routing re-decision.
    pub fn other(self) -> Tier {
        match self {
            Tier::Edge => Tier::Container,
            Tier::Container => Tier::Edge,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Edge => "edge",
            Tier::Container => "container",
        }
    }
}

/// Middleware capabilities a service can request by name at registration.
///
/// Resolved to this closed set when the registration is parsed; unknown
/// names are a registration error, not a runtime dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Middleware {
    /// Echo or generate an `x-request-id` header (always-on gateway
    /// behavior; accepted here so registrations can declare it).
    RequestId,
    /// Log the routing decision and chosen instance at info level.
    Logging,
    /// Add permissive CORS headers to forwarded responses.
    Cors,
}

/// One concrete network endpoint backing a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEndpoint {
    /// `host:port` the gateway dials.
    pub address: String,
    #[serde(default = "default_tier")]
    pub tier: Tier,
}

fn default_tier() -> Tier {
    Tier::Container
}

/// Health probe configuration for a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_method")]
    pub method: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive probe failures before an instance turns unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive probe successes before an unhealthy instance recovers.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_method() -> String {
    "GET".to_string()
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            method: default_health_method(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// A service registration, keyed by name.
///
/// Owned exclusively by the [`ServiceStore`]; mutated only by re-registration
/// (full replace) or unregistration (delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub instances: Vec<InstanceEndpoint>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Hard deadline for each forwarded call, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Whether the service accepts upgraded streaming connections.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub middleware: Vec<Middleware>,
}

fn default_version() -> String {
    "unknown".to_string()
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl ServiceRegistration {
    /// Validates invariants the rest of the gateway relies on.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.name.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "registration name must not be empty".to_string(),
            ));
        }
        if self.name.contains('/') {
            return Err(GatewayError::InvalidRequest(format!(
                "registration name must not contain '/': {}",
                self.name
            )));
        }
        if self.instances.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "service '{}' must declare at least one instance",
                self.name
            )));
        }
        if self.health_check.failure_threshold == 0 || self.health_check.success_threshold == 0 {
            return Err(GatewayError::InvalidRequest(format!(
                "service '{}' health thresholds must be at least 1",
                self.name
            )));
        }
        if self.health_check.interval_ms == 0 {
            return Err(GatewayError::InvalidRequest(format!(
                "service '{}' health interval must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Instances declared for the given tier, in registration order.
    pub fn instances_in(&self, tier: Tier) -> impl Iterator<Item = &InstanceEndpoint> {
        self.instances.iter().filter(move |i| i.tier == tier)
    }

    pub fn has_middleware(&self, mw: Middleware) -> bool {
        self.middleware.contains(&mw)
    }
}

/// Thread-safe storage for service registrations.
///
/// Uses `DashMap` for per-key locking (concurrent registrations for
/// different names proceed independently, same-name mutations are
/// linearized by the shard lock) and `AtomicU64` for generation tracking.
pub struct ServiceStore {
    services: DashMap<String, ServiceRegistration>,
    generation: AtomicU64,
}

impl ServiceStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Inserts or atomically replaces a registration keyed by name.
    ///
    /// Returns the previous registration when this was a replace.
    pub fn insert(&self, registration: ServiceRegistration) -> Option<ServiceRegistration> {
        let previous = self
            .services
            .insert(registration.name.clone(), registration);
        self.generation.fetch_add(1, Ordering::SeqCst);
        previous
    }

    /// Removes a registration, returning it if the name was known.
    pub fn remove(&self, name: &str) -> Option<ServiceRegistration> {
        let removed = self.services.remove(name).map(|(_, reg)| reg);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Returns a clone of the registration for the given name.
    pub fn get(&self, name: &str) -> Option<ServiceRegistration> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Returns all registrations.
    pub fn list(&self) -> Vec<ServiceRegistration> {
        self.services
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Monotonically increasing counter bumped on every mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for ServiceStore {
    fn default() -> Self {
        Self::new()
    }
}
