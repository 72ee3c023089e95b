//! Registration lifecycle: validate, store, and keep probe tasks in step.
//!
//! The registry is the only writer of the service store; health state,
//! breaker state, and probe tasks all follow the registration lifecycle
//! through it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{GatewayError, GatewayResult};
use crate::health::{HealthStore, MonitorSet};
use crate::proxy::{BreakerRegistry, LoadBalancer};

use super::{ServiceRegistration, ServiceStore};

/// Coordinates the service store with health monitoring, load-balancer
/// cursors, and breaker state.
pub struct Registry {
    store: Arc<ServiceStore>,
    health: Arc<HealthStore>,
    breakers: Arc<BreakerRegistry>,
    balancer: Arc<LoadBalancer>,
    monitors: MonitorSet,
    /// Per-name guards: register/unregister for the same service run their
    /// whole stop/store/sync/start sequence one at a time.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Registry {
    pub fn new(
        store: Arc<ServiceStore>,
        health: Arc<HealthStore>,
        breakers: Arc<BreakerRegistry>,
        balancer: Arc<LoadBalancer>,
        monitors: MonitorSet,
    ) -> Self {
        Self {
            store,
            health,
            breakers,
            balancer,
            monitors,
            locks: DashMap::new(),
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Registers a service, replacing any previous registration under the
    /// same name.
    ///
    /// On replacement the old probe task is stopped before the new
    /// registration becomes visible, so stale endpoints are never probed.
    /// Same-name mutations are linearized: a concurrent register or
    /// unregister for the same service waits for this one to finish.
    pub async fn register(&self, registration: ServiceRegistration) -> GatewayResult<()> {
        registration.validate()?;
        let name = registration.name.clone();
        let lock = self.name_lock(&name);
        let _guard = lock.lock().await;

        self.monitors.stop(&name).await;
        let replaced = self.store.insert(registration.clone());
        self.health.sync_registration(&registration);
        self.monitors.start(registration);

        tracing::info!(
            service = %name,
            replaced = replaced.is_some(),
            "service registered"
        );
        Ok(())
    }

    /// Removes a service. The probe task is stopped and awaited before
    /// this returns, and health, cursor, and breaker state are dropped
    /// with it.
    pub async fn unregister(&self, name: &str) -> GatewayResult<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        if !self.store.contains(name) {
            return Err(GatewayError::NotFound(name.to_string()));
        }

        self.monitors.stop(name).await;
        self.store.remove(name);
        self.health.forget_service(name);
        self.balancer.forget_service(name);
        self.breakers.remove(name);

        tracing::info!(service = %name, "service unregistered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ServiceRegistration> {
        self.store.get(name)
    }

    pub fn list(&self) -> Vec<ServiceRegistration> {
        self.store.list()
    }

    pub fn breaker_state(&self, name: &str) -> crate::proxy::CircuitState {
        self.breakers.state(name)
    }

    pub fn is_monitoring(&self, name: &str) -> bool {
        self.monitors.is_running(name)
    }

    /// Stops all probe tasks; used on gateway shutdown.
    pub async fn shutdown(&self) {
        self.monitors.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::proxy::{BreakerConfig, CircuitState};
    use crate::store::{HealthCheckConfig, InstanceEndpoint, Tier};

    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;

    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn make_registry() -> Registry {
        let store = Arc::new(ServiceStore::new());
        let health = Arc::new(HealthStore::new());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&health),
            Arc::clone(&breakers),
        ));
        let monitors = MonitorSet::new(crate::proxy::forward::build_client(), Arc::clone(&health));
        Registry::new(store, health, breakers, balancer, monitors)
    }

    fn make_registration(name: &str, address: &str, interval_ms: u64) -> ServiceRegistration {
        ServiceRegistration {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            instances: vec![InstanceEndpoint {
                address: address.to_string(),
                tier: Tier::Container,
            }],
            health_check: HealthCheckConfig {
                interval_ms,
                timeout_ms: 500,
                failure_threshold: 2,
                success_threshold: 1,
                ..HealthCheckConfig::default()
            },
            call_timeout_ms: 1000,
            streaming: false,
            middleware: vec![],
        }
    }

    async fn start_healthy_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(|_req| async {
                                Ok::<_, Infallible>(
                                    Response::builder()
                                        .status(StatusCode::OK)
                                        .body(Full::new(Bytes::from("ok")))
                                        .unwrap(),
                                )
                            }),
                        )
                        .await;
                });
            }
        });
        addr
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    // ========== Phase 1: Registration ==========

    #[tokio::test]
    async fn test_register_starts_monitoring() {
        let backend = start_healthy_backend().await;
        let registry = make_registry();
        let reg = make_registration("orders", &backend.to_string(), 20);

        registry.register(reg).await.unwrap();
        assert!(registry.is_monitoring("orders"));
        assert!(registry.get("orders").is_some());

        let health = Arc::clone(&registry.health);
        let addr = backend.to_string();
        wait_for(|| health.status("orders", &addr) == HealthStatus::Healthy).await;
    }

    #[tokio::test]
    async fn test_register_rejects_invalid() {
        let registry = make_registry();
        let mut reg = make_registration("bad", "127.0.0.1:1", 20);
        reg.instances.clear();

        let err = registry.register(reg).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(!registry.is_monitoring("bad"));
    }

    #[tokio::test]
    async fn test_register_replaces_existing() {
        let backend = start_healthy_backend().await;
        let registry = make_registry();

        registry
            .register(make_registration("orders", "127.0.0.1:1", 20))
            .await
            .unwrap();
        registry
            .register(make_registration("orders", &backend.to_string(), 20))
            .await
            .unwrap();

        let reg = registry.get("orders").unwrap();
        assert_eq!(reg.instances[0].address, backend.to_string());
        assert_eq!(registry.list().len(), 1);
    }

    // ========== Phase 2: Unregistration ==========

    #[tokio::test]
    async fn test_unregister_unknown_is_not_found() {
        let registry = make_registry();
        let err = registry.unregister("ghost").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unregister_stops_probes() {
        let backend = start_healthy_backend().await;
        let registry = make_registry();
        let addr = backend.to_string();
        registry
            .register(make_registration("orders", &addr, 20))
            .await
            .unwrap();

        let health = Arc::clone(&registry.health);
        {
            let addr = addr.clone();
            wait_for(move || health.last_probe("orders", &addr).is_some()).await;
        }

        registry.unregister("orders").await.unwrap();
        assert!(!registry.is_monitoring("orders"));
        assert!(registry.get("orders").is_none());

        // Health state is gone and stays gone: no probe lands after
        // unregister returns.
        assert!(registry.health.get("orders", &addr).is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.health.get("orders", &addr).is_none());
    }

    #[tokio::test]
    async fn test_unregister_drops_breaker_state() {
        let backend = start_healthy_backend().await;
        let registry = make_registry();
        registry
            .register(make_registration("orders", &backend.to_string(), 1000))
            .await
            .unwrap();

        for _ in 0..10 {
            registry.breakers.record_failure("orders");
        }
        assert_eq!(registry.breakers.state("orders"), CircuitState::Open);

        registry.unregister("orders").await.unwrap();
        assert_eq!(registry.breakers.state("orders"), CircuitState::Closed);
    }

    // ========== Phase 3: Shutdown ==========

    #[tokio::test]
    async fn test_shutdown_stops_all_monitors() {
        let backend = start_healthy_backend().await;
        let registry = make_registry();
        registry
            .register(make_registration("a", &backend.to_string(), 20))
            .await
            .unwrap();
        registry
            .register(make_registration("b", &backend.to_string(), 20))
            .await
            .unwrap();

        registry.shutdown().await;
        assert!(!registry.is_monitoring("a"));
        assert!(!registry.is_monitoring("b"));
        // Registrations stay listed; only the probes stop.
        assert_eq!(registry.list().len(), 2);
    }

    // ========== Phase 4: Linearization & Cursor Lifecycle ==========

    #[tokio::test]
    async fn test_concurrent_same_name_registers_stay_consistent() {
        let backend_a = start_healthy_backend().await;
        let backend_b = start_healthy_backend().await;
        let registry = Arc::new(make_registry());

        // Two racing replacements for the same name: whichever lands last,
        // the store, the health entries, and the running monitor must all
        // describe that same registration.
        for _ in 0..10 {
            let mut reg_a = make_registration("svc", &backend_a.to_string(), 60_000);
            reg_a.version = "a".to_string();
            let mut reg_b = make_registration("svc", &backend_b.to_string(), 60_000);
            reg_b.version = "b".to_string();

            let first = Arc::clone(&registry);
            let second = Arc::clone(&registry);
            let (done_a, done_b) = tokio::join!(
                tokio::spawn(async move { first.register(reg_a).await }),
                tokio::spawn(async move { second.register(reg_b).await }),
            );
            done_a.unwrap().unwrap();
            done_b.unwrap().unwrap();

            let stored = registry.get("svc").unwrap();
            let (kept, pruned) = if stored.version == "a" {
                (backend_a.to_string(), backend_b.to_string())
            } else {
                (backend_b.to_string(), backend_a.to_string())
            };
            assert!(registry.is_monitoring("svc"));
            assert!(registry.health.get("svc", &kept).is_some());
            assert!(registry.health.get("svc", &pruned).is_none());
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_resets_round_robin_cursor() {
        let registry = make_registry();
        let reg = ServiceRegistration {
            name: "svc".to_string(),
            version: "1.0.0".to_string(),
            instances: vec![
                InstanceEndpoint {
                    address: "a:1".to_string(),
                    tier: Tier::Container,
                },
                InstanceEndpoint {
                    address: "b:1".to_string(),
                    tier: Tier::Container,
                },
            ],
            health_check: HealthCheckConfig {
                interval_ms: 60_000,
                ..HealthCheckConfig::default()
            },
            call_timeout_ms: 1000,
            streaming: false,
            middleware: vec![],
        };
        registry.register(reg.clone()).await.unwrap();

        // Advance the cursor off the start of the rotation.
        let picks: Vec<String> = (0..3)
            .map(|_| registry.balancer.pick(&reg, Tier::Container).unwrap().address)
            .collect();
        assert_eq!(picks, vec!["a:1", "b:1", "a:1"]);

        registry.unregister("svc").await.unwrap();
        registry.register(reg.clone()).await.unwrap();

        // A re-registered service starts its rotation fresh.
        assert_eq!(
            registry.balancer.pick(&reg, Tier::Container).unwrap().address,
            "a:1"
        );
        registry.shutdown().await;
    }
}
