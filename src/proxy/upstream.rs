//! Health- and circuit-aware instance selection.
//!
//! Round-robin load balancing over the currently selectable instances of a
//! service's tier pool. The cursor indexes into the filtered list, not the
//! raw list, so instances leaving and rejoining do not bias later picks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthStore;
use crate::store::{InstanceEndpoint, ServiceRegistration, Tier};

use super::breaker::BreakerRegistry;

/// Round-robin load balancer with health and circuit awareness.
///
/// Thread-safe via per-pool atomic cursors and shared state handles.
pub struct LoadBalancer {
    cursors: DashMap<String, AtomicUsize>,
    health: Arc<HealthStore>,
    breakers: Arc<BreakerRegistry>,
}

impl LoadBalancer {
    pub fn new(health: Arc<HealthStore>, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            cursors: DashMap::new(),
            health,
            breakers,
        }
    }

    /// Selects one selectable instance from the service's tier pool.
    ///
    /// Consults the circuit breaker first: an open circuit fails fast with
    /// `CircuitOpen` without touching the pool. An empty filtered pool
    /// fails with `NoHealthyInstance`.
    pub fn pick(
        &self,
        registration: &ServiceRegistration,
        tier: Tier,
    ) -> GatewayResult<InstanceEndpoint> {
        self.breakers.check(&registration.name)?;

        let selectable: Vec<&InstanceEndpoint> = registration
            .instances_in(tier)
            .filter(|i| self.health.is_selectable(&registration.name, &i.address))
            .collect();

        if selectable.is_empty() {
            // Give back any half-open trial slot the check admitted.
            self.breakers.release(&registration.name);
            return Err(GatewayError::NoHealthyInstance(registration.name.clone()));
        }

        let key = pool_key(&registration.name, tier);
        let cursor = self
            .cursors
            .entry(key)
            .or_insert_with(|| AtomicUsize::new(0));
        let index = cursor.fetch_add(1, Ordering::Relaxed) % selectable.len();
        Ok(selectable[index].clone())
    }

    /// Selects one selectable instance across both tiers; used for stream
    /// relays, which have no request profile to route on. Uses its own
    /// cursor so tiered traffic keeps its rotation.
    pub fn pick_any(&self, registration: &ServiceRegistration) -> GatewayResult<InstanceEndpoint> {
        self.breakers.check(&registration.name)?;

        let selectable: Vec<&InstanceEndpoint> = registration
            .instances
            .iter()
            .filter(|i| self.health.is_selectable(&registration.name, &i.address))
            .collect();

        if selectable.is_empty() {
            self.breakers.release(&registration.name);
            return Err(GatewayError::NoHealthyInstance(registration.name.clone()));
        }

        let key = format!("{}/all", registration.name);
        let cursor = self
            .cursors
            .entry(key)
            .or_insert_with(|| AtomicUsize::new(0));
        let index = cursor.fetch_add(1, Ordering::Relaxed) % selectable.len();
        Ok(selectable[index].clone())
    }

    /// Drops the cursors for an unregistered service.
    pub fn forget_service(&self, service: &str) {
        self.cursors
            .retain(|key, _| key.split_once('/').map(|(s, _)| s) != Some(service));
    }
}

fn pool_key(service: &str, tier: Tier) -> String {
    format!("{}/{}", service, tier.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::breaker::BreakerConfig;
    use crate::store::HealthCheckConfig;

    fn make_registration(name: &str, addresses: Vec<(&str, Tier)>) -> ServiceRegistration {
        ServiceRegistration {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            instances: addresses
                .into_iter()
                .map(|(a, tier)| InstanceEndpoint {
                    address: a.to_string(),
                    tier,
                })
                .collect(),
            health_check: HealthCheckConfig::default(),
            call_timeout_ms: 1000,
            streaming: false,
            middleware: vec![],
        }
    }

    fn make_balancer() -> (LoadBalancer, Arc<HealthStore>, Arc<BreakerRegistry>) {
        let health = Arc::new(HealthStore::new());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 5,
            recovery_timeout_ms: 30,
            half_open_max_calls: 1,
        }));
        (
            LoadBalancer::new(Arc::clone(&health), Arc::clone(&breakers)),
            health,
            breakers,
        )
    }

    fn mark_unhealthy(health: &HealthStore, service: &str, address: &str) {
        for _ in 0..3 {
            health.record_failure(service, address, 3, "probe failed");
        }
    }

    // ========== Phase 1: Round Robin ==========

    #[test]
    fn test_single_instance_always_selected() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration("svc", vec![("a:1", Tier::Container)]);

        for _ in 0..5 {
            assert_eq!(lb.pick(&reg, Tier::Container).unwrap().address, "a:1");
        }
    }

    #[test]
    fn test_two_instances_alternate() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration("svc", vec![("a:1", Tier::Container), ("b:1", Tier::Container)]);

        let picks: Vec<String> = (0..4)
            .map(|_| lb.pick(&reg, Tier::Container).unwrap().address)
            .collect();
        assert_eq!(picks, vec!["a:1", "b:1", "a:1", "b:1"]);
    }

    #[test]
    fn test_three_instances_cycle_in_stable_order() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration(
            "svc",
            vec![
                ("a:1", Tier::Container),
                ("b:1", Tier::Container),
                ("c:1", Tier::Container),
            ],
        );

        let picks: Vec<String> = (0..6)
            .map(|_| lb.pick(&reg, Tier::Container).unwrap().address)
            .collect();
        assert_eq!(picks, vec!["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_pick_any_rotates_across_tiers() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration("svc", vec![("e:1", Tier::Edge), ("c:1", Tier::Container)]);

        let picks: Vec<String> = (0..4)
            .map(|_| lb.pick_any(&reg).unwrap().address)
            .collect();
        assert_eq!(picks, vec!["e:1", "c:1", "e:1", "c:1"]);
    }

    #[test]
    fn test_pick_any_skips_unhealthy() {
        let (lb, health, _) = make_balancer();
        let reg = make_registration("svc", vec![("e:1", Tier::Edge), ("c:1", Tier::Container)]);
        mark_unhealthy(&health, "svc", "e:1");

        for _ in 0..3 {
            assert_eq!(lb.pick_any(&reg).unwrap().address, "c:1");
        }
    }

    #[test]
    fn test_distribution_is_even() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration(
            "svc",
            vec![
                ("a:1", Tier::Container),
                ("b:1", Tier::Container),
                ("c:1", Tier::Container),
            ],
        );

        let mut counts = std::collections::HashMap::new();
        for _ in 0..99 {
            let addr = lb.pick(&reg, Tier::Container).unwrap().address;
            *counts.entry(addr).or_insert(0) += 1;
        }
        assert_eq!(counts.get("a:1"), Some(&33));
        assert_eq!(counts.get("b:1"), Some(&33));
        assert_eq!(counts.get("c:1"), Some(&33));
    }

    // ========== Phase 2: Tier Pools ==========

    #[test]
    fn test_pick_filters_by_tier() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration("svc", vec![("e:1", Tier::Edge), ("c:1", Tier::Container)]);

        assert_eq!(lb.pick(&reg, Tier::Edge).unwrap().address, "e:1");
        assert_eq!(lb.pick(&reg, Tier::Container).unwrap().address, "c:1");
    }

    #[test]
    fn test_tier_pools_have_independent_cursors() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration(
            "svc",
            vec![
                ("e1:1", Tier::Edge),
                ("e2:1", Tier::Edge),
                ("c1:1", Tier::Container),
                ("c2:1", Tier::Container),
            ],
        );

        assert_eq!(lb.pick(&reg, Tier::Edge).unwrap().address, "e1:1");
        // Container picks do not advance the edge cursor.
        assert_eq!(lb.pick(&reg, Tier::Container).unwrap().address, "c1:1");
        assert_eq!(lb.pick(&reg, Tier::Edge).unwrap().address, "e2:1");
    }

    #[test]
    fn test_empty_tier_fails() {
        let (lb, _, _) = make_balancer();
        let reg = make_registration("svc", vec![("c:1", Tier::Container)]);

        let err = lb.pick(&reg, Tier::Edge).unwrap_err();
        assert_eq!(err.code(), "NO_HEALTHY_INSTANCE");
    }

    // ========== Phase 3: Health Filtering ==========

    #[test]
    fn test_unhealthy_instance_skipped_order_preserved() {
        let (lb, health, _) = make_balancer();
        let reg = make_registration(
            "svc",
            vec![
                ("a:1", Tier::Container),
                ("b:1", Tier::Container),
                ("c:1", Tier::Container),
            ],
        );

        mark_unhealthy(&health, "svc", "b:1");

        let picks: Vec<String> = (0..4)
            .map(|_| lb.pick(&reg, Tier::Container).unwrap().address)
            .collect();
        assert_eq!(picks, vec!["a:1", "c:1", "a:1", "c:1"]);
    }

    #[test]
    fn test_unknown_instances_are_selectable() {
        let (lb, health, _) = make_balancer();
        let reg = make_registration("svc", vec![("a:1", Tier::Container), ("b:1", Tier::Container)]);

        // Only a:1 has been probed; b:1 is still unknown and stays in the pool.
        health.record_success("svc", "a:1", 1);
        let picks: Vec<String> = (0..2)
            .map(|_| lb.pick(&reg, Tier::Container).unwrap().address)
            .collect();
        assert_eq!(picks, vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_all_unhealthy_returns_no_healthy_instance() {
        let (lb, health, _) = make_balancer();
        let reg = make_registration("svc", vec![("a:1", Tier::Container), ("b:1", Tier::Container)]);

        mark_unhealthy(&health, "svc", "a:1");
        mark_unhealthy(&health, "svc", "b:1");

        let err = lb.pick(&reg, Tier::Container).unwrap_err();
        assert_eq!(err.code(), "NO_HEALTHY_INSTANCE");
    }

    #[test]
    fn test_failing_instance_scenario() {
        // Register two instances, fail one three consecutive probes with
        // threshold 3: the next five picks all return the survivor.
        let (lb, health, _) = make_balancer();
        let reg = make_registration("a", vec![("a1:1", Tier::Container), ("a2:1", Tier::Container)]);

        for _ in 0..3 {
            health.record_failure("a", "a2:1", 3, "probe failed");
        }

        for _ in 0..5 {
            assert_eq!(lb.pick(&reg, Tier::Container).unwrap().address, "a1:1");
        }
    }

    #[test]
    fn test_recovered_instance_rejoins_pool() {
        let (lb, health, _) = make_balancer();
        let reg = make_registration("svc", vec![("a:1", Tier::Container), ("b:1", Tier::Container)]);

        mark_unhealthy(&health, "svc", "b:1");
        assert_eq!(lb.pick(&reg, Tier::Container).unwrap().address, "a:1");

        health.record_success("svc", "b:1", 1);
        let picks: Vec<String> = (0..2)
            .map(|_| lb.pick(&reg, Tier::Container).unwrap().address)
            .collect();
        assert!(picks.contains(&"b:1".to_string()));
    }

    // ========== Phase 4: Circuit Integration ==========

    #[test]
    fn test_open_circuit_fails_fast() {
        let (lb, _, breakers) = make_balancer();
        let reg = make_registration("svc", vec![("a:1", Tier::Container)]);

        for _ in 0..5 {
            breakers.record_failure("svc");
        }

        let err = lb.pick(&reg, Tier::Container).unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_OPEN");
    }

    #[test]
    fn test_half_open_admits_trial_pick() {
        let (lb, _, breakers) = make_balancer();
        let reg = make_registration("b", vec![("a:1", Tier::Container)]);

        for _ in 0..5 {
            breakers.record_failure("b");
        }
        assert!(lb.pick(&reg, Tier::Container).is_err());

        std::thread::sleep(std::time::Duration::from_millis(50));
        let picked = lb.pick(&reg, Tier::Container).unwrap();
        assert_eq!(picked.address, "a:1");
        assert_eq!(
            breakers.state("b"),
            crate::proxy::breaker::CircuitState::HalfOpen
        );
    }

    #[test]
    fn test_no_instance_releases_half_open_slot() {
        let (lb, health, breakers) = make_balancer();
        let reg = make_registration("svc", vec![("a:1", Tier::Container)]);

        mark_unhealthy(&health, "svc", "a:1");
        for _ in 0..5 {
            breakers.record_failure("svc");
        }
        std::thread::sleep(std::time::Duration::from_millis(50));

        // Pick admits the half-open trial, finds no instance, and must give
        // the slot back so a later pick can still run the trial.
        assert_eq!(
            lb.pick(&reg, Tier::Container).unwrap_err().code(),
            "NO_HEALTHY_INSTANCE"
        );
        health.record_success("svc", "a:1", 1);
        assert!(lb.pick(&reg, Tier::Container).is_ok());
    }

    // ========== Phase 5: Concurrency ==========

    #[test]
    fn test_concurrent_picks() {
        use std::thread;

        let (lb, _, _) = make_balancer();
        let lb = Arc::new(lb);
        let reg = make_registration(
            "svc",
            vec![
                ("a:1", Tier::Container),
                ("b:1", Tier::Container),
                ("c:1", Tier::Container),
            ],
        );

        let mut handles = vec![];
        for _ in 0..10 {
            let lb = Arc::clone(&lb);
            let reg = reg.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _ = lb.pick(&reg, Tier::Container);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_load_balancer_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LoadBalancer>();
    }
}
