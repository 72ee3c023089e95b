//! Periodic health probes, one cancellable task per registered service.
//!
//! Each tick probes every instance of the service with the configured
//! timeout and records the verdict in the [`HealthStore`]. There is no
//! retry within a tick; the next scheduled tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::ServiceRegistration;

use super::HealthStore;

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the probe tasks for all registered services.
///
/// Tasks are tied to the registration lifecycle: `stop` cancels the task
/// and awaits it, so no probe is issued after `stop` returns.
pub struct MonitorSet {
    client: reqwest::Client,
    health: Arc<HealthStore>,
    tasks: DashMap<String, MonitorHandle>,
}

impl MonitorSet {
    pub fn new(client: reqwest::Client, health: Arc<HealthStore>) -> Self {
        Self {
            client,
            health,
            tasks: DashMap::new(),
        }
    }

    /// Starts (or restarts) the probe task for a registration.
    pub fn start(&self, registration: ServiceRegistration) {
        let name = registration.name.clone();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_monitor(
            self.client.clone(),
            Arc::clone(&self.health),
            registration,
            cancel.clone(),
        ));
        if let Some(old) = self.tasks.insert(name, MonitorHandle { cancel, task }) {
            old.cancel.cancel();
            old.task.abort();
        }
    }

    /// Stops the probe task for a service and waits for it to finish.
    pub async fn stop(&self, name: &str) {
        if let Some((_, handle)) = self.tasks.remove(name) {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    /// Stops every probe task; used on gateway shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

async fn run_monitor(
    client: reqwest::Client,
    health: Arc<HealthStore>,
    registration: ServiceRegistration,
    cancel: CancellationToken,
) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(registration.health_check.interval_ms));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = probe_all(&client, &health, &registration) => {}
        }
    }
    tracing::debug!(service = %registration.name, "health monitor stopped");
}

/// Probes every instance of the service once.
async fn probe_all(
    client: &reqwest::Client,
    health: &HealthStore,
    registration: &ServiceRegistration,
) {
    let check = &registration.health_check;
    let method = reqwest::Method::from_bytes(check.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    for instance in &registration.instances {
        let url = format!("http://{}{}", instance.address, check.path);
        let result = client
            .request(method.clone(), &url)
            .timeout(Duration::from_millis(check.timeout_ms))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                health.record_success(
                    &registration.name,
                    &instance.address,
                    check.success_threshold,
                );
            }
            // Timeout, connection refused, and non-2xx all count the same.
            Ok(response) => {
                health.record_failure(
                    &registration.name,
                    &instance.address,
                    check.failure_threshold,
                    &format!("status {}", response.status()),
                );
            }
            Err(error) => {
                health.record_failure(
                    &registration.name,
                    &instance.address,
                    check.failure_threshold,
                    &error.to_string(),
                );
            }
        }
    }
}
