//! # Health Prober
//!
//! Periodically probes every registered instance with a bounded GET against
//! its health path and records the observation in the registry. A 2xx
//! response marks the instance healthy; a non-2xx status, transport error
//! or timeout marks it unhealthy.
//!
//! Probing is best-effort: ticks missed because a sweep overran are dropped
//! rather than queued, and probe failures are counted locally without ever
//! surfacing to clients.

use crate::common::{HealthStatus, Subsystem};
use crate::registry::{HealthState, Instance, ServiceRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Background prober driving instance health transitions.
pub struct HealthProber {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
    interval: Duration,
    probes_run: AtomicU64,
    probe_errors: AtomicU64,
}

impl HealthProber {
    /// Build a prober with its own HTTP client bounded by `timeout`.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            registry,
            client,
            interval,
            probes_run: AtomicU64::new(0),
            probe_errors: AtomicU64::new(0),
        })
    }

    /// Spawn the periodic probe loop. The first sweep runs immediately.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let prober = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(prober.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                prober.probe_all().await;
            }
        })
    }

    /// Probe every instance of every service once.
    pub async fn probe_all(&self) {
        for service in self.registry.service_names() {
            let Ok(instances) = self.registry.list_instances(&service) else {
                continue;
            };
            for instance in instances {
                self.probe_instance(&service, &instance).await;
            }
        }
    }

    async fn probe_instance(&self, service: &str, instance: &Instance) {
        self.probes_run.fetch_add(1, Ordering::Relaxed);

        let path = if instance.health_path.starts_with('/') {
            instance.health_path.clone()
        } else {
            format!("/{}", instance.health_path)
        };
        let url = format!("http://{}{}", instance.addr(), path);

        let observed = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => HealthState::Healthy,
            Ok(response) => {
                tracing::debug!(
                    service,
                    instance = %instance.id,
                    status = response.status().as_u16(),
                    "health probe returned non-success status"
                );
                HealthState::Unhealthy
            }
            Err(err) => {
                self.probe_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(service, instance = %instance.id, error = %err, "health probe failed");
                HealthState::Unhealthy
            }
        };

        // The instance may have been deregistered mid-probe; that is not an
        // error worth reporting.
        if let Ok(previous) = self.registry.set_health(service, &instance.id, observed) {
            if previous != observed {
                tracing::info!(
                    service,
                    instance = %instance.id,
                    from = ?previous,
                    to = ?observed,
                    "instance health changed"
                );
            }
        }
    }

    pub fn probe_error_count(&self) -> u64 {
        self.probe_errors.load(Ordering::Relaxed)
    }

    pub fn probes_run(&self) -> u64 {
        self.probes_run.load(Ordering::Relaxed)
    }
}

impl Subsystem for HealthProber {
    fn name(&self) -> &'static str {
        "health_prober"
    }

    fn health_status(&self) -> HealthStatus {
        HealthStatus::ok(serde_json::json!({
            "interval_secs": self.interval.as_secs(),
            "probes_run": self.probes_run(),
            "probe_errors": self.probe_error_count(),
        }))
    }
}
