//! # Orchestrator
//!
//! Owns every mesh component and drives the gateway lifecycle:
//!
//! ```text
//! initializing -> initialized -> running -> stopping -> stopped
//!                                   \-> failed (startup error)
//! ```
//!
//! On startup it registers the configured services and their instances
//! (individual registration failures are logged and skipped, never fatal)
//! and starts the periodic jobs: health probing and housekeeping (rate-limit
//! bucket eviction plus a metrics rollup). On shutdown it flips a gate that
//! rejects new requests, waits for in-flight requests to drain within the
//! grace period, then stops the periodic tasks.
//!
//! There are no module-level singletons: `main` builds exactly one
//! orchestrator, and tests build their own.

use crate::config::GatewayConfig;
use crate::metrics::MetricsRegistry;
use ferrogate_mesh::breaker::BreakerRegistry;
use ferrogate_mesh::common::{HealthStatus, Subsystem};
use ferrogate_mesh::health::HealthProber;
use ferrogate_mesh::ratelimit::RateLimiter;
use ferrogate_mesh::registry::ServiceRegistry;
use ferrogate_mesh::LoadBalancer;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Interval between housekeeping sweeps (bucket eviction, rollup logging).
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Lifecycle of the composed gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Initializing,
    Initialized,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Root object wiring registry, breakers, balancer, limiter, metrics and
/// the prober together.
pub struct Orchestrator {
    config: Arc<GatewayConfig>,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<BreakerRegistry>,
    balancer: Arc<LoadBalancer>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRegistry>,
    prober: Arc<HealthProber>,
    state: Mutex<LifecycleState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    in_flight: Arc<AtomicU64>,
}

/// RAII token counting one in-flight request.
pub struct InFlightGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Orchestrator {
    /// Construct all components from configuration.
    pub fn new(config: Arc<GatewayConfig>) -> anyhow::Result<Self> {
        let registry = Arc::new(ServiceRegistry::new());
        let prober = Arc::new(HealthProber::new(
            Arc::clone(&registry),
            config.timeouts.health_check_interval,
            config.timeouts.probe,
        )?);

        let orchestrator = Self {
            config,
            registry,
            breakers: Arc::new(BreakerRegistry::new()),
            balancer: Arc::new(LoadBalancer::new()),
            limiter: Arc::new(RateLimiter::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            prober,
            state: Mutex::new(LifecycleState::Initializing),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            in_flight: Arc::new(AtomicU64::new(0)),
        };
        // All components exist; `start()` takes over from here.
        *orchestrator.lock_state() = LifecycleState::Initialized;
        Ok(orchestrator)
    }

    /// Register configured services and start the periodic jobs.
    pub fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.lock_state();
            if *state != LifecycleState::Initialized {
                anyhow::bail!("orchestrator cannot start from state {:?}", *state);
            }
            *state = LifecycleState::Running;
        }

        for service in &self.config.services {
            if let Err(err) = self.registry.register_service(service.to_spec(), true) {
                tracing::warn!(service = %service.name, error = %err, "skipping service registration");
                continue;
            }
            self.breakers.register(&service.name, service.circuit.clone());

            for instance in &service.instances {
                match self.registry.register_instance(
                    &service.name,
                    &instance.host,
                    instance.port,
                    instance.weight,
                    instance.health_path.as_deref(),
                ) {
                    Ok(id) => {
                        tracing::info!(service = %service.name, instance = %id, weight = instance.weight, "registered instance")
                    }
                    Err(err) => {
                        tracing::warn!(service = %service.name, error = %err, "skipping instance registration")
                    }
                }
            }
        }
        tracing::info!(
            services = self.registry.service_count(),
            "service registration complete"
        );

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.push(Arc::clone(&self.prober).spawn());
        tasks.push(self.spawn_housekeeping());
        Ok(())
    }

    fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_millis() as u64;
                limiter.sweep_idle(now_ms);

                let snapshot = metrics.snapshot();
                tracing::debug!(
                    requests = snapshot.total_requests,
                    errors = snapshot.total_errors,
                    error_rate = snapshot.error_rate,
                    avg_latency_ms = snapshot.avg_latency_ms,
                    "metrics rollup"
                );
            }
        })
    }

    /// Stop accepting requests, drain in-flight work and halt periodic
    /// tasks. Requests already admitted keep running until the grace period
    /// ends.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if matches!(*state, LifecycleState::Stopping | LifecycleState::Stopped) {
                return;
            }
            *state = LifecycleState::Stopping;
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        tracing::info!(
            grace_secs = self.config.timeouts.shutdown_grace.as_secs(),
            "gateway shutting down, draining in-flight requests"
        );

        let deadline = Instant::now() + self.config.timeouts.shutdown_grace;
        while self.in_flight.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let remaining = self.in_flight.load(Ordering::Relaxed);
        if remaining > 0 {
            tracing::warn!(remaining, "shutdown grace elapsed with requests still in flight");
        }

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        *self.lock_state() = LifecycleState::Stopped;
        tracing::info!("gateway stopped");
    }

    /// Mark startup as failed; used by `main` when the listener cannot
    /// bind.
    pub fn mark_failed(&self) {
        *self.lock_state() = LifecycleState::Failed;
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Count one admitted request; the gauge drops with the guard.
    pub fn inflight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run one full probe sweep immediately; used by tests and admin
    /// tooling rather than waiting for the next tick.
    pub async fn probe_once(&self) {
        self.prober.probe_all().await;
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    pub fn balancer(&self) -> Arc<LoadBalancer> {
        Arc::clone(&self.balancer)
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Health reports from every owned subsystem.
    pub fn subsystem_reports(&self) -> Vec<(&'static str, HealthStatus)> {
        let subsystems: [&dyn Subsystem; 3] =
            [self.prober.as_ref(), self.breakers.as_ref(), self.limiter.as_ref()];
        let mut reports: Vec<(&'static str, HealthStatus)> = subsystems
            .iter()
            .map(|s| (s.name(), s.health_status()))
            .collect();
        reports.push((self.name(), self.health_status()));
        reports
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        self.state.lock().expect("lifecycle state lock poisoned")
    }
}

impl Subsystem for Orchestrator {
    fn name(&self) -> &'static str {
        "orchestrator"
    }

    fn health_status(&self) -> HealthStatus {
        let state = self.state();
        let details = serde_json::json!({
            "state": state,
            "in_flight": self.in_flight(),
            "services": self.registry.service_count(),
        });
        if state == LifecycleState::Running {
            HealthStatus::ok(details)
        } else {
            HealthStatus::degraded(details)
        }
    }
}
