//! # Circuit Breaker
//!
//! Per-service three-state guard preventing calls to a failing upstream.
//!
//! ## States
//!
//! - **Closed**: calls pass through; consecutive failures are counted and
//!   reaching the threshold opens the circuit.
//! - **Open**: calls are rejected without dialing the upstream until the
//!   open-timeout elapses, at which point the next admission attempt moves
//!   the circuit to half-open.
//! - **Half-open**: trial traffic is admitted. Reaching the configured
//!   success count closes the circuit; the first failure reopens it.
//!
//! During half-open, all concurrent callers are admitted until the first
//! failure reopens the circuit; there is no trial-call cap.
//!
//! The admit/record API is split in two because the caller learns the
//! outcome only after the upstream responds: `try_admit` gates the dial,
//! `record_success`/`record_failure` feed the result back.

use crate::common::{HealthStatus, Subsystem};
use crate::error::MeshError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds controlling state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in closed state before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before permitting a trial.
    #[serde(with = "crate::common::duration_serde", default = "default_open_timeout")]
    pub open_timeout: Duration,
    /// Successes required in half-open state to close the circuit.
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_half_open_successes() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout: default_open_timeout(),
            half_open_successes: default_half_open_successes(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            opened_at: None,
            last_failure: None,
        }
    }
}

/// Serializable point-in-time view of a breaker, exposed over `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    /// Seconds since the last recorded failure, if any.
    pub seconds_since_last_failure: Option<u64>,
}

/// Three-state circuit breaker for a single service.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Gate a call before dialing the upstream.
    ///
    /// An open circuit whose timeout has elapsed transitions to half-open
    /// and admits the caller; otherwise the rejection carries the time
    /// remaining until a trial is permitted.
    pub fn try_admit(&self) -> Result<(), MeshError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_successes = 0;
                    tracing::info!(service = %self.service, "circuit breaker half-open, admitting trial traffic");
                    Ok(())
                } else {
                    Err(MeshError::CircuitOpen {
                        service: self.service.clone(),
                        retry_after: self.config.open_timeout - elapsed,
                    })
                }
            }
        }
    }

    /// Feed back a successful upstream outcome.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.half_open_successes {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.half_open_successes = 0;
                    state.opened_at = None;
                    tracing::info!(service = %self.service, "circuit breaker closed after recovery");
                }
            }
            // A straggler that was admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    /// Feed back a failed upstream outcome.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.last_failure = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    tracing::warn!(
                        service = %self.service,
                        failures = state.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.half_open_successes = 0;
                tracing::warn!(service = %self.service, "trial call failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("breaker lock poisoned").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            service: self.service.clone(),
            state: state.state,
            failure_count: state.failure_count,
            half_open_successes: state.half_open_successes,
            seconds_since_last_failure: state.last_failure.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// One breaker per registered service, created at registration time and
/// kept for the lifetime of the service.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    /// Create (or keep) the breaker for a service.
    pub fn register(&self, service: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config)))
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| b.clone())
    }

    pub fn remove(&self, service: &str) {
        self.breakers.remove(service);
    }

    /// Snapshots of every breaker, sorted by service name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

impl Subsystem for BreakerRegistry {
    fn name(&self) -> &'static str {
        "circuit_breakers"
    }

    fn health_status(&self) -> HealthStatus {
        let snapshots = self.snapshots();
        let open: Vec<&str> = snapshots
            .iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.service.as_str())
            .collect();
        let details = serde_json::json!({
            "total": snapshots.len(),
            "open": open,
        });
        if open.is_empty() {
            HealthStatus::ok(details)
        } else {
            HealthStatus::degraded(details)
        }
    }
}
