//! # Metrics
//!
//! Request counters and bounded latency rings, per service and gateway
//! wide. Latency percentiles use the nearest-rank method over the retained
//! samples; rings keep the most recent [`MAX_LATENCY_SAMPLES`] entries and
//! overwrite the oldest when full.
//!
//! The registry is an ordinary value owned by the orchestrator and shared
//! behind `Arc`. Readers may observe a request slightly after its response
//! was sent, which is acceptable lag.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::HealthThresholds;

/// Retained latency samples per service.
pub const MAX_LATENCY_SAMPLES: usize = 1000;

#[derive(Debug, Default)]
struct ServiceMetrics {
    requests: u64,
    errors: u64,
    latencies: VecDeque<u64>,
    last_request: Option<DateTime<Utc>>,
}

/// Concurrent counter store for the whole gateway.
pub struct MetricsRegistry {
    started_at: Instant,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    services: DashMap<String, ServiceMetrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            services: DashMap::new(),
        }
    }

    /// Record one finished request. `service` is `None` for requests that
    /// never resolved a proxy target (bad routes, early rejections).
    pub fn record(&self, service: Option<&str>, status: u16, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(name) = service {
            let mut metrics = self.services.entry(name.to_string()).or_default();
            metrics.requests += 1;
            if status >= 400 {
                metrics.errors += 1;
            }
            metrics.latencies.push_back(latency_ms);
            while metrics.latencies.len() > MAX_LATENCY_SAMPLES {
                metrics.latencies.pop_front();
            }
            metrics.last_request = Some(Utc::now());
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Point-in-time aggregate with derived rates and percentiles.
    pub fn snapshot(&self) -> GatewaySnapshot {
        let mut services = BTreeMap::new();
        let mut all_latencies: Vec<u64> = Vec::new();

        for entry in self.services.iter() {
            let mut samples: Vec<u64> = entry.latencies.iter().copied().collect();
            all_latencies.extend_from_slice(&samples);
            samples.sort_unstable();

            services.insert(
                entry.key().clone(),
                ServiceMetricsSnapshot {
                    requests: entry.requests,
                    errors: entry.errors,
                    error_rate: rate(entry.errors, entry.requests),
                    avg_latency_ms: mean(&samples),
                    p95_latency_ms: nearest_rank(&samples, 95.0),
                    p99_latency_ms: nearest_rank(&samples, 99.0),
                    last_request: entry.last_request,
                },
            );
        }

        all_latencies.sort_unstable();
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        GatewaySnapshot {
            total_requests,
            total_errors,
            error_rate: rate(total_errors, total_requests),
            avg_latency_ms: mean(&all_latencies),
            p95_latency_ms: nearest_rank(&all_latencies, 95.0),
            p99_latency_ms: nearest_rank(&all_latencies, 99.0),
            uptime_seconds: self.uptime_seconds(),
            services,
        }
    }
}

/// Derived per-service view.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub last_request: Option<DateTime<Utc>>,
}

/// Derived gateway-wide view.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub uptime_seconds: u64,
    pub services: BTreeMap<String, ServiceMetricsSnapshot>,
}

impl GatewaySnapshot {
    /// The `/health` verdict over the retained window.
    pub fn is_healthy(&self, thresholds: &HealthThresholds) -> bool {
        self.error_rate < thresholds.error_rate_threshold
            && self.avg_latency_ms < thresholds.avg_latency_threshold_ms as f64
    }
}

fn rate(errors: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        errors as f64 / requests as f64
    }
}

fn mean(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }
}

/// Nearest-rank percentile over a sorted sample set.
fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
