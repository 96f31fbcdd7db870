//! # Load Balancer
//!
//! Selects an instance from a healthy snapshot under a named policy:
//!
//! - **round-robin**: a per-service cursor advances modulo the snapshot
//!   length, walking instances in insertion order.
//! - **weighted**: instances are drawn with probability proportional to
//!   their weight; ties fall back to insertion order.
//! - **least-connections**: the instance with the fewest in-flight calls
//!   wins; ties break on higher weight, then insertion order.
//!
//! The balancer never inspects health itself; callers hand it the already
//! filtered healthy set, and an empty set is a routing failure.

use crate::error::MeshError;
use crate::registry::Instance;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Instance selection policy, configured per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancePolicy {
    RoundRobin,
    Weighted,
    LeastConnections,
}

impl Default for LoadBalancePolicy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// Stateful selector; the only state is the per-service round-robin cursor.
pub struct LoadBalancer {
    cursors: DashMap<String, Arc<AtomicUsize>>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Pick an instance from `healthy` for `service` under `policy`.
    ///
    /// Fails with [`MeshError::NoHealthyInstance`] on an empty snapshot; a
    /// one-element snapshot short-circuits regardless of policy.
    pub fn select(
        &self,
        service: &str,
        policy: LoadBalancePolicy,
        healthy: &[Instance],
    ) -> Result<Instance, MeshError> {
        if healthy.is_empty() {
            return Err(MeshError::NoHealthyInstance(service.to_string()));
        }
        if healthy.len() == 1 {
            return Ok(healthy[0].clone());
        }

        let instance = match policy {
            LoadBalancePolicy::RoundRobin => self.round_robin(service, healthy),
            LoadBalancePolicy::Weighted => Self::weighted(healthy),
            LoadBalancePolicy::LeastConnections => Self::least_connections(healthy),
        };
        Ok(instance.clone())
    }

    /// Drop per-service selection state; called on service deregistration.
    pub fn forget(&self, service: &str) {
        self.cursors.remove(service);
    }

    fn round_robin<'a>(&self, service: &str, healthy: &'a [Instance]) -> &'a Instance {
        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        let index = cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        &healthy[index]
    }

    fn weighted(healthy: &[Instance]) -> &Instance {
        let total: u64 = healthy.iter().map(|i| u64::from(i.weight)).sum();
        let mut draw = rand::thread_rng().gen_range(0..total);
        for instance in healthy {
            let weight = u64::from(instance.weight);
            if draw < weight {
                return instance;
            }
            draw -= weight;
        }
        // Unreachable while total == sum of weights; keep the last as a
        // safe fallback.
        &healthy[healthy.len() - 1]
    }

    fn least_connections(healthy: &[Instance]) -> &Instance {
        let mut best = &healthy[0];
        for candidate in &healthy[1..] {
            let load = candidate.active_connections();
            let best_load = best.active_connections();
            if load < best_load || (load == best_load && candidate.weight > best.weight) {
                best = candidate;
            }
        }
        best
    }
}
