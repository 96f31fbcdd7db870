//! # Service Registry
//!
//! Owns the set of registered services and their instances. Discovery reads
//! work on snapshot copies so the hot path never holds a registry lock while
//! routing; writers (registration, the health prober) serialize per shard
//! through the concurrent map.
//!
//! Instance insertion order is preserved and observable: the round-robin
//! balancer walks instances in the order they were registered.

use crate::balancer::LoadBalancePolicy;
use crate::breaker::CircuitBreakerConfig;
use crate::error::MeshError;
use crate::ratelimit::RateLimitConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Probe-driven health of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Never probed since registration.
    Unknown,
    /// Last probe returned 2xx.
    Healthy,
    /// Last probe failed, timed out or returned non-2xx.
    Unhealthy,
}

/// Static description of a service, supplied at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name; doubles as the routing segment in request paths.
    pub name: String,
    /// Declared API version tag (e.g. `v1`).
    pub version: String,
    /// Default probe path for instances that do not override it.
    pub health_path: String,
    /// Instance selection policy.
    pub load_balancing: LoadBalancePolicy,
    /// Circuit breaker thresholds for this service.
    pub breaker: CircuitBreakerConfig,
    /// Per-service rate-limit override; `None` uses the gateway default.
    pub rate_limit: Option<RateLimitConfig>,
    /// Roles allowed to call this service. Empty means any authenticated
    /// principal.
    pub required_roles: Vec<String>,
}

/// A single reachable address for a service.
///
/// The active-connection gauge is shared between the registry record and any
/// snapshots, so least-connections selection sees live values even though it
/// iterates a copy.
#[derive(Debug)]
pub struct Instance {
    /// Unique within the service; derived from the address.
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub health: HealthState,
    /// Probe path for this instance.
    pub health_path: String,
    /// When the prober last observed this instance.
    pub last_probe: Option<DateTime<Utc>>,
    active: Arc<AtomicU32>,
}

impl Clone for Instance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight,
            health: self.health,
            health_path: self.health_path.clone(),
            last_probe: self.last_probe,
            active: Arc::clone(&self.active),
        }
    }
}

impl Instance {
    /// `host:port` form used when dialing the instance.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Current number of in-flight requests against this instance.
    pub fn active_connections(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    /// Acquire an in-flight guard; the gauge drops with the guard.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            gauge: Arc::clone(&self.active),
        }
    }
}

/// RAII guard keeping the active-connection gauge accurate on every exit
/// path, including cancellation.
pub struct ConnectionGuard {
    gauge: Arc<AtomicU32>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ServiceEntry {
    spec: ServiceSpec,
    instances: Vec<Instance>,
}

/// Concurrent store of services and their instance sets.
pub struct ServiceRegistry {
    services: DashMap<String, ServiceEntry>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Create or replace a service record.
    ///
    /// With `strict` set, an existing service of the same name is a
    /// [`MeshError::ServiceConflict`]. A non-strict replace keeps the
    /// current instance set and swaps only the spec.
    pub fn register_service(&self, spec: ServiceSpec, strict: bool) -> Result<(), MeshError> {
        match self.services.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if strict {
                    return Err(MeshError::ServiceConflict(spec.name));
                }
                occupied.get_mut().spec = spec;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ServiceEntry {
                    spec,
                    instances: Vec::new(),
                });
            }
        }
        Ok(())
    }

    /// Remove a service and all of its instances.
    pub fn deregister_service(&self, name: &str) -> Result<(), MeshError> {
        self.services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MeshError::UnknownService(name.to_string()))
    }

    /// Append an instance to a service; initial health is `Unknown`.
    ///
    /// Registration is idempotent per address: re-registering `host:port`
    /// replaces the existing record in place, keeping its position in the
    /// insertion order.
    pub fn register_instance(
        &self,
        service: &str,
        host: &str,
        port: u16,
        weight: u32,
        health_path: Option<&str>,
    ) -> Result<String, MeshError> {
        if weight < 1 {
            return Err(MeshError::InvalidWeight {
                service: service.to_string(),
                weight,
            });
        }

        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| MeshError::UnknownService(service.to_string()))?;

        let id = format!("{host}:{port}");
        let health_path = health_path
            .map(str::to_string)
            .unwrap_or_else(|| entry.spec.health_path.clone());
        let instance = Instance {
            id: id.clone(),
            host: host.to_string(),
            port,
            weight,
            health: HealthState::Unknown,
            health_path,
            last_probe: None,
            active: Arc::new(AtomicU32::new(0)),
        };

        if let Some(slot) = entry.instances.iter_mut().find(|i| i.id == id) {
            *slot = instance;
        } else {
            entry.instances.push(instance);
        }
        Ok(id)
    }

    /// Remove an instance by id.
    pub fn deregister_instance(&self, service: &str, instance_id: &str) -> Result<(), MeshError> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| MeshError::UnknownService(service.to_string()))?;

        let before = entry.instances.len();
        entry.instances.retain(|i| i.id != instance_id);
        if entry.instances.len() == before {
            return Err(MeshError::InstanceNotFound {
                service: service.to_string(),
                instance: instance_id.to_string(),
            });
        }
        Ok(())
    }

    /// Immutable snapshot of all instances of a service, safe to iterate
    /// without touching the registry again.
    pub fn list_instances(&self, service: &str) -> Result<Vec<Instance>, MeshError> {
        self.services
            .get(service)
            .map(|entry| entry.instances.clone())
            .ok_or_else(|| MeshError::UnknownService(service.to_string()))
    }

    /// Snapshot filtered to healthy instances only.
    pub fn healthy_instances(&self, service: &str) -> Result<Vec<Instance>, MeshError> {
        Ok(self
            .list_instances(service)?
            .into_iter()
            .filter(|i| i.health == HealthState::Healthy)
            .collect())
    }

    /// Record a probe observation. Returns the previous health state so the
    /// caller can log transitions.
    pub fn set_health(
        &self,
        service: &str,
        instance_id: &str,
        health: HealthState,
    ) -> Result<HealthState, MeshError> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| MeshError::UnknownService(service.to_string()))?;

        let instance = entry
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| MeshError::InstanceNotFound {
                service: service.to_string(),
                instance: instance_id.to_string(),
            })?;

        let previous = instance.health;
        instance.health = health;
        instance.last_probe = Some(Utc::now());
        Ok(previous)
    }

    /// Spec of a registered service, if any.
    pub fn spec(&self, service: &str) -> Option<ServiceSpec> {
        self.services.get(service).map(|entry| entry.spec.clone())
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Names of all registered services, sorted for stable output.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn instance_count(&self, service: &str) -> usize {
        self.services
            .get(service)
            .map(|entry| entry.instances.len())
            .unwrap_or(0)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}
