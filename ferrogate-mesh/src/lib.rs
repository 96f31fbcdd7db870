//! # Ferrogate Mesh
//!
//! Data-plane primitives for the Ferrogate gateway: a concurrent service
//! registry, a periodic health prober, pluggable load-balancing policies,
//! per-service circuit breakers, a multi-algorithm rate limiter and an
//! opt-in retry helper for mesh callers.
//!
//! ## Architecture
//!
//! - **`registry`**: services and instances; snapshot reads for the hot path
//! - **`health`**: best-effort periodic probing driving health transitions
//! - **`balancer`**: round-robin, weighted and least-connections selection
//! - **`breaker`**: three-state circuit breakers with an admit/record API
//! - **`ratelimit`**: fixed-window, sliding-window and token-bucket buckets
//! - **`retry`**: fixed-delay retries for idempotent calls, off by default
//! - **`common`**: duration serde and the subsystem health contract
//!
//! Components are plain values owned by whoever composes them; there are no
//! globals. The gateway's orchestrator constructs one of each and shares
//! them behind `Arc`.

pub mod balancer;
pub mod breaker;
pub mod common;
pub mod error;
pub mod health;
pub mod ratelimit;
pub mod registry;
pub mod retry;

pub use balancer::{LoadBalancePolicy, LoadBalancer};
pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use common::{HealthStatus, Subsystem};
pub use error::MeshError;
pub use health::HealthProber;
pub use ratelimit::{KeyStrategy, RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, RateLimiter};
pub use registry::{HealthState, Instance, ServiceRegistry, ServiceSpec};
pub use retry::{call_with_retry, is_idempotent, RetryPolicy};
