//! # Mesh Error Types
//!
//! Error taxonomy shared by the data-plane components. Every variant carries
//! enough context for the gateway layer to map it to an HTTP status without
//! inspecting message strings.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the mesh data plane.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The named service has never been registered.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Strict-create registration collided with an existing service.
    #[error("service already registered: {0}")]
    ServiceConflict(String),

    /// The instance id does not exist within the service.
    #[error("instance not found: {service}/{instance}")]
    InstanceNotFound { service: String, instance: String },

    /// Instance weights must be >= 1.
    #[error("invalid weight {weight} for instance of service {service}")]
    InvalidWeight { service: String, weight: u32 },

    /// Discovery found no healthy instance to route to.
    #[error("no healthy instance for service: {0}")]
    NoHealthyInstance(String),

    /// The per-service circuit breaker is open and rejecting calls.
    #[error("circuit open for service: {service}")]
    CircuitOpen {
        service: String,
        /// Time remaining until the breaker permits a trial call.
        retry_after: Duration,
    },
}

impl MeshError {
    /// Whether the error is a routing failure that should surface as 503.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            MeshError::NoHealthyInstance(_) | MeshError::CircuitOpen { .. }
        )
    }
}
