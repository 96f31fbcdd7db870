//! # Gateway Error Types
//!
//! The client-facing error taxonomy and its HTTP mapping. Every rejection
//! leaving the gateway carries the same body shape,
//! `{error, code, requestId, details?}`, so callers can correlate failures
//! with logs through the request id. Sensitive detail (upstream addresses,
//! internal messages, backtraces) never reaches a response body.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use ferrogate_mesh::error::MeshError;
use ferrogate_mesh::ratelimit::RateLimitDecision;
use serde_json::json;
use thiserror::Error;

/// Everything that can go wrong while servicing a request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed body, schema violation or unparseable JSON.
    #[error("{message}")]
    BadRequest { message: String },

    /// Missing or invalid credentials, or a failed mTLS header check.
    #[error("{message}")]
    Unauthenticated { message: String },

    /// Authenticated principal lacks the required permission.
    #[error("{message}")]
    Forbidden { message: String },

    /// Unknown route or unregistered service.
    #[error("{message}")]
    NotFound { message: String },

    /// Request body exceeded the configured limit.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Non-JSON content where a JSON schema applies.
    #[error("{message}")]
    UnsupportedMediaType { message: String },

    /// Rate-limit rejection; the decision feeds the response headers.
    #[error("rate limit exceeded")]
    TooManyRequests { decision: RateLimitDecision },

    /// The per-service circuit breaker rejected the call before dialing.
    #[error("service temporarily unavailable: {service}")]
    CircuitOpen {
        service: String,
        retry_after_secs: u64,
    },

    /// Discovery found no healthy instance.
    #[error("no healthy instance available for {service}")]
    NoHealthyInstance { service: String },

    /// The gateway is draining and no longer accepts new requests.
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// Transport or DNS failure dialing the upstream.
    #[error("upstream connection failed")]
    BadGateway,

    /// The upstream did not answer within the request deadline.
    #[error("upstream timed out")]
    GatewayTimeout,

    /// Unexpected internal failure; details go to the log, not the client.
    #[error("internal server error")]
    Internal { message: String },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            GatewayError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. }
            | GatewayError::NoHealthyInstance { .. }
            | GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadGateway => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest { .. } => "BadRequest",
            GatewayError::Unauthenticated { .. } => "Unauthenticated",
            GatewayError::Forbidden { .. } => "Forbidden",
            GatewayError::NotFound { .. } => "NotFound",
            GatewayError::PayloadTooLarge { .. } => "PayloadTooLarge",
            GatewayError::UnsupportedMediaType { .. } => "UnsupportedMediaType",
            GatewayError::TooManyRequests { .. } => "TooManyRequests",
            GatewayError::CircuitOpen { .. } => "CircuitOpen",
            GatewayError::NoHealthyInstance { .. } => "NoHealthyInstance",
            GatewayError::ShuttingDown => "ShuttingDown",
            GatewayError::BadGateway => "BadGateway",
            GatewayError::GatewayTimeout => "GatewayTimeout",
            GatewayError::Internal { .. } => "Internal",
        }
    }
}

impl From<MeshError> for GatewayError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::UnknownService(name) => GatewayError::NotFound {
                message: format!("unknown service: {name}"),
            },
            MeshError::NoHealthyInstance(service) => GatewayError::NoHealthyInstance { service },
            MeshError::CircuitOpen {
                service,
                retry_after,
            } => GatewayError::CircuitOpen {
                service,
                retry_after_secs: retry_after.as_secs().max(1),
            },
            other => GatewayError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// A gateway error bound to the request it failed, so the body's
/// `requestId` always matches the `X-Request-ID` response header.
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: GatewayError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal { message } = &self.error {
            tracing::error!(request_id = %self.request_id, error = %message, "internal error");
        }

        let status = self.error.status();
        let body = Json(json!({
            "error": self.error.to_string(),
            "code": self.error.code(),
            "requestId": self.request_id,
        }));

        let mut response = (status, body).into_response();
        match &self.error {
            GatewayError::TooManyRequests { decision } => {
                let headers = response.headers_mut();
                headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
                headers.insert(
                    "x-ratelimit-remaining",
                    HeaderValue::from(decision.remaining),
                );
                headers.insert(
                    "x-ratelimit-reset",
                    HeaderValue::from(decision.reset_ms / 1000),
                );
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(decision.retry_after_secs.unwrap_or(1)),
                );
            }
            GatewayError::CircuitOpen {
                retry_after_secs, ..
            } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            _ => {}
        }
        response
    }
}
