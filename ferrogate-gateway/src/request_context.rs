//! Per-request context: the opaque request id, arrival instant and, once
//! the pipeline has run, the authenticated principal and resolved target.
//! The context is created by the outermost middleware and travels through
//! request extensions.

use std::time::Instant;
use uuid::Uuid;

/// How a principal proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    ApiKey,
    Bearer,
}

/// Authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub role: String,
    pub auth_kind: AuthKind,
}

/// Context for one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Opaque id echoed in `X-Request-ID` and every error body.
    pub request_id: String,
    /// Monotonic arrival timestamp for latency measurement.
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            received_at: Instant::now(),
        }
    }

    /// Elapsed time since the request arrived.
    pub fn elapsed(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed `/{version}/{service}/...` routing target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub version: String,
    pub service: String,
    /// Remainder of the path forwarded upstream, always starting with `/`.
    pub rest: String,
}

impl ProxyTarget {
    /// Parse a request path into a proxy target. Paths with fewer than two
    /// segments are not proxyable.
    pub fn parse(path: &str) -> Option<Self> {
        let mut segments = path.trim_start_matches('/').splitn(3, '/');
        let version = segments.next().filter(|s| !s.is_empty())?;
        let service = segments.next().filter(|s| !s.is_empty())?;
        let rest = match segments.next() {
            Some(rest) => format!("/{rest}"),
            None => "/".to_string(),
        };
        Some(Self {
            version: version.to_string(),
            service: service.to_string(),
            rest,
        })
    }
}

/// Response-extension marker naming the service a response was proxied to;
/// the metrics middleware keys per-service counters off it.
#[derive(Debug, Clone)]
pub struct ServiceTag(pub String);
