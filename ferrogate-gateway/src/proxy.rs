//! # Reverse Proxy
//!
//! The forwarding path: resolve the `/{version}/{service}/...` target, ask
//! the circuit breaker for admission, pick a healthy instance, rewrite the
//! path and forward. Body validation already happened in the pipeline; the
//! proxy only enforces the size cap while reading.
//!
//! Upstream failures map onto the gateway taxonomy: transport and DNS
//! errors become 502, a blown deadline becomes 504, and an explicit
//! upstream 5xx passes through while still counting as a failure for the
//! circuit breaker. The proxy itself never retries.
//!
//! Breaker accounting is armed only after the dial begins, so a client that
//! disconnects mid-call records a failure exactly when the upstream was
//! already dialed, and never for requests rejected earlier in the pipeline.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use ferrogate_mesh::breaker::CircuitBreaker;
use std::sync::Arc;
use std::time::Instant;

use crate::gateway_error::{ApiError, GatewayError};
use crate::request_context::{ProxyTarget, RequestContext, ServiceTag};
use crate::server::AppState;
use crate::validation::scan_advisory_patterns;

/// Longest body prefix fed to the advisory pattern scan.
const SCAN_LIMIT: usize = 16 * 1024;

// Connection-scoped headers must not cross the proxy boundary; the host
// header is rewritten by the upstream client.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Handler behind `/{version}/{service}/{*rest}`.
pub async fn proxy_request(State(state): State<AppState>, req: Request) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    let request_id = ctx.request_id.clone();

    match forward(&state, &ctx, req).await {
        Ok(response) => response,
        Err(error) => ApiError::new(error, request_id).into_response(),
    }
}

async fn forward(
    state: &AppState,
    ctx: &RequestContext,
    req: Request,
) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();

    let target = ProxyTarget::parse(parts.uri.path()).ok_or_else(|| GatewayError::NotFound {
        message: format!("unknown route: {}", parts.uri.path()),
    })?;
    let spec = state
        .registry()
        .spec(&target.service)
        .ok_or_else(|| GatewayError::NotFound {
            message: format!("unknown service: {}", target.service),
        })?;
    if spec.version != target.version {
        return Err(GatewayError::NotFound {
            message: format!("unknown route: /{}/{}", target.version, target.service),
        });
    }

    // Body limits are enforced while reading; anything larger never leaves
    // the gateway.
    let limit = state.config.server.max_body_size;
    let body_bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge { limit })?;

    if !body_bytes.is_empty() {
        let preview = String::from_utf8_lossy(&body_bytes[..body_bytes.len().min(SCAN_LIMIT)]);
        scan_advisory_patterns(&ctx.request_id, &preview);
    }

    let breaker = state
        .breakers()
        .register(&target.service, spec.breaker.clone());
    breaker.try_admit()?;

    let healthy = state.registry().healthy_instances(&target.service)?;
    let instance = state
        .balancer()
        .select(&target.service, spec.load_balancing, &healthy)?;
    let _connection = instance.connection_guard();

    // Strip the /{version}/{service} prefix, keep the query intact.
    let mut url = format!("http://{}{}", instance.addr(), target.rest);
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let mut upstream_headers = filter_headers(&parts.headers);
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        upstream_headers.insert("x-gateway-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&target.service) {
        upstream_headers.insert("x-service-name", value);
    }
    if let Ok(value) = HeaderValue::from_str(&spec.version) {
        upstream_headers.insert("x-api-version", value);
    }

    // The per-request deadline wins over the upstream default if shorter.
    let remaining = state
        .config
        .timeouts
        .request
        .saturating_sub(ctx.elapsed());
    if remaining.is_zero() {
        return Err(GatewayError::GatewayTimeout);
    }
    let timeout = state.config.timeouts.upstream.min(remaining);

    tracing::debug!(
        request_id = %ctx.request_id,
        service = %target.service,
        instance = %instance.id,
        "forwarding request upstream"
    );

    // From here on the upstream is being dialed: if the caller goes away
    // the drop handler records the failure.
    let outcome = OutcomeGuard::arm(Arc::clone(&breaker));
    let started = Instant::now();
    let result = state
        .http
        .request(parts.method.clone(), url.as_str())
        .headers(upstream_headers)
        .body(body_bytes)
        .timeout(timeout)
        .send()
        .await;

    let upstream = match result {
        Ok(upstream) => upstream,
        Err(err) if err.is_timeout() => {
            outcome.failure();
            tracing::warn!(request_id = %ctx.request_id, service = %target.service, "upstream timed out");
            return Err(GatewayError::GatewayTimeout);
        }
        Err(err) => {
            outcome.failure();
            tracing::warn!(
                request_id = %ctx.request_id,
                service = %target.service,
                error = %err,
                "upstream dial failed"
            );
            return Err(GatewayError::BadGateway);
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let upstream_headers = upstream.headers().clone();
    let response_bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(_) => {
            outcome.failure();
            return Err(GatewayError::BadGateway);
        }
    };

    // Success for the breaker means the upstream answered below 500.
    if status.is_server_error() {
        outcome.failure();
    } else {
        outcome.success();
    }
    tracing::debug!(
        request_id = %ctx.request_id,
        service = %target.service,
        status = status.as_u16(),
        upstream_latency_ms = started.elapsed().as_millis() as u64,
        "upstream responded"
    );

    let mut response = Response::new(Body::from(response_bytes));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in filter_headers(&upstream_headers) {
        if let Some(name) = name {
            headers.insert(name, value);
        }
    }
    if !headers.contains_key("x-service-name") {
        if let Ok(value) = HeaderValue::from_str(&target.service) {
            headers.insert("x-service-name", value);
        }
    }
    if !headers.contains_key("x-api-version") {
        if let Ok(value) = HeaderValue::from_str(&spec.version) {
            headers.insert("x-api-version", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&state.config.server.name) {
        headers.insert("x-proxied-by", value);
    }

    response
        .extensions_mut()
        .insert(ServiceTag(target.service.clone()));
    Ok(response)
}

/// Copy of `headers` without hop-by-hop and host headers.
fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Records exactly one breaker outcome. If the request future is dropped
/// after the dial began (client disconnect), the drop path counts it as a
/// failure.
struct OutcomeGuard {
    breaker: Arc<CircuitBreaker>,
    recorded: bool,
}

impl OutcomeGuard {
    fn arm(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            recorded: false,
        }
    }

    fn success(mut self) {
        self.breaker.record_success();
        self.recorded = true;
    }

    fn failure(mut self) {
        self.breaker.record_failure();
        self.recorded = true;
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record_failure();
        }
    }
}
