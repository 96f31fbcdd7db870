//! # Policy Pipeline Middleware
//!
//! The ordered request filters, implemented as axum middleware:
//!
//! 1. **Context** (outermost): assigns the request id, stamps the gateway
//!    headers on every response, rejects new work during shutdown and
//!    records metrics after the handler ran.
//! 2. **Auth**: optional mTLS header check, then bearer/API-key
//!    authentication. Bypass paths and CORS preflights skip straight
//!    through.
//! 3. **Authz**: role and permission checks against the target service.
//! 4. **Schema validation**: buffers the body and checks it against the
//!    service schema before any rate-limit token is spent.
//! 5. **Rate limit**: bucket lookup keyed by the configured strategy,
//!    emitting `X-RateLimit-*` headers on both outcomes.
//!
//! Every stage logs an accept/reject audit event carrying the request id,
//! and rejections short-circuit the pipeline so the proxy is never invoked.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower_http::cors::{Any, CorsLayer};

use crate::config::CorsConfig;
use crate::gateway_error::{ApiError, GatewayError};
use crate::request_context::{Principal, ProxyTarget, RequestContext, ServiceTag};
use crate::server::AppState;

/// Outermost middleware: request id, shutdown gate, response headers,
/// request logging and metrics.
pub async fn context_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::new();
    let request_id = ctx.request_id.clone();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ctx.clone());

    let mut response = if state.orchestrator.is_shutting_down() {
        ApiError::new(GatewayError::ShuttingDown, request_id.clone()).into_response()
    } else {
        let _in_flight = state.orchestrator.inflight_guard();
        next.run(req).await
    };

    let latency_ms = ctx.elapsed().as_millis() as u64;
    let status = response.status();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.config.server.name) {
        headers.insert("x-gateway-name", value);
    }
    headers.insert(
        "x-gateway-version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );

    // Admin endpoints are exempt from metrics so probes do not skew rates.
    if !state.config.is_bypass_path(&path) {
        let service = response
            .extensions()
            .get::<ServiceTag>()
            .map(|tag| tag.0.clone());
        state
            .metrics()
            .record(service.as_deref(), status.as_u16(), latency_ms);
    }

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = status.as_u16(),
        latency_ms,
        "request processed"
    );
    response
}

/// mTLS header check and credential verification.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS || state.config.is_bypass_path(req.uri().path()) {
        return next.run(req).await;
    }
    let request_id = request_id_of(&req);

    let mtls = &state.config.policies.mtls;
    if mtls.enabled {
        let presented = req
            .headers()
            .get(mtls.header.as_str())
            .and_then(|v| v.to_str().ok());
        if presented != Some(mtls.expected.as_str()) {
            tracing::warn!(request_id = %request_id, "filter mtls: reject");
            return ApiError::new(
                GatewayError::Unauthenticated {
                    message: "client certificate required".to_string(),
                },
                request_id,
            )
            .into_response();
        }
    }

    if !state.auth.is_enabled() {
        return next.run(req).await;
    }

    match state.auth.authenticate(req.headers()) {
        Ok(principal) => {
            tracing::debug!(
                request_id = %request_id,
                principal = %principal.id,
                role = %principal.role,
                "filter auth: accept"
            );
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, "filter auth: reject");
            ApiError::new(err, request_id).into_response()
        }
    }
}

/// Role and permission checks for proxied requests.
pub async fn authz_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS || state.config.is_bypass_path(req.uri().path()) {
        return next.run(req).await;
    }
    // Non-proxy paths fall through to the router's 404.
    let Some(target) = ProxyTarget::parse(req.uri().path()) else {
        return next.run(req).await;
    };
    // Without authentication there is no principal to authorize.
    if !state.auth.is_enabled() {
        return next.run(req).await;
    }

    let request_id = request_id_of(&req);
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return ApiError::new(
            GatewayError::Unauthenticated {
                message: "missing credentials".to_string(),
            },
            request_id,
        )
        .into_response();
    };

    // Unregistered services fall through to the proxy's NotFound rather
    // than leaking a 403 for something that does not exist.
    let Some(spec) = state.registry().spec(&target.service) else {
        return next.run(req).await;
    };
    if !spec.required_roles.is_empty() && !spec.required_roles.contains(&principal.role) {
        tracing::warn!(
            request_id = %request_id,
            role = %principal.role,
            service = %target.service,
            "filter authz: reject (role not permitted)"
        );
        return ApiError::new(
            GatewayError::Forbidden {
                message: format!("role {} may not access {}", principal.role, target.service),
            },
            request_id,
        )
        .into_response();
    }

    let permission = crate::authz::AuthzPolicy::required_permission(&target.service, req.method());
    if !state.authz.is_allowed(&principal.role, &permission) {
        tracing::warn!(
            request_id = %request_id,
            role = %principal.role,
            permission = %permission,
            "filter authz: reject (missing permission)"
        );
        return ApiError::new(
            GatewayError::Forbidden {
                message: format!("missing permission {permission}"),
            },
            request_id,
        )
        .into_response();
    }

    tracing::debug!(request_id = %request_id, permission = %permission, "filter authz: accept");
    next.run(req).await
}

/// Body-shape validation for services that declare a schema. The body is
/// buffered here and handed onward so the proxy does not read it twice.
pub async fn schema_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS
        || req.method() == Method::GET
        || req.method() == Method::HEAD
        || state.config.is_bypass_path(req.uri().path())
    {
        return next.run(req).await;
    }
    let Some(target) = ProxyTarget::parse(req.uri().path()) else {
        return next.run(req).await;
    };
    let Some(schema) = state.schemas.get(&target.service) else {
        return next.run(req).await;
    };
    let request_id = request_id_of(&req);

    let (parts, body) = req.into_parts();
    let limit = state.config.server.max_body_size;
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::new(GatewayError::PayloadTooLarge { limit }, request_id)
                .into_response()
        }
    };

    let content_type = parts
        .headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        tracing::warn!(request_id = %request_id, service = %target.service, "filter schema: reject (media type)");
        return ApiError::new(
            GatewayError::UnsupportedMediaType {
                message: format!("{} requires application/json", target.service),
            },
            request_id,
        )
        .into_response();
    }

    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(request_id = %request_id, service = %target.service, "filter schema: reject (invalid json)");
            return ApiError::new(
                GatewayError::BadRequest {
                    message: "request body is not valid JSON".to_string(),
                },
                request_id,
            )
            .into_response();
        }
    };
    let errors = schema.validate(&value);
    if !errors.is_empty() {
        tracing::warn!(
            request_id = %request_id,
            service = %target.service,
            errors = ?errors,
            "filter schema: reject"
        );
        return ApiError::new(
            GatewayError::BadRequest {
                message: format!("schema validation failed: {}", errors.join("; ")),
            },
            request_id,
        )
        .into_response();
    }

    tracing::debug!(request_id = %request_id, service = %target.service, "filter schema: accept");
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Per-principal admission control with `X-RateLimit-*` headers.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS || state.config.is_bypass_path(req.uri().path()) {
        return next.run(req).await;
    }
    let request_id = request_id_of(&req);

    let target = ProxyTarget::parse(req.uri().path());
    let service = target.as_ref().map(|t| t.service.as_str());
    let scope = service.unwrap_or("gateway").to_string();
    let config = state.config.rate_limit_for(service).clone();

    let ip = client_ip(req.headers());
    let user = req.extensions().get::<Principal>().map(|p| p.id.clone());
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let key = config
        .key_strategy
        .bucket_key(&ip, user.as_deref(), user_agent.as_deref());

    let decision = state.limiter().check(&scope, &key, &config);
    if !decision.allowed {
        tracing::warn!(
            request_id = %request_id,
            scope = %scope,
            retry_after = decision.retry_after_secs,
            "filter rate_limit: reject"
        );
        return ApiError::new(GatewayError::TooManyRequests { decision }, request_id)
            .into_response();
    }

    tracing::debug!(request_id = %request_id, scope = %scope, remaining = decision.remaining, "filter rate_limit: accept");
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_ms / 1000),
    );
    response
}

/// CORS layer from configuration; disabled means no CORS headers at all.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if !config.enabled {
        return CorsLayer::new();
    }
    if config.allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn request_id_of(req: &Request) -> String {
    req.extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Client address for rate-limit keys: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then a placeholder.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}
