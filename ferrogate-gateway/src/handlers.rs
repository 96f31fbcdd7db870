//! # Admin Handlers
//!
//! The gateway's own HTTP surface: `/health`, `/metrics` and `/services`.
//! These paths sit in the default bypass set, so they answer without
//! credentials and do not feed the request metrics.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ferrogate_mesh::registry::{HealthState, Instance};
use serde_json::{json, Value};

use crate::gateway_error::{ApiError, GatewayError};
use crate::request_context::RequestContext;
use crate::server::AppState;

/// `GET /health`: 200 while error rate and latency sit below the configured
/// thresholds, 503 once degraded. Either way the body carries the same
/// shape.
pub async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.metrics().snapshot();
    let healthy = snapshot.is_healthy(&state.config.health);

    let registry = state.registry();
    let services: Vec<Value> = registry
        .service_names()
        .into_iter()
        .map(|name| {
            let instances = registry.list_instances(&name).unwrap_or_default();
            json!({
                "name": name,
                "health": service_health(&instances),
            })
        })
        .collect();

    let subsystems: Value = state
        .orchestrator
        .subsystem_reports()
        .into_iter()
        .map(|(name, report)| (name.to_string(), json!(report)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": snapshot.uptime_seconds,
        "services": services,
        "metrics": {
            "requests": snapshot.total_requests,
            "errors": snapshot.total_errors,
            "errorRate": snapshot.error_rate,
            "avgLatency": snapshot.avg_latency_ms,
        },
        "subsystems": subsystems,
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// `GET /metrics`: structured counters and derived values, per service and
/// gateway wide, plus the circuit-breaker states.
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.metrics().snapshot();
    let registry = state.registry();
    let breakers = state.breakers();

    let mut services = serde_json::Map::new();
    for name in registry.service_names() {
        let instances = registry.list_instances(&name).unwrap_or_default();
        let healthy = instances
            .iter()
            .filter(|i| i.health == HealthState::Healthy)
            .count();
        let mut entry = match snapshot.services.get(&name) {
            Some(stats) => json!(stats),
            None => json!({
                "requests": 0,
                "errors": 0,
                "error_rate": 0.0,
                "avg_latency_ms": 0.0,
                "p95_latency_ms": 0,
                "p99_latency_ms": 0,
                "last_request": null,
            }),
        };
        if let Some(object) = entry.as_object_mut() {
            object.insert("instances".to_string(), json!(instances.len()));
            object.insert("healthy_instances".to_string(), json!(healthy));
            object.insert(
                "circuit_state".to_string(),
                json!(breakers.get(&name).map(|b| b.state())),
            );
        }
        services.insert(name, entry);
    }

    Json(json!({
        "gateway": {
            "total_requests": snapshot.total_requests,
            "total_errors": snapshot.total_errors,
            "error_rate": snapshot.error_rate,
            "avg_latency_ms": snapshot.avg_latency_ms,
            "p95_latency_ms": snapshot.p95_latency_ms,
            "p99_latency_ms": snapshot.p99_latency_ms,
            "uptime_seconds": snapshot.uptime_seconds,
        },
        "services": Value::Object(services),
        "circuit_breakers": breakers.snapshots(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /services`: the registered service list with endpoints and
/// per-instance health.
pub async fn services(State(state): State<AppState>) -> Json<Value> {
    let registry = state.registry();
    let services: Vec<Value> = registry
        .service_names()
        .into_iter()
        .filter_map(|name| {
            let spec = registry.spec(&name)?;
            let instances = registry.list_instances(&name).unwrap_or_default();
            let listed: Vec<Value> = instances
                .iter()
                .map(|instance| {
                    json!({
                        "id": instance.id,
                        "address": instance.addr(),
                        "weight": instance.weight,
                        "health": instance.health,
                        "lastProbe": instance.last_probe.map(|t| t.to_rfc3339()),
                        "activeConnections": instance.active_connections(),
                    })
                })
                .collect();
            Some(json!({
                "name": spec.name,
                "version": spec.version,
                "endpoint": format!("/{}/{}", spec.version, spec.name),
                "health": service_health(&instances),
                "loadBalancing": spec.load_balancing,
                "instances": listed,
            }))
        })
        .collect();

    Json(json!({ "services": services }))
}

/// Router fallback: anything that is neither an admin path nor a proxy
/// route gets the standard error body.
pub async fn not_found(req: Request) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_else(|| "unknown".to_string());
    ApiError::new(
        GatewayError::NotFound {
            message: format!("unknown route: {}", req.uri().path()),
        },
        request_id,
    )
    .into_response()
}

fn service_health(instances: &[Instance]) -> &'static str {
    if instances.iter().any(|i| i.health == HealthState::Healthy) {
        "healthy"
    } else if instances.iter().all(|i| i.health == HealthState::Unknown) {
        "unknown"
    } else {
        "unhealthy"
    }
}
