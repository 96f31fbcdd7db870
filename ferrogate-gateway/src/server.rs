//! # Server Wiring
//!
//! Builds the application state and the axum router with the ordered
//! middleware stack. `build_gateway` is the single composition root used by
//! both `main` and the integration tests; it constructs the orchestrator,
//! starts it, and returns the ready-to-serve router alongside the
//! orchestrator handle for lifecycle control.

use axum::routing::{any, get};
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use crate::auth::AuthService;
use crate::authz::AuthzPolicy;
use crate::config::GatewayConfig;
use crate::handlers;
use crate::metrics::MetricsRegistry;
use crate::middleware::{
    auth_middleware, authz_middleware, context_middleware, cors_layer, rate_limit_middleware,
    schema_middleware,
};
use crate::orchestrator::Orchestrator;
use crate::proxy::proxy_request;
use crate::validation::BodySchema;
use ferrogate_mesh::breaker::BreakerRegistry;
use ferrogate_mesh::ratelimit::RateLimiter;
use ferrogate_mesh::registry::ServiceRegistry;
use ferrogate_mesh::LoadBalancer;

/// Shared state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<AuthService>,
    pub authz: Arc<AuthzPolicy>,
    /// Pre-parsed per-service body schemas.
    pub schemas: Arc<HashMap<String, BodySchema>>,
    /// Upstream HTTP client shared across requests.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.orchestrator.registry()
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        self.orchestrator.breakers()
    }

    pub fn balancer(&self) -> Arc<LoadBalancer> {
        self.orchestrator.balancer()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.orchestrator.limiter()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.orchestrator.metrics()
    }
}

/// Compose the gateway: validate configuration, build and start the
/// orchestrator, and wire the router with the policy pipeline.
pub async fn build_gateway(
    config: GatewayConfig,
) -> anyhow::Result<(Router, Arc<Orchestrator>)> {
    config.validate()?;
    let config = Arc::new(config);

    let auth = Arc::new(AuthService::from_config(&config.policies.auth)?);
    auth.sanity_check()?;
    let authz = Arc::new(AuthzPolicy::from_config(&config.policies.authz));

    let schemas: HashMap<String, BodySchema> = config
        .services
        .iter()
        .filter_map(|service| {
            service
                .auth
                .schema
                .clone()
                .map(|schema| (service.name.clone(), schema))
        })
        .collect();

    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&config))?);
    orchestrator.start()?;

    let http = reqwest::Client::builder()
        .timeout(config.timeouts.upstream)
        .connect_timeout(config.timeouts.upstream)
        .build()?;

    let state = AppState {
        config: Arc::clone(&config),
        orchestrator: Arc::clone(&orchestrator),
        auth,
        authz,
        schemas: Arc::new(schemas),
        http,
    };

    let app = Router::new()
        // Admin surface
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/services", get(handlers::services))
        // Proxied surface
        .route("/{version}/{service}", any(proxy_request))
        .route("/{version}/{service}/{*rest}", any(proxy_request))
        .fallback(handlers::not_found)
        // Pipeline order: context first (outermost), then CORS, auth,
        // authz, schema validation, rate limiting, and the overall request
        // timeout innermost.
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    context_middleware,
                ))
                .layer(cors_layer(&config.server.cors))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    auth_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    authz_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    schema_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit_middleware,
                ))
                .layer(TimeoutLayer::new(config.timeouts.request)),
        )
        .with_state(state);

    Ok((app, orchestrator))
}
