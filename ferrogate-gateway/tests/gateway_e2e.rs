//! End-to-end gateway tests: a real router built by `build_gateway`,
//! driven in-process with axum-test, against wiremock upstream doubles.

use axum_test::TestServer;
use ferrogate_gateway::auth::AuthService;
use ferrogate_gateway::config::{
    ApiKeyConfig, GatewayConfig, InstanceConfig, ServiceAuthConfig, ServiceConfig,
};
use ferrogate_gateway::orchestrator::Orchestrator;
use ferrogate_gateway::validation::{BodySchema, FieldKind};
use ferrogate_gateway::build_gateway;
use ferrogate_mesh::balancer::LoadBalancePolicy;
use ferrogate_mesh::breaker::CircuitBreakerConfig;
use ferrogate_mesh::ratelimit::{KeyStrategy, RateLimitAlgorithm, RateLimitConfig};
use ferrogate_mesh::registry::HealthState;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SALT: &str = "pepper";
const SIGNER_KEY: &str = "dev-key-123";
const COLLECTOR_KEY: &str = "collector-key-1";
const POWERLESS_KEY: &str = "powerless-key-9";

fn base_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.policies.auth.enabled = true;
    config.policies.auth.api_key_salt = SALT.to_string();
    config.policies.auth.api_keys = vec![
        ApiKeyConfig {
            name: "dev".to_string(),
            role: "sign-writer".to_string(),
            key_sha256: AuthService::hash_api_key(SALT, SIGNER_KEY),
        },
        ApiKeyConfig {
            name: "collector".to_string(),
            role: "collector-writer".to_string(),
            key_sha256: AuthService::hash_api_key(SALT, COLLECTOR_KEY),
        },
        ApiKeyConfig {
            name: "powerless".to_string(),
            role: "none".to_string(),
            key_sha256: AuthService::hash_api_key(SALT, POWERLESS_KEY),
        },
    ];
    config.policies.authz.role_permissions.insert(
        "sign-writer".to_string(),
        vec!["signer:*".to_string()],
    );
    config.policies.authz.role_permissions.insert(
        "collector-writer".to_string(),
        vec!["collector:*".to_string()],
    );
    // Generous default so only tests that opt in exercise 429s.
    config.policies.rate_limit = RateLimitConfig {
        algorithm: RateLimitAlgorithm::SlidingWindow,
        window: Duration::from_secs(60),
        max: 100_000,
        key_strategy: KeyStrategy::Ip,
    };
    config.timeouts.shutdown_grace = Duration::from_secs(1);
    config
}

fn service_at(name: &str, addr: &SocketAddr) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        version: "v1".to_string(),
        health_path: "/health".to_string(),
        load_balancing: LoadBalancePolicy::RoundRobin,
        instances: vec![InstanceConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            weight: 1,
            health_path: None,
        }],
        circuit: CircuitBreakerConfig::default(),
        rate_limit: None,
        auth: ServiceAuthConfig::default(),
    }
}

async fn healthy_upstream() -> MockServer {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;
    upstream
}

async fn launch(config: GatewayConfig) -> (TestServer, Arc<Orchestrator>) {
    let (app, orchestrator) = build_gateway(config).await.unwrap();
    orchestrator.probe_once().await;
    (TestServer::new(app).unwrap(), orchestrator)
}

fn bearer(key: &str) -> String {
    format!("Bearer {key}")
}

#[tokio::test]
async fn proxies_to_healthy_instance_with_injected_headers() {
    let upstream = healthy_upstream().await;
    Mock::given(method("GET"))
        .and(path("/pubkey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pubkey": "ed25519:abc"})))
        .mount(&upstream)
        .await;

    let mut config = base_config();
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["pubkey"], "ed25519:abc");

    let headers = response.headers();
    assert!(!headers.get("x-request-id").unwrap().is_empty());
    assert_eq!(headers.get("x-gateway-name").unwrap(), "ferrogate");
    assert!(headers.contains_key("x-gateway-version"));
    assert_eq!(headers.get("x-service-name").unwrap(), "signer");
    assert_eq!(headers.get("x-api-version").unwrap(), "v1");
    assert_eq!(headers.get("x-proxied-by").unwrap(), "ferrogate");

    // The upstream saw the gateway's injected headers and the stripped path.
    let seen = upstream.received_requests().await.unwrap();
    let proxied = seen.iter().find(|r| r.url.path() == "/pubkey").unwrap();
    assert!(proxied.headers.contains_key("x-gateway-request-id"));
    assert_eq!(proxied.headers.get("x-service-name").unwrap(), "signer");

    // Metrics counted the call and the breaker stayed closed.
    let metrics: Value = server.get("/metrics").await.json();
    assert_eq!(metrics["services"]["signer"]["requests"], 1);
    assert_eq!(metrics["services"]["signer"]["errors"], 0);
    assert_eq!(metrics["services"]["signer"]["circuit_state"], "closed");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn rejects_missing_and_invalid_credentials() {
    let upstream = healthy_upstream().await;
    let mut config = base_config();
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let response = server.get("/v1/signer/pubkey").await;
    assert_eq!(response.status_code(), 401);
    let body: Value = response.json();
    assert_eq!(body["code"], "Unauthenticated");
    assert!(body["requestId"].as_str().unwrap().len() > 10);

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("x-api-key", "totally-wrong-key")
        .await;
    assert_eq!(response.status_code(), 401);

    // Nothing ever reached the upstream besides health probes.
    let seen = upstream.received_requests().await.unwrap();
    assert!(seen.iter().all(|r| r.url.path() == "/health"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn authorization_rejects_roles_without_permission() {
    let upstream = healthy_upstream().await;
    let mut config = base_config();
    config
        .services
        .push(service_at("collector", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let response = server
        .post("/v1/collector/ingest")
        .add_header("authorization", bearer(POWERLESS_KEY))
        .json(&json!({
            "event": {"event_name": "x", "occurred_at": "2024-01-01T00:00:00Z"}
        }))
        .await;

    assert_eq!(response.status_code(), 403);
    let body: Value = response.json();
    assert_eq!(body["code"], "Forbidden");
    assert!(body["requestId"].is_string());
    // The response header and the body carry the same request id.
    assert_eq!(
        response.headers().get("x-request-id").unwrap().to_str().unwrap(),
        body["requestId"].as_str().unwrap()
    );

    let seen = upstream.received_requests().await.unwrap();
    assert!(seen.iter().all(|r| r.url.path() == "/health"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn schema_validation_rejects_malformed_bodies() {
    let upstream = healthy_upstream().await;
    let mut config = base_config();
    let mut collector = service_at("collector", upstream.address());
    collector.auth.schema = Some(BodySchema {
        required: BTreeMap::from([("event".to_string(), FieldKind::Object)]),
        additional_properties: false,
    });
    config.services.push(collector);
    let (server, orchestrator) = launch(config).await;

    let response = server
        .post("/v1/collector/ingest")
        .add_header("authorization", bearer(COLLECTOR_KEY))
        .json(&json!({"bad": "payload"}))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["code"], "BadRequest");

    // Non-JSON content where a schema applies is a media-type error.
    let response = server
        .post("/v1/collector/ingest")
        .add_header("authorization", bearer(COLLECTOR_KEY))
        .content_type("text/plain")
        .bytes("not json".into())
        .await;
    assert_eq!(response.status_code(), 415);

    let seen = upstream.received_requests().await.unwrap();
    assert!(seen.iter().all(|r| r.url.path() == "/health"));

    // A conforming body goes through.
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&upstream)
        .await;
    let response = server
        .post("/v1/collector/ingest")
        .add_header("authorization", bearer(COLLECTOR_KEY))
        .json(&json!({"event": {"event_name": "x"}}))
        .await;
    assert_eq!(response.status_code(), 202);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_recovers() {
    let upstream = healthy_upstream().await;
    Mock::given(method("GET"))
        .and(path("/work"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let mut config = base_config();
    let mut signer = service_at("signer", upstream.address());
    signer.circuit = CircuitBreakerConfig {
        failure_threshold: 5,
        open_timeout: Duration::from_millis(300),
        half_open_successes: 3,
    };
    config.services.push(signer);
    let (server, orchestrator) = launch(config).await;

    // Five upstream 500s pass through and trip the breaker.
    for _ in 0..5 {
        let response = server
            .get("/v1/signer/work")
            .add_header("authorization", bearer(SIGNER_KEY))
            .await;
        assert_eq!(response.status_code(), 500);
    }

    // The sixth call is rejected before the upstream is dialed.
    let response = server
        .get("/v1/signer/work")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["code"], "CircuitOpen");
    assert!(response.headers().contains_key("retry-after"));

    let dialed = upstream
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/work")
        .count();
    assert_eq!(dialed, 5);

    // Heal the upstream, wait out the open timeout, and close the circuit
    // with three successful trial calls.
    upstream.reset().await;
    Mock::given(method("GET"))
        .and(path("/work"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    for _ in 0..3 {
        let response = server
            .get("/v1/signer/work")
            .add_header("authorization", bearer(SIGNER_KEY))
            .await;
        assert_eq!(response.status_code(), 200);
    }
    let metrics: Value = server.get("/metrics").await.json();
    assert_eq!(metrics["services"]["signer"]["circuit_state"], "closed");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn sliding_window_rate_limit_returns_429_with_headers() {
    let upstream = healthy_upstream().await;
    Mock::given(method("GET"))
        .and(path("/pubkey"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut config = base_config();
    let mut signer = service_at("signer", upstream.address());
    signer.rate_limit = Some(RateLimitConfig {
        algorithm: RateLimitAlgorithm::SlidingWindow,
        window: Duration::from_secs(60),
        max: 10,
        key_strategy: KeyStrategy::Ip,
    });
    config.services.push(signer);
    let (server, orchestrator) = launch(config).await;

    for i in 0..10 {
        let response = server
            .get("/v1/signer/pubkey")
            .add_header("authorization", bearer(SIGNER_KEY))
            .add_header("x-forwarded-for", "1.2.3.4")
            .await;
        assert_eq!(response.status_code(), 200, "request {i} should pass");
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .add_header("x-forwarded-for", "1.2.3.4")
        .await;
    assert_eq!(response.status_code(), 429);
    let headers = response.headers();
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
    let retry_after: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body: Value = response.json();
    assert_eq!(body["code"], "TooManyRequests");

    // Buckets are independent per key: another ip is still admitted.
    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .add_header("x-forwarded-for", "5.6.7.8")
        .await;
    assert_eq!(response.status_code(), 200);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn weighted_balancing_splits_traffic_by_weight() {
    let heavy = healthy_upstream().await;
    let light = healthy_upstream().await;
    for upstream in [&heavy, &light] {
        Mock::given(method("GET"))
            .and(path("/pubkey"))
            .respond_with(ResponseTemplate::new(200))
            .mount(upstream)
            .await;
    }

    let mut config = base_config();
    let mut signer = service_at("signer", heavy.address());
    signer.load_balancing = LoadBalancePolicy::Weighted;
    signer.instances[0].weight = 3;
    signer.instances.push(InstanceConfig {
        host: light.address().ip().to_string(),
        port: light.address().port(),
        weight: 1,
        health_path: None,
    });
    config.services.push(signer);
    let (server, orchestrator) = launch(config).await;

    let total = 400usize;
    for _ in 0..total {
        let response = server
            .get("/v1/signer/pubkey")
            .add_header("authorization", bearer(SIGNER_KEY))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    let heavy_hits = heavy
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/pubkey")
        .count();
    let light_hits = light
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/pubkey")
        .count();

    assert_eq!(heavy_hits + light_hits, total);
    // Expectation 300/100; +/-50 is far outside 3 sigma of the binomial.
    assert!((250..=350).contains(&heavy_hits), "heavy got {heavy_hits}");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn discovery_fails_closed_without_healthy_instances() {
    let mut config = base_config();
    // Nothing listens here, so the probe marks the instance unhealthy.
    config.services.push(service_at(
        "signer",
        &"127.0.0.1:1".parse::<SocketAddr>().unwrap(),
    ));
    let (server, orchestrator) = launch(config).await;

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["code"], "NoHealthyInstance");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn upstream_transport_failure_maps_to_502() {
    let mut config = base_config();
    // Nothing listens on this address; mark it healthy by hand so the
    // request reaches the dial and fails at the transport.
    config.services.push(service_at(
        "signer",
        &"127.0.0.1:9".parse::<SocketAddr>().unwrap(),
    ));
    let (server, orchestrator) = launch(config).await;
    orchestrator
        .registry()
        .set_health("signer", "127.0.0.1:9", HealthState::Healthy)
        .unwrap();

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;
    assert_eq!(response.status_code(), 502);
    let body: Value = response.json();
    assert_eq!(body["code"], "BadGateway");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn slow_upstream_maps_to_504() {
    let upstream = healthy_upstream().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&upstream)
        .await;

    let mut config = base_config();
    config.timeouts.upstream = Duration::from_millis(100);
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let response = server
        .get("/v1/signer/slow")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;
    assert_eq!(response.status_code(), 504);
    let body: Value = response.json();
    assert_eq!(body["code"], "GatewayTimeout");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn oversized_bodies_are_rejected_before_forwarding() {
    let upstream = healthy_upstream().await;
    let mut config = base_config();
    config.server.max_body_size = 1024;
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let response = server
        .post("/v1/signer/sign")
        .add_header("authorization", bearer(SIGNER_KEY))
        .content_type("application/octet-stream")
        .bytes(vec![0u8; 4096].into())
        .await;
    assert_eq!(response.status_code(), 413);
    let body: Value = response.json();
    assert_eq!(body["code"], "PayloadTooLarge");

    let seen = upstream.received_requests().await.unwrap();
    assert!(seen.iter().all(|r| r.url.path() == "/health"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn admin_endpoints_bypass_authentication() {
    let upstream = healthy_upstream().await;
    let mut config = base_config();
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
    assert!(body["metrics"]["errorRate"].is_number());

    let response = server.get("/services").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    let services = body["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["name"], "signer");
    assert_eq!(services[0]["endpoint"], "/v1/signer");
    assert_eq!(services[0]["health"], "healthy");
    assert_eq!(services[0]["instances"][0]["health"], "healthy");

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), 200);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn unknown_routes_and_services_return_the_error_shape() {
    let (server, orchestrator) = launch(base_config()).await;

    let response = server.get("/nope").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["code"], "NotFound");
    assert_eq!(
        response.headers().get("x-request-id").unwrap().to_str().unwrap(),
        body["requestId"].as_str().unwrap()
    );

    let response = server
        .get("/v1/ghost/anything")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;
    assert_eq!(response.status_code(), 404);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn bearer_tokens_authenticate_when_jwt_is_configured() {
    use ferrogate_gateway::auth::Claims;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "an-integration-test-secret-of-32b!";
    std::env::set_var("FERROGATE_E2E_JWT_SECRET", SECRET);

    let upstream = healthy_upstream().await;
    Mock::given(method("GET"))
        .and(path("/pubkey"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut config = base_config();
    config.policies.auth.jwt = Some(ferrogate_gateway::config::JwtPolicyConfig {
        issuer: "ferrogate".to_string(),
        audience: "mesh".to_string(),
        secret_env: "FERROGATE_E2E_JWT_SECRET".to_string(),
    });
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let claims = Claims {
        sub: "svc-account".to_string(),
        role: "sign-writer".to_string(),
        iss: "ferrogate".to_string(),
        aud: "mesh".to_string(),
        exp: now + 600,
        iat: now,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    assert_eq!(response.status_code(), 200);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn mtls_header_check_gates_requests_when_enabled() {
    let upstream = healthy_upstream().await;
    Mock::given(method("GET"))
        .and(path("/pubkey"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut config = base_config();
    config.policies.mtls.enabled = true;
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;
    assert_eq!(response.status_code(), 401);
    let body: Value = response.json();
    assert_eq!(body["code"], "Unauthenticated");

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .add_header("x-client-cert-verified", "success")
        .await;
    assert_eq!(response.status_code(), 200);

    // Bypass paths stay reachable without the certificate header.
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn health_reports_degraded_above_error_threshold() {
    let upstream = healthy_upstream().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let mut config = base_config();
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    for _ in 0..3 {
        let response = server
            .get("/v1/signer/broken")
            .add_header("authorization", bearer(SIGNER_KEY))
            .await;
        assert_eq!(response.status_code(), 500);
    }

    // 100% error rate is far over the 5% default threshold.
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["status"], "degraded");
    assert!(body["metrics"]["errorRate"].as_f64().unwrap() > 0.05);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn shutdown_gate_rejects_new_requests() {
    let upstream = healthy_upstream().await;
    let mut config = base_config();
    config.services.push(service_at("signer", upstream.address()));
    let (server, orchestrator) = launch(config).await;

    orchestrator.shutdown().await;

    let response = server
        .get("/v1/signer/pubkey")
        .add_header("authorization", bearer(SIGNER_KEY))
        .await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["code"], "ShuttingDown");
    // Even the rejection carries the gateway headers.
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn round_robin_is_fair_across_equal_instances() {
    let a = healthy_upstream().await;
    let b = healthy_upstream().await;
    for upstream in [&a, &b] {
        Mock::given(method("GET"))
            .and(path("/pubkey"))
            .respond_with(ResponseTemplate::new(200))
            .mount(upstream)
            .await;
    }

    let mut config = base_config();
    let mut signer = service_at("signer", a.address());
    signer.instances.push(InstanceConfig {
        host: b.address().ip().to_string(),
        port: b.address().port(),
        weight: 1,
        health_path: None,
    });
    config.services.push(signer);
    let (server, orchestrator) = launch(config).await;

    for _ in 0..20 {
        let response = server
            .get("/v1/signer/pubkey")
            .add_header("authorization", bearer(SIGNER_KEY))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    for upstream in [&a, &b] {
        let hits = upstream
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/pubkey")
            .count();
        assert_eq!(hits, 10);
    }

    orchestrator.shutdown().await;
}
