//! # Gateway Configuration
//!
//! Configuration for the gateway: server binding, registered services and
//! their instances, policy pipeline settings, timeouts and health
//! thresholds. Loaded once from a TOML file, adjusted by environment
//! overrides, validated, and then passed to the orchestrator as a single
//! immutable object. There is no hot reload; configuration errors at
//! startup are fatal.
//!
//! Durations are written as strings (`"30s"`, `"500ms"`); see
//! [`ferrogate_mesh::common::parse_duration`].

use ferrogate_mesh::balancer::LoadBalancePolicy;
use ferrogate_mesh::breaker::CircuitBreakerConfig;
use ferrogate_mesh::common::duration_serde;
use ferrogate_mesh::ratelimit::RateLimitConfig;
use ferrogate_mesh::registry::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::validation::BodySchema;

/// Top-level configuration object handed to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub policies: PoliciesConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub health: HealthThresholds,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Gateway name advertised in `X-Gateway-Name` and `X-Proxied-By`.
    #[serde(default = "default_gateway_name")]
    pub name: String,
    /// Maximum accepted request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_gateway_name() -> String {
    "ferrogate".to_string()
}
fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_gateway_name(),
            max_body_size: default_max_body_size(),
            cors: CorsConfig::default(),
        }
    }
}

/// CORS settings applied by the outer middleware stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// A service to register at startup, together with its policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_service_version")]
    pub version: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub load_balancing: LoadBalancePolicy,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
    /// Per-service override of the default rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub auth: ServiceAuthConfig,
}

fn default_service_version() -> String {
    "v1".to_string()
}
fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceConfig {
    /// Mesh-facing view of this service.
    pub fn to_spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: self.name.clone(),
            version: self.version.clone(),
            health_path: self.health_path.clone(),
            load_balancing: self.load_balancing,
            breaker: self.circuit.clone(),
            rate_limit: self.rate_limit.clone(),
            required_roles: self.auth.roles.clone(),
        }
    }
}

/// Authorization roles and optional body schema for one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceAuthConfig {
    /// Roles allowed to call the service; empty admits any authenticated
    /// principal.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Object-shape schema enforced on request bodies.
    #[serde(default)]
    pub schema: Option<BodySchema>,
}

/// An upstream address registered for a service at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Override of the service-level health path.
    #[serde(default)]
    pub health_path: Option<String>,
}

fn default_weight() -> u32 {
    1
}

/// Policy pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesConfig {
    #[serde(default)]
    pub auth: AuthPolicyConfig,
    #[serde(default)]
    pub authz: AuthzPolicyConfig,
    #[serde(default)]
    pub mtls: MtlsPolicyConfig,
    /// Default rate limit for services without an override.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Paths exempted from auth, authz and rate limiting.
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,
}

fn default_bypass_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/metrics".to_string(),
        "/services".to_string(),
    ]
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            auth: AuthPolicyConfig::default(),
            authz: AuthzPolicyConfig::default(),
            mtls: MtlsPolicyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            bypass_paths: default_bypass_paths(),
        }
    }
}

/// Authentication settings: API keys and bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Shortest API key accepted before hashing is even attempted.
    #[serde(default = "default_min_key_length")]
    pub min_key_length: usize,
    /// Salt mixed into stored API-key digests.
    #[serde(default)]
    pub api_key_salt: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default)]
    pub jwt: Option<JwtPolicyConfig>,
}

fn default_min_key_length() -> usize {
    8
}

impl Default for AuthPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_key_length: default_min_key_length(),
            api_key_salt: String::new(),
            api_keys: Vec::new(),
            jwt: None,
        }
    }
}

/// A stored API key: only the salted digest lives in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Human-readable key name, used as the principal id.
    pub name: String,
    /// Role granted to callers presenting this key.
    pub role: String,
    /// Hex SHA-256 of `salt + key`.
    pub key_sha256: String,
}

/// Bearer-token verification settings. The signing secret is never part of
/// the file; it is read from the named environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtPolicyConfig {
    pub issuer: String,
    pub audience: String,
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_secret_env() -> String {
    "FERROGATE_JWT_SECRET".to_string()
}

/// Role-to-permission table. Permissions are `service:action` strings and
/// support `service:*` and `*` wildcards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthzPolicyConfig {
    #[serde(default)]
    pub role_permissions: HashMap<String, Vec<String>>,
}

/// Trusted client-certificate header check, for deployments where TLS is
/// terminated in front of the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtlsPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mtls_header")]
    pub header: String,
    #[serde(default = "default_mtls_expected")]
    pub expected: String,
}

fn default_mtls_header() -> String {
    "x-client-cert-verified".to_string()
}
fn default_mtls_expected() -> String {
    "success".to_string()
}

impl Default for MtlsPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            header: default_mtls_header(),
            expected: default_mtls_expected(),
        }
    }
}

/// Component-level timeouts. A shorter per-request deadline always wins
/// over the upstream default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Total per-request deadline.
    #[serde(with = "duration_serde", default = "default_request_timeout")]
    pub request: Duration,
    /// Health probe timeout.
    #[serde(with = "duration_serde", default = "default_probe_timeout")]
    pub probe: Duration,
    /// Upstream dial-and-response timeout.
    #[serde(with = "duration_serde", default = "default_upstream_timeout")]
    pub upstream: Duration,
    /// How long shutdown waits for in-flight requests to drain.
    #[serde(with = "duration_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// Interval between health probe sweeps.
    #[serde(with = "duration_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            probe: default_probe_timeout(),
            upstream: default_upstream_timeout(),
            shutdown_grace: default_shutdown_grace(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

/// Thresholds behind the `/health` verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// `/health` reports degraded at or above this error rate.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// `/health` reports degraded at or above this average latency.
    #[serde(default = "default_avg_latency_threshold_ms")]
    pub avg_latency_threshold_ms: u64,
}

fn default_error_rate_threshold() -> f64 {
    0.05
}
fn default_avg_latency_threshold_ms() -> u64 {
    1000
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate_threshold: default_error_rate_threshold(),
            avg_latency_threshold_ms: default_avg_latency_threshold_ms(),
        }
    }
}

/// Logging settings applied by `main` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

impl GatewayConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config file {path}: {e}"))?;
        let mut config: GatewayConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for deployment-specific settings.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("FERROGATE_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port_str) = env::var("FERROGATE_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid FERROGATE_PORT: {port_str}"))?;
            if port > 0 {
                self.server.port = port;
            }
        }
        if let Ok(level) = env::var("FERROGATE_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(timeout) = env::var("FERROGATE_REQUEST_TIMEOUT") {
            self.timeouts.request = ferrogate_mesh::common::parse_duration(&timeout)
                .map_err(|e| anyhow::anyhow!("invalid FERROGATE_REQUEST_TIMEOUT: {e}"))?;
        }
        Ok(())
    }

    /// Validate structural constraints. Violations are fatal at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }
        if self.server.max_body_size == 0 {
            anyhow::bail!("max body size cannot be 0");
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("service name cannot be empty");
            }
            if !service
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                anyhow::bail!("invalid service name: {}", service.name);
            }
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("duplicate service name: {}", service.name);
            }
            for instance in &service.instances {
                if instance.host.is_empty() || instance.port == 0 {
                    anyhow::bail!("invalid instance address for service {}", service.name);
                }
            }
        }

        for path in &self.policies.bypass_paths {
            if !path.starts_with('/') {
                anyhow::bail!("bypass path must start with '/': {path}");
            }
        }

        if self.policies.auth.enabled {
            if let Some(jwt) = &self.policies.auth.jwt {
                if jwt.issuer.is_empty() || jwt.audience.is_empty() {
                    anyhow::bail!("jwt issuer and audience must be set when auth is enabled");
                }
            }
            for key in &self.policies.auth.api_keys {
                if key.key_sha256.len() != 64
                    || !key.key_sha256.chars().all(|c| c.is_ascii_hexdigit())
                {
                    anyhow::bail!("api key '{}' digest is not hex sha-256", key.name);
                }
            }
        }

        if !(0.0..=1.0).contains(&self.health.error_rate_threshold) {
            anyhow::bail!("error rate threshold must be within 0.0..=1.0");
        }
        if self.timeouts.request.is_zero() || self.timeouts.upstream.is_zero() {
            anyhow::bail!("request and upstream timeouts cannot be 0");
        }
        Ok(())
    }

    /// Configuration of a named service, if present.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Effective rate limit for a service: its override or the default.
    pub fn rate_limit_for(&self, service: Option<&str>) -> &RateLimitConfig {
        service
            .and_then(|name| self.service(name))
            .and_then(|s| s.rate_limit.as_ref())
            .unwrap_or(&self.policies.rate_limit)
    }

    pub fn is_bypass_path(&self, path: &str) -> bool {
        self.policies.bypass_paths.iter().any(|p| p == path)
    }
}
