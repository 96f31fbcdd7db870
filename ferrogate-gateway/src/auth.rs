//! # Authentication
//!
//! Two credential forms are accepted:
//!
//! - **Bearer tokens**: HS256-signed JWTs checked for signature, expiry and
//!   the configured issuer and audience. The signing secret comes from an
//!   environment variable named in configuration, never from the file
//!   itself.
//! - **API keys**: compared as salted SHA-256 digests against the stored
//!   set, after a minimum-length gate. Plaintext keys are never stored.
//!
//! Either way the result is a [`Principal`] carrying the caller's id and
//! role for the authorization stage. When authentication is disabled the
//! pipeline skips this stage entirely.

use crate::config::AuthPolicyConfig;
use crate::gateway_error::GatewayError;
use crate::request_context::{AuthKind, Principal};
use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Claims carried by accepted bearer tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the principal id.
    pub sub: String,
    /// Role granted to the principal.
    pub role: String,
    pub iss: String,
    pub aud: String,
    /// Expiry (seconds since epoch).
    pub exp: u64,
    /// Issued-at (seconds since epoch).
    pub iat: u64,
}

/// Pluggable credential verification, so tests and embedders can swap the
/// backing store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify_token(&self, token: &str) -> Option<Principal>;
    async fn verify_api_key(&self, key: &str) -> Option<Principal>;
}

struct KeyIdentity {
    name: String,
    role: String,
}

struct JwtVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

/// Config-backed credential store used by the auth middleware.
pub struct AuthService {
    enabled: bool,
    min_key_length: usize,
    salt: String,
    /// Salted digest -> identity.
    keys: HashMap<String, KeyIdentity>,
    jwt: Option<JwtVerifier>,
}

impl AuthService {
    /// Build from configuration. Fails closed: a configured JWT section
    /// with a missing or weak secret is a startup error, not a silent
    /// downgrade.
    pub fn from_config(config: &AuthPolicyConfig) -> anyhow::Result<Self> {
        let jwt = match &config.jwt {
            Some(jwt_config) if config.enabled => {
                let secret = std::env::var(&jwt_config.secret_env).map_err(|_| {
                    anyhow::anyhow!(
                        "auth is enabled but {} is not set",
                        jwt_config.secret_env
                    )
                })?;
                if secret.len() < 32 {
                    anyhow::bail!(
                        "JWT secret from {} is too short; need at least 32 bytes",
                        jwt_config.secret_env
                    );
                }
                let mut validation = Validation::new(Algorithm::HS256);
                validation.set_issuer(&[&jwt_config.issuer]);
                validation.set_audience(&[&jwt_config.audience]);
                Some(JwtVerifier {
                    decoding: DecodingKey::from_secret(secret.as_bytes()),
                    validation,
                })
            }
            _ => None,
        };

        let keys = config
            .api_keys
            .iter()
            .map(|key| {
                (
                    key.key_sha256.to_lowercase(),
                    KeyIdentity {
                        name: key.name.clone(),
                        role: key.role.clone(),
                    },
                )
            })
            .collect();

        Ok(Self {
            enabled: config.enabled,
            min_key_length: config.min_key_length,
            salt: config.api_key_salt.clone(),
            keys,
            jwt,
        })
    }

    /// Refuse configurations that enable auth with nothing to verify
    /// against.
    pub fn sanity_check(&self) -> anyhow::Result<()> {
        if self.enabled && self.keys.is_empty() && self.jwt.is_none() {
            anyhow::bail!("auth is enabled but no API keys or JWT settings are configured");
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Salted digest of an API key, as stored in configuration.
    pub fn hash_api_key(salt: &str, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(key.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Authenticate a request from its headers.
    ///
    /// Bearer values are tried as JWTs first and fall back to API-key
    /// lookup, so both `Authorization: Bearer <key>` and `X-API-Key: <key>`
    /// work for keys.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, GatewayError> {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let api_key_header = headers.get("x-api-key").and_then(|v| v.to_str().ok());

        if let Some(token) = bearer {
            if let Ok(principal) = self.verify_bearer(token) {
                return Ok(principal);
            }
            return self.verify_key(token);
        }
        if let Some(key) = api_key_header {
            return self.verify_key(key);
        }

        Err(GatewayError::Unauthenticated {
            message: "missing credentials".to_string(),
        })
    }

    fn verify_bearer(&self, token: &str) -> Result<Principal, GatewayError> {
        let verifier = self.jwt.as_ref().ok_or_else(|| GatewayError::Unauthenticated {
            message: "bearer tokens are not accepted".to_string(),
        })?;

        let data = decode::<Claims>(token, &verifier.decoding, &verifier.validation).map_err(
            |err| GatewayError::Unauthenticated {
                message: format!("invalid bearer token: {err}"),
            },
        )?;

        Ok(Principal {
            id: data.claims.sub,
            role: data.claims.role,
            auth_kind: AuthKind::Bearer,
        })
    }

    fn verify_key(&self, key: &str) -> Result<Principal, GatewayError> {
        if key.len() < self.min_key_length {
            return Err(GatewayError::Unauthenticated {
                message: "invalid API key".to_string(),
            });
        }
        let digest = Self::hash_api_key(&self.salt, key);
        match self.keys.get(&digest) {
            Some(identity) => Ok(Principal {
                id: identity.name.clone(),
                role: identity.role.clone(),
                auth_kind: AuthKind::ApiKey,
            }),
            None => Err(GatewayError::Unauthenticated {
                message: "invalid API key".to_string(),
            }),
        }
    }
}

#[async_trait]
impl CredentialStore for AuthService {
    async fn verify_token(&self, token: &str) -> Option<Principal> {
        self.verify_bearer(token).ok()
    }

    async fn verify_api_key(&self, key: &str) -> Option<Principal> {
        self.verify_key(key).ok()
    }
}
