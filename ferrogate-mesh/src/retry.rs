//! Opt-in retry helper for mesh callers.
//!
//! The gateway's reverse proxy never retries; callers that want retries use
//! this helper explicitly. Retries are capped at `max_attempts` with a fixed
//! delay and only ever apply to idempotent methods.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry parameters; disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "crate::common::duration_serde", default = "default_delay")]
    pub fixed_delay: Duration,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_delay() -> Duration {
    Duration::from_millis(200)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            fixed_delay: default_delay(),
        }
    }
}

/// Methods safe to repeat without caller coordination.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Drive `operation` under the policy. Non-idempotent methods and disabled
/// policies run exactly once. The closure receives the 1-based attempt
/// number.
pub async fn call_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    method: &Method,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = if policy.enabled && is_idempotent(method) {
        policy.max_attempts.max(1)
    } else {
        1
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::debug!(attempt, error = %err, "mesh call failed, retrying after fixed delay");
                tokio::time::sleep(policy.fixed_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
