//! Shared helpers: duration (de)serialization and the subsystem health
//! capability contract.

use serde::Serialize;
use std::time::Duration;

/// Serde adapter for `Duration` fields expressed as strings like `"30s"`,
/// `"500ms"`, `"5m"` or `"1h"` in configuration files.
pub mod duration_serde {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        use serde::Deserialize;
        use serde_json::Value;

        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => super::parse_duration(&s).map_err(Error::custom),
            Value::Number(n) => {
                let secs = n
                    .as_u64()
                    .ok_or_else(|| Error::custom("negative duration"))?;
                Ok(Duration::from_secs(secs))
            }
            _ => Err(Error::custom("invalid duration format")),
        }
    }
}

/// Parse a human-readable duration (`30s`, `500ms`, `5m`, `2h`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Some(stripped) = s.strip_suffix("ms") {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_millis(num));
    }
    if let Some(stripped) = s.strip_suffix('s') {
        if !stripped.ends_with('m') && !stripped.ends_with('h') {
            let num: f64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            let secs = num.trunc() as u64;
            let nanos = (num.fract() * 1_000_000_000.0).round() as u32;
            return Ok(Duration::new(secs, nanos));
        }
    }
    if let Some(stripped) = s.strip_suffix('m') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 60));
    }
    if let Some(stripped) = s.strip_suffix('h') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 3600));
    }
    Err(format!("unknown duration unit: {s}"))
}

/// Point-in-time health report for a single subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `"ok"` or `"degraded"`.
    pub status: &'static str,
    /// Subsystem-specific detail fields.
    pub details: serde_json::Value,
}

impl HealthStatus {
    pub fn ok(details: serde_json::Value) -> Self {
        Self {
            status: "ok",
            details,
        }
    }

    pub fn degraded(details: serde_json::Value) -> Self {
        Self {
            status: "degraded",
            details,
        }
    }
}

/// Fixed capability contract implemented by every long-lived component.
///
/// Replaces ad-hoc, per-component health lookups: anything the orchestrator
/// owns can be asked for its status through the same interface.
pub trait Subsystem: Send + Sync {
    /// Stable component name used in health reports.
    fn name(&self) -> &'static str;

    /// Current health with component-specific details.
    fn health_status(&self) -> HealthStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_duration_forms() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
