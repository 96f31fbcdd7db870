//! # Request Body Validation
//!
//! Object-shape schema validation for service request bodies, plus an
//! advisory scan for well-known injection markers. The schema check is
//! authoritative and rejects requests; the pattern scan only ever logs,
//! since string heuristics are too coarse to be a gate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Expected JSON kind of a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// Declarative object-shape schema: required fields with kinds and whether
/// unlisted fields are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodySchema {
    pub required: BTreeMap<String, FieldKind>,
    #[serde(default)]
    pub additional_properties: bool,
}

impl BodySchema {
    /// Validate a parsed body. An empty result means the body conforms.
    pub fn validate(&self, value: &Value) -> Vec<String> {
        let Some(object) = value.as_object() else {
            return vec!["body must be a JSON object".to_string()];
        };

        let mut errors = Vec::new();
        for (field, kind) in &self.required {
            match object.get(field) {
                None => errors.push(format!("missing required field: {field}")),
                Some(v) if !kind.matches(v) => {
                    errors.push(format!("field {field} has wrong type, expected {kind:?}"))
                }
                Some(_) => {}
            }
        }
        if !self.additional_properties {
            for field in object.keys() {
                if !self.required.contains_key(field) {
                    errors.push(format!("unexpected field: {field}"));
                }
            }
        }
        errors
    }
}

// Injection markers worth flagging in logs. Advisory only: schema
// validation is the actual gate.
static SUSPICIOUS_PATTERNS: &[&str] = &[
    // SQL injection
    "' or 1=1",
    "union select",
    "drop table",
    "; --",
    // XSS
    "<script",
    "javascript:",
    "onerror=",
    // Path traversal
    "../",
    "..\\",
    "/etc/passwd",
    // Command injection
    "$(",
    "; rm ",
];

/// Log any suspicious markers in a request body. Returns the number of
/// distinct patterns seen so callers can test the scan.
pub fn scan_advisory_patterns(request_id: &str, body: &str) -> usize {
    let lowered = body.to_lowercase();
    let hits: Vec<&str> = SUSPICIOUS_PATTERNS
        .iter()
        .filter(|p| lowered.contains(*p))
        .copied()
        .collect();
    if !hits.is_empty() {
        tracing::warn!(
            request_id = %request_id,
            patterns = ?hits,
            "request body contains suspicious patterns"
        );
    }
    hits.len()
}
