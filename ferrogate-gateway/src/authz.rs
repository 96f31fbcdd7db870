//! # Authorization
//!
//! Maps an authenticated principal's role to a permission set and checks it
//! against the permission a request needs. Permissions are `service:action`
//! strings; a role may hold `service:*` to cover every action on a service
//! or a bare `*` for everything.

use axum::http::Method;
use std::collections::{HashMap, HashSet};

use crate::config::AuthzPolicyConfig;

/// Role -> permission lookup with wildcard support.
pub struct AuthzPolicy {
    role_permissions: HashMap<String, HashSet<String>>,
}

impl AuthzPolicy {
    pub fn from_config(config: &AuthzPolicyConfig) -> Self {
        let role_permissions = config
            .role_permissions
            .iter()
            .map(|(role, perms)| (role.clone(), perms.iter().cloned().collect()))
            .collect();
        Self { role_permissions }
    }

    /// Permission a request needs: reads map to `service:read`, everything
    /// else to `service:write`.
    pub fn required_permission(service: &str, method: &Method) -> String {
        let action = match *method {
            Method::GET | Method::HEAD | Method::OPTIONS => "read",
            _ => "write",
        };
        format!("{service}:{action}")
    }

    /// Whether `role` holds `permission`, directly or through a wildcard.
    pub fn is_allowed(&self, role: &str, permission: &str) -> bool {
        let Some(perms) = self.role_permissions.get(role) else {
            return false;
        };
        if perms.contains("*") || perms.contains(permission) {
            return true;
        }
        permission
            .split_once(':')
            .is_some_and(|(service, _)| perms.contains(&format!("{service}:*")))
    }
}
