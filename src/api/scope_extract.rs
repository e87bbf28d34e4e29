//! Scope derivation from the authenticated user's extra attributes. The
//! real deployment sits behind an aggregated API server that already
//! authenticates the caller and forwards these as impersonation-extras
//! headers; this module is a thin dev/test stand-in for that boundary, not
//! a general-purpose auth layer.

use axum::http::HeaderMap;

use crate::types::{ScopeType, TenantRef};

const PARENT_TYPE_HEADER: &str = "iam.miloapis.com/parent-type";
const PARENT_NAME_HEADER: &str = "iam.miloapis.com/parent-name";

/// Missing headers default to platform scope.
pub fn extract_scope(headers: &HeaderMap) -> TenantRef {
    let parent_type = headers
        .get(PARENT_TYPE_HEADER)
        .and_then(|v| v.to_str().ok());
    let parent_name = headers
        .get(PARENT_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match parent_type {
        Some("Organization") => TenantRef {
            scope_type: ScopeType::Organization,
            name: parent_name.to_string(),
        },
        Some("Project") => TenantRef {
            scope_type: ScopeType::Project,
            name: parent_name.to_string(),
        },
        Some("User") => TenantRef {
            scope_type: ScopeType::User,
            name: parent_name.to_string(),
        },
        _ => TenantRef::platform(),
    }
}
