//! Core entities shared by the policy engine, processor, query layer, and
//! re-index engine. `AuditRecord`/`ClusterEventRecord` are
//! the projected-column views of the opaque upstream JSON blobs; the core
//! never round-trips the full audit/event payload.

use clickhouse::Row;
use serde::{Deserialize, Serialize};

/// `(type, name)` tenant boundary derived from caller authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRef {
    #[serde(rename = "type")]
    pub scope_type: ScopeType,
    /// Empty for `Platform`.
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeType {
    Platform,
    Organization,
    Project,
    User,
}

impl TenantRef {
    pub fn platform() -> Self {
        Self {
            scope_type: ScopeType::Platform,
            name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Audit,
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginRef {
    #[serde(rename = "type")]
    pub origin_type: OriginType,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Whether an activity was produced by a human actor or the system itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Human,
    System,
}

/// A `(marker text, resource reference)` pair produced by the `link(...)`
/// policy-expression function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub display_text: String,
    pub resource_ref: ResourceRef,
}

/// Output of policy evaluation. The ClickHouse
/// table stores the same projected shape; nested refs are written as JSON
/// string columns (see `query::builder` row decoding).
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    pub creation_timestamp: chrono::DateTime<chrono::Utc>,
    pub tenant: TenantRef,
    pub origin: OriginRef,
    pub actor: ActorRef,
    pub resource: ResourceRef,
    pub change_source: ChangeSource,
    pub summary: String,
    #[serde(default)]
    pub links: Vec<Link>,
    /// Monotonic replacement version (`reindex_version` in ClickHouse).
    /// Higher wins on background merge.
    pub reindex_version: i64,
}

/// Projected columns of the standard cluster audit schema.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub audit_id: String,
    pub request_received_timestamp: chrono::DateTime<chrono::Utc>,
    pub verb: String,
    pub object_ref: AuditObjectRef,
    pub user: AuditUserRef,
    #[serde(default)]
    pub response_status_code: Option<u32>,
    pub tenant: TenantRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditObjectRef {
    #[serde(default)]
    pub api_group: Option<String>,
    /// Plural resource name, e.g. "deployments" — not `Kind`. See
    /// `processor::mapping` for the `(apiGroup, resource) -> Kind` resolver.
    pub resource: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditUserRef {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
}

/// Projected columns of the cluster event schema v1.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEventRecord {
    pub uid: String,
    pub event_time: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub series_count: Option<u32>,
    pub regarding: EventObjectRef,
    pub reason: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub note: String,
    #[serde(default)]
    pub reporting_controller: Option<String>,
    pub tenant: TenantRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventObjectRef {
    #[serde(default)]
    pub api_version: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_ref_platform_has_empty_name() {
        let t = TenantRef::platform();
        assert_eq!(t.scope_type, ScopeType::Platform);
        assert_eq!(t.name, "");
    }

    #[test]
    fn activity_record_roundtrips_through_json() {
        let activity = ActivityRecord {
            id: "a1".into(),
            creation_timestamp: chrono::Utc::now(),
            tenant: TenantRef {
                scope_type: ScopeType::Project,
                name: "p1".into(),
            },
            origin: OriginRef {
                origin_type: OriginType::Audit,
                id: "audit-1".into(),
            },
            actor: ActorRef {
                name: Some("alice".into()),
                ..Default::default()
            },
            resource: ResourceRef {
                kind: "Deployment".into(),
                name: "api".into(),
                ..Default::default()
            },
            change_source: ChangeSource::Human,
            summary: "alice created deployment api".into(),
            links: vec![],
            reindex_version: 1,
        };
        let json = serde_json::to_string(&activity).unwrap();
        let back: ActivityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "a1");
        assert_eq!(back.tenant.name, "p1");
        assert_eq!(back.change_source, ChangeSource::Human);
    }

    #[test]
    fn object_ref_resource_is_plural_not_kind() {
        let json = r#"{"resource":"deployments","name":"api"}"#;
        let obj: AuditObjectRef = serde_json::from_str(json).unwrap();
        assert_eq!(obj.resource, "deployments");
    }
}
