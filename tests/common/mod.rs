use activity_pipeline::crd::PolicyRule;
use activity_pipeline::types::{
    AuditObjectRef, AuditRecord, AuditUserRef, ClusterEventRecord, EventObjectRef, EventType,
    ScopeType, TenantRef,
};

pub fn project_tenant(name: &str) -> TenantRef {
    TenantRef {
        scope_type: ScopeType::Project,
        name: name.to_string(),
    }
}

pub fn make_audit_record(
    audit_id: &str,
    verb: &str,
    resource: &str,
    name: &str,
    username: Option<&str>,
    tenant: TenantRef,
) -> AuditRecord {
    AuditRecord {
        audit_id: audit_id.to_string(),
        request_received_timestamp: chrono::Utc::now(),
        verb: verb.to_string(),
        object_ref: AuditObjectRef {
            resource: resource.to_string(),
            name: name.to_string(),
            ..Default::default()
        },
        user: AuditUserRef {
            username: username.map(str::to_string),
            ..Default::default()
        },
        response_status_code: Some(200),
        tenant,
    }
}

pub fn make_event_record(
    uid: &str,
    reason: &str,
    kind: &str,
    name: &str,
    event_type: EventType,
    tenant: TenantRef,
) -> ClusterEventRecord {
    ClusterEventRecord {
        uid: uid.to_string(),
        event_time: chrono::Utc::now(),
        series_count: None,
        regarding: EventObjectRef {
            kind: kind.to_string(),
            name: name.to_string(),
            ..Default::default()
        },
        reason: reason.to_string(),
        event_type,
        note: format!("{reason} on {name}"),
        reporting_controller: None,
        tenant,
    }
}

pub fn rule(match_expr: &str, summary: &str) -> PolicyRule {
    PolicyRule {
        match_expr: match_expr.to_string(),
        summary: summary.to_string(),
    }
}
