//! Resolve the actor and resource reference for one audit/event record, and
//! build the policy-engine's `EvaluationInput` from it.

use serde_json::json;

use crate::policy::classify_actor;
use crate::types::{
    ActorRef, AuditRecord, ChangeSource, ClusterEventRecord, OriginRef, OriginType, ResourceRef,
};

pub fn audit_evaluation_parts(
    record: &AuditRecord,
) -> (ActorRef, ResourceRef, OriginRef, ChangeSource, serde_json::Value, serde_json::Value) {
    let actor = ActorRef {
        actor_type: None,
        name: record.user.username.clone(),
        uid: record.user.uid.clone(),
        email: None,
    };
    let resource = ResourceRef {
        api_group: record.object_ref.api_group.clone(),
        kind: record.object_ref.resource.clone(),
        namespace: record.object_ref.namespace.clone(),
        name: record.object_ref.name.clone(),
        uid: record.object_ref.uid.clone(),
    };
    let origin = OriginRef {
        origin_type: OriginType::Audit,
        id: record.audit_id.clone(),
    };
    let change_source = classify_actor(record.user.username.as_deref(), None);
    let record_json = json!({
        "verb": record.verb,
        "objectRef": {
            "apiGroup": record.object_ref.api_group,
            "resource": record.object_ref.resource,
            "namespace": record.object_ref.namespace,
            "name": record.object_ref.name,
            "uid": record.object_ref.uid,
        },
        "auditID": record.audit_id,
        "responseStatus": { "code": record.response_status_code },
    });
    let actor_json = json!(record.user.username.clone().unwrap_or_default());
    (actor, resource, origin, change_source, record_json, actor_json)
}

pub fn event_evaluation_parts(
    record: &ClusterEventRecord,
) -> (ActorRef, ResourceRef, OriginRef, ChangeSource, serde_json::Value, serde_json::Value) {
    let actor = ActorRef::default();
    let resource = ResourceRef {
        api_group: None,
        kind: record.regarding.kind.clone(),
        namespace: record.regarding.namespace.clone(),
        name: record.regarding.name.clone(),
        uid: record.regarding.uid.clone(),
    };
    let origin = OriginRef {
        origin_type: OriginType::Event,
        id: record.uid.clone(),
    };
    let change_source = classify_actor(None, record.reporting_controller.as_deref());
    let record_json = json!({
        "reason": record.reason,
        "type": match record.event_type { crate::types::EventType::Normal => "Normal", crate::types::EventType::Warning => "Warning" },
        "note": record.note,
        "regarding": {
            "kind": record.regarding.kind,
            "namespace": record.regarding.namespace,
            "name": record.regarding.name,
            "uid": record.regarding.uid,
        },
        "reportingController": record.reporting_controller,
    });
    let actor_json = json!(record.reporting_controller.clone().unwrap_or_default());
    (actor, resource, origin, change_source, record_json, actor_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditObjectRef, AuditUserRef, ScopeType, TenantRef};

    fn tenant() -> TenantRef {
        TenantRef {
            scope_type: ScopeType::Project,
            name: "p1".into(),
        }
    }

    #[test]
    fn audit_parts_derive_human_actor() {
        let record = AuditRecord {
            audit_id: "a1".into(),
            request_received_timestamp: chrono::Utc::now(),
            verb: "create".into(),
            object_ref: AuditObjectRef {
                resource: "deployments".into(),
                name: "api".into(),
                ..Default::default()
            },
            user: AuditUserRef {
                username: Some("alice".into()),
                ..Default::default()
            },
            response_status_code: Some(201),
            tenant: tenant(),
        };
        let (actor, resource, origin, change_source, _, _) = audit_evaluation_parts(&record);
        assert_eq!(actor.name.as_deref(), Some("alice"));
        assert_eq!(resource.name, "api");
        assert_eq!(origin.id, "a1");
        assert_eq!(change_source, ChangeSource::Human);
    }

    #[test]
    fn audit_parts_derive_system_actor() {
        let record = AuditRecord {
            audit_id: "a2".into(),
            request_received_timestamp: chrono::Utc::now(),
            verb: "update".into(),
            object_ref: AuditObjectRef {
                resource: "pods".into(),
                name: "p".into(),
                ..Default::default()
            },
            user: AuditUserRef {
                username: Some("system:node:worker-1".into()),
                ..Default::default()
            },
            response_status_code: None,
            tenant: tenant(),
        };
        let (_, _, _, change_source, _, _) = audit_evaluation_parts(&record);
        assert_eq!(change_source, ChangeSource::System);
    }
}
