mod common;

use activity_pipeline::crd::PolicySpec;
use activity_pipeline::policy::{evaluate, ApplyResult, EvaluationInput, PolicyCache, RuleKind};
use activity_pipeline::processor::actor::audit_evaluation_parts;
use activity_pipeline::types::OriginType;
use common::{make_audit_record, project_tenant, rule};

// ══════════════════════════════════════════════════════════════════
// End-to-end policy pipeline tests (no cluster required)
//
// Each test exercises: apply policy spec -> compiled cache entry ->
// derive evaluation parts from a raw record -> evaluate -> activity.
// ══════════════════════════════════════════════════════════════════

fn spec(audit_rules: Vec<activity_pipeline::crd::PolicyRule>) -> PolicySpec {
    PolicySpec {
        target_api_group: "apps".into(),
        target_kind: "Deployment".into(),
        audit_rules,
        event_rules: vec![],
    }
}

#[test]
fn audit_record_matches_and_produces_activity() {
    let cache = PolicyCache::new();
    let s = spec(vec![rule(
        "audit.verb == 'create'",
        "{{ actor }} created {{ audit.objectRef.name }}",
    )]);
    assert!(matches!(cache.apply("p1", 1, &s), ApplyResult::Ready));

    let tenant = project_tenant("acme");
    let record = make_audit_record("a1", "create", "deployments", "api", Some("alice"), tenant.clone());
    let (actor, resource, origin, change_source, record_json, actor_json) =
        audit_evaluation_parts(&record);

    let input = EvaluationInput {
        record_json: &record_json,
        actor_json: &actor_json,
        actor,
        tenant,
        origin,
        resource,
        change_source,
    };

    let (audit_rules, _) = cache.get("apps", "Deployment");
    let outcome = evaluate(RuleKind::Audit, &audit_rules, &input, 1).unwrap();

    let activity = outcome.activity.expect("rule should have matched");
    assert_eq!(activity.summary, "alice created api");
    assert_eq!(activity.origin.origin_type, OriginType::Audit);
    assert!(outcome.match_errors.is_empty());
}

#[test]
fn non_matching_verb_produces_no_activity() {
    let cache = PolicyCache::new();
    let s = spec(vec![rule("audit.verb == 'delete'", "{{ actor }} deleted it")]);
    assert!(matches!(cache.apply("p1", 1, &s), ApplyResult::Ready));

    let tenant = project_tenant("acme");
    let record = make_audit_record("a2", "create", "deployments", "api", Some("bob"), tenant.clone());
    let (actor, resource, origin, change_source, record_json, actor_json) =
        audit_evaluation_parts(&record);

    let input = EvaluationInput {
        record_json: &record_json,
        actor_json: &actor_json,
        actor,
        tenant,
        origin,
        resource,
        change_source,
    };

    let (audit_rules, _) = cache.get("apps", "Deployment");
    let outcome = evaluate(RuleKind::Audit, &audit_rules, &input, 1).unwrap();
    assert!(outcome.activity.is_none());
}

#[test]
fn first_registered_policy_wins_on_target_collision() {
    let cache = PolicyCache::new();
    let s1 = spec(vec![rule("true", "first")]);
    let s2 = spec(vec![rule("true", "second")]);

    assert!(matches!(cache.apply("p1", 1, &s1), ApplyResult::Ready));
    assert!(matches!(cache.apply("p2", 1, &s2), ApplyResult::Collision { .. }));
    assert_eq!(cache.target_meta("apps", "Deployment"), Some(("p1".into(), 1)));
}

#[test]
fn evicting_the_owning_policy_clears_its_target() {
    let cache = PolicyCache::new();
    let s = spec(vec![rule("true", "x")]);
    cache.apply("p1", 1, &s);
    assert_eq!(cache.len(), 1);

    cache.evict("apps", "Deployment", "p1");
    assert!(cache.is_empty());
    let (audit, _) = cache.get("apps", "Deployment");
    assert!(audit.is_empty());
}

#[test]
fn system_reporting_controller_classifies_as_system_actor() {
    use activity_pipeline::processor::actor::event_evaluation_parts;
    use activity_pipeline::types::{ClusterEventRecord, EventObjectRef, EventType};

    let tenant = project_tenant("acme");
    let record = ClusterEventRecord {
        uid: "e1".into(),
        event_time: chrono::Utc::now(),
        series_count: None,
        regarding: EventObjectRef {
            kind: "Pod".into(),
            name: "worker-1".into(),
            ..Default::default()
        },
        reason: "BackOff".into(),
        event_type: EventType::Warning,
        note: "pulling image".into(),
        reporting_controller: Some("kubelet".into()),
        tenant,
    };

    let (_, _, _, change_source, _, _) = event_evaluation_parts(&record);
    assert_eq!(change_source, activity_pipeline::types::ChangeSource::System);
}
