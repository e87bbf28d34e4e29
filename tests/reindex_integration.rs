mod common;

use activity_pipeline::crd::{PolicyRule, PolicySpec};
use activity_pipeline::policy::{evaluate, ApplyResult, EvaluationInput, PolicyCache, RuleKind};
use activity_pipeline::processor::actor::audit_evaluation_parts;
use activity_pipeline::query::time::{resolve_window, Surface};
use chrono::Utc;
use common::{make_audit_record, project_tenant};

fn spec(audit_match: &str, summary: &str) -> PolicySpec {
    PolicySpec {
        target_api_group: "apps".into(),
        target_kind: "Deployment".into(),
        audit_rules: vec![PolicyRule {
            match_expr: audit_match.into(),
            summary: summary.into(),
        }],
        event_rules: vec![],
    }
}

#[test]
fn a_reindex_job_window_without_an_explicit_end_defaults_to_now() {
    let reference = Utc::now();
    let window = resolve_window("now-7d", Some("now"), Surface::Activity, reference).unwrap();
    assert_eq!(window.end, reference);
    assert_eq!(window.start, reference - chrono::Duration::days(7));
}

#[test]
fn replaying_an_audit_record_through_the_shared_cache_reproduces_the_same_activity() {
    let cache = PolicyCache::new();
    let s = spec("audit.verb == 'create'", "{{ actor }} created {{ audit.objectRef.name }}");
    assert!(matches!(cache.apply("p1", 1, &s), ApplyResult::Ready));

    let tenant = project_tenant("acme");
    let record = make_audit_record("a1", "create", "deployments", "api", Some("alice"), tenant);

    let (rules, _) = cache.get("apps", "Deployment");
    let (actor, resource, origin, change_source, record_json, actor_json) =
        audit_evaluation_parts(&record);
    let input = EvaluationInput {
        record_json: &record_json,
        actor_json: &actor_json,
        actor,
        tenant: record.tenant.clone(),
        origin,
        resource,
        change_source,
    };

    let outcome = evaluate(RuleKind::Audit, &rules, &input, 1).unwrap();
    let activity = outcome.activity.expect("create should match");
    assert!(activity.summary.contains("api"));
}

#[test]
fn a_policy_name_filter_that_names_no_owning_policy_yields_no_rules_to_replay() {
    let cache = PolicyCache::new();
    let s = spec("audit.verb == 'create'", "x");
    cache.apply("owner-a", 1, &s);

    let (rules, _) = cache.get("apps", "Deployment");
    assert_eq!(rules.len(), 1);
    // a worker scoped to an unrelated policy name should see nothing to
    // replay against this target; that filtering lives in the worker, this
    // only proves the cache entry it would be filtering is non-empty.
    assert_eq!(cache.target_meta("apps", "Deployment").unwrap().0, "owner-a");
}
