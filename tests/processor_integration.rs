mod common;

use std::time::Duration;

use activity_pipeline::processor::actor::audit_evaluation_parts;
use activity_pipeline::processor::pool::{backoff_delay, batch_ready};
use common::{make_audit_record, project_tenant};

#[test]
fn backoff_doubles_until_the_cap() {
    let min = Duration::from_millis(100);
    let max = Duration::from_secs(30);
    assert_eq!(backoff_delay(0, min, max), Duration::from_millis(100));
    assert_eq!(backoff_delay(1, min, max), Duration::from_millis(200));
    assert_eq!(backoff_delay(2, min, max), Duration::from_millis(400));
    assert_eq!(backoff_delay(20, min, max), max);
}

#[test]
fn batch_fires_on_size_before_timeout_elapses() {
    assert!(batch_ready(100, 100, Duration::from_millis(10), Duration::from_millis(250)));
    assert!(!batch_ready(5, 100, Duration::from_millis(10), Duration::from_millis(250)));
}

#[test]
fn batch_fires_on_timeout_with_a_partial_batch() {
    assert!(batch_ready(3, 100, Duration::from_millis(300), Duration::from_millis(250)));
    assert!(!batch_ready(0, 100, Duration::from_millis(300), Duration::from_millis(250)));
}

#[test]
fn audit_batch_derives_stable_actor_and_resource_refs() {
    let tenant = project_tenant("acme");
    let records = vec![
        make_audit_record("a1", "create", "deployments", "api", Some("alice"), tenant.clone()),
        make_audit_record("a2", "update", "deployments", "api", Some("alice"), tenant.clone()),
        make_audit_record("a3", "delete", "pods", "worker", Some("system:node:n1"), tenant),
    ];

    let parts: Vec<_> = records.iter().map(audit_evaluation_parts).collect();

    assert_eq!(parts[0].0.name.as_deref(), Some("alice"));
    assert_eq!(parts[1].1.name, "api");
    assert_eq!(
        parts[2].3,
        activity_pipeline::types::ChangeSource::System
    );
}
