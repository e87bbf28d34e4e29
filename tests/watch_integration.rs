mod common;

use activity_pipeline::types::EventType;
use activity_pipeline::watch::{matches_selector, parse_field_selector, FieldSelectorError, SelectorOp};
use common::{make_event_record, project_tenant};

#[test]
fn empty_selector_matches_everything() {
    let terms = parse_field_selector("").unwrap();
    assert!(terms.is_empty());

    let tenant = project_tenant("acme");
    let event = make_event_record("e1", "Scheduled", "Pod", "web-1", EventType::Normal, tenant);
    assert!(matches_selector(&event, &terms));
}

#[test]
fn selector_rejects_fields_outside_the_whitelist() {
    let err = parse_field_selector("metadata.uid=abc").unwrap_err();
    assert_eq!(err, FieldSelectorError::UnknownField("metadata.uid".into()));
}

#[test]
fn selector_rejects_malformed_terms() {
    let err = parse_field_selector("reason").unwrap_err();
    assert_eq!(err, FieldSelectorError::Malformed("reason".into()));
}

#[test]
fn eq_and_ne_terms_combine_with_implicit_and() {
    let tenant = project_tenant("acme");
    let event = make_event_record("e1", "BackOff", "Pod", "web-1", EventType::Warning, tenant);

    let matching = parse_field_selector("reason=BackOff,type!=Normal").unwrap();
    assert!(matches_selector(&event, &matching));

    let non_matching = parse_field_selector("reason=BackOff,type=Normal").unwrap();
    assert!(!matches_selector(&event, &non_matching));
}

#[test]
fn involved_object_fields_read_through_to_the_regarding_ref() {
    let tenant = project_tenant("acme");
    let event = make_event_record("e1", "Created", "Deployment", "api", EventType::Normal, tenant);

    let terms = parse_field_selector("involvedObject.kind=Deployment,involvedObject.name=api").unwrap();
    assert!(matches_selector(&event, &terms));
    assert_eq!(terms[0].op, SelectorOp::Eq);
}
