//! Policy evaluation: rule matching and preview-against-samples.

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::crd::PolicyRule;
use crate::policy::cache::CompiledRule;
use crate::policy::expr::{self, CompiledMatch, CompiledTemplate, EvalError, LinkSink, RuleKind};
use crate::types::{
    ActivityRecord, ActorRef, ChangeSource, Link, OriginRef, OriginType, ResourceRef, TenantRef,
};

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("fatal template error on rule {rule_index}: {source}")]
    FatalTemplate {
        rule_index: usize,
        #[source]
        source: EvalError,
    },
}

/// One record projected for policy evaluation: its JSON body (for CEL field
/// access), the resolved actor, tenant, origin, and resource reference.
pub struct EvaluationInput<'a> {
    pub record_json: &'a JsonValue,
    pub actor_json: &'a JsonValue,
    pub actor: ActorRef,
    pub tenant: TenantRef,
    pub origin: OriginRef,
    pub resource: ResourceRef,
    pub change_source: ChangeSource,
}

/// Outcome of evaluating one record against an ordered rule set: first
/// match wins.
pub struct EvaluationOutcome {
    pub activity: Option<ActivityRecord>,
    /// Rule indices whose match expression errored at runtime — counted in
    /// the policy's rolling error window, not fatal to the batch.
    pub match_errors: Vec<(usize, EvalError)>,
}

pub fn evaluate(
    kind: RuleKind,
    rules: &[CompiledRule],
    input: &EvaluationInput,
    reindex_version: i64,
) -> Result<EvaluationOutcome, EvaluationError> {
    let mut match_errors = Vec::new();

    for (index, rule) in rules.iter().enumerate() {
        let sink = LinkSink::new();
        let ctx = match expr::build_context(kind, input.record_json, input.actor_json, sink.clone())
        {
            Ok(ctx) => ctx,
            Err(e) => {
                match_errors.push((index, e));
                continue;
            }
        };

        match rule.matcher.evaluate(&ctx) {
            Ok(true) => {
                let summary = rule.template.render(&ctx).map_err(|e| {
                    EvaluationError::FatalTemplate {
                        rule_index: index,
                        source: e,
                    }
                })?;
                let links = sink.into_links();
                let activity = ActivityRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    creation_timestamp: chrono::Utc::now(),
                    tenant: input.tenant.clone(),
                    origin: input.origin.clone(),
                    actor: input.actor.clone(),
                    resource: input.resource.clone(),
                    change_source: input.change_source,
                    summary,
                    links,
                    reindex_version,
                };
                return Ok(EvaluationOutcome {
                    activity: Some(activity),
                    match_errors,
                });
            }
            Ok(false) => continue,
            Err(e) => {
                match_errors.push((index, e));
                continue;
            }
        }
    }

    Ok(EvaluationOutcome {
        activity: None,
        match_errors,
    })
}

/// Result of previewing one rule against one sample input.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub matched_rule_index: Option<usize>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Compile a policy spec transiently (never stored) and evaluate each
/// sample input against it.
pub fn preview(
    kind: RuleKind,
    rules: &[PolicyRule],
    samples: &[(JsonValue, JsonValue)],
) -> Vec<PreviewResult> {
    let compiled: Vec<Result<(CompiledMatch, CompiledTemplate), String>> = rules
        .iter()
        .map(|r| {
            let m = expr::compile_match(&r.match_expr, kind).map_err(|e| e.to_string())?;
            let t = expr::compile_template(&r.summary, kind).map_err(|e| e.to_string())?;
            Ok((m, t))
        })
        .collect();

    samples
        .iter()
        .map(|(record_json, actor_json)| {
            for (index, entry) in compiled.iter().enumerate() {
                let (matcher, template) = match entry {
                    Ok(pair) => pair,
                    Err(e) => {
                        return PreviewResult {
                            matched_rule_index: None,
                            summary: None,
                            error: Some(format!("rule {index} failed to compile: {e}")),
                        };
                    }
                };
                let sink = LinkSink::new();
                let ctx =
                    match expr::build_context(kind, record_json, actor_json, sink) {
                        Ok(ctx) => ctx,
                        Err(e) => {
                            return PreviewResult {
                                matched_rule_index: None,
                                summary: None,
                                error: Some(e.to_string()),
                            };
                        }
                    };
                match matcher.evaluate(&ctx) {
                    Ok(true) => {
                        return match template.render(&ctx) {
                            Ok(summary) => PreviewResult {
                                matched_rule_index: Some(index),
                                summary: Some(summary),
                                error: None,
                            },
                            Err(e) => PreviewResult {
                                matched_rule_index: Some(index),
                                summary: None,
                                error: Some(e.to_string()),
                            },
                        };
                    }
                    Ok(false) => continue,
                    Err(_) => continue,
                }
            }
            PreviewResult {
                matched_rule_index: None,
                summary: None,
                error: None,
            }
        })
        .collect()
}

/// Derive `changeSource` from the audit user / event reporting controller.
pub fn classify_actor(username: Option<&str>, reporting_controller: Option<&str>) -> ChangeSource {
    if username.map(|u| u.starts_with("system:")).unwrap_or(false) {
        return ChangeSource::System;
    }
    if reporting_controller.map(|s| !s.is_empty()).unwrap_or(false) && username.is_none() {
        return ChangeSource::System;
    }
    ChangeSource::Human
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PolicyRule;
    use crate::policy::cache::compile_rule;
    use crate::types::{OriginType, ScopeType};
    use serde_json::json;

    fn tenant() -> TenantRef {
        TenantRef {
            scope_type: ScopeType::Project,
            name: "p1".into(),
        }
    }

    #[test]
    fn single_audit_to_activity_scenario() {
        let rule = compile_rule(
            &PolicyRule {
                match_expr: "audit.verb == 'create'".into(),
                summary: "{{ actor }} created deployment {{ audit.objectRef.name }}".into(),
            },
            RuleKind::Audit,
        )
        .unwrap();

        let record = json!({
            "verb": "create",
            "objectRef": {"apiGroup": "apps", "resource": "deployments", "name": "api", "namespace": "prod"},
            "auditID": "a1"
        });
        let input = EvaluationInput {
            record_json: &record,
            actor_json: &json!("alice"),
            actor: ActorRef {
                name: Some("alice".into()),
                ..Default::default()
            },
            tenant: tenant(),
            origin: OriginRef {
                origin_type: OriginType::Audit,
                id: "a1".into(),
            },
            resource: ResourceRef {
                api_group: Some("apps".into()),
                kind: "Deployment".into(),
                namespace: Some("prod".into()),
                name: "api".into(),
                uid: None,
            },
            change_source: ChangeSource::Human,
        };

        let outcome = evaluate(RuleKind::Audit, &[rule], &input, 1).unwrap();
        let activity = outcome.activity.expect("expected a match");
        assert_eq!(activity.summary, "alice created deployment api");
        assert_eq!(activity.origin.id, "a1");
        assert_eq!(activity.tenant.name, "p1");
    }

    #[test]
    fn first_match_wins_scenario() {
        let rule_a = compile_rule(
            &PolicyRule {
                match_expr: "audit.verb == 'create'".into(),
                summary: "A".into(),
            },
            RuleKind::Audit,
        )
        .unwrap();
        let rule_b = compile_rule(
            &PolicyRule {
                match_expr: "true".into(),
                summary: "B".into(),
            },
            RuleKind::Audit,
        )
        .unwrap();
        let rules = vec![rule_a, rule_b];

        let make_input = |verb: &str| {
            json!({"verb": verb, "objectRef": {"resource": "deployments", "name": "api"}, "auditID": "a1"})
        };

        let record = make_input("create");
        let input = EvaluationInput {
            record_json: &record,
            actor_json: &json!("alice"),
            actor: ActorRef::default(),
            tenant: tenant(),
            origin: OriginRef {
                origin_type: OriginType::Audit,
                id: "a1".into(),
            },
            resource: ResourceRef::default(),
            change_source: ChangeSource::Human,
        };
        let outcome = evaluate(RuleKind::Audit, &rules, &input, 1).unwrap();
        assert_eq!(outcome.activity.unwrap().summary, "A");

        let record2 = make_input("delete");
        let input2 = EvaluationInput {
            record_json: &record2,
            ..input
        };
        let outcome2 = evaluate(RuleKind::Audit, &rules, &input2, 1).unwrap();
        assert_eq!(outcome2.activity.unwrap().summary, "B");
    }

    #[test]
    fn empty_rule_set_passes_through_without_error() {
        let record = json!({"verb": "create"});
        let input = EvaluationInput {
            record_json: &record,
            actor_json: &json!(null),
            actor: ActorRef::default(),
            tenant: tenant(),
            origin: OriginRef {
                origin_type: OriginType::Audit,
                id: "a1".into(),
            },
            resource: ResourceRef::default(),
            change_source: ChangeSource::Human,
        };
        let outcome = evaluate(RuleKind::Audit, &[], &input, 1).unwrap();
        assert!(outcome.activity.is_none());
        assert!(outcome.match_errors.is_empty());
    }

    #[test]
    fn classify_actor_system_username() {
        assert_eq!(
            classify_actor(Some("system:node:worker-1"), None),
            ChangeSource::System
        );
    }

    #[test]
    fn classify_actor_human_username() {
        assert_eq!(classify_actor(Some("alice"), None), ChangeSource::Human);
    }

    #[test]
    fn classify_actor_controller_without_user_is_system() {
        assert_eq!(
            classify_actor(None, Some("deployment-controller")),
            ChangeSource::System
        );
    }
}
