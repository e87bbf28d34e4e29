//! `Policy` and `ReindexJob` custom resources: `#[kube(...)]` derive,
//! camelCase wire format, a `Status` struct updated by a reconciler.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= POLICY RULES ============================= */

/// One `(match, summary)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// Boolean expression compiled against the rule kind's declared
    /// environment (`audit` or `event`, plus a resolved `actor` helper).
    #[serde(rename = "match")]
    pub match_expr: String,
    /// Template string with `{{ expr }}` interpolation points.
    pub summary: String,
}

/* ============================= CONDITIONS ============================= */

/// Standard Kubernetes-style condition carrying a compile-readiness state
/// with the usual `reason`/`lastTransitionTime` shape.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Rolling success/error window for a policy's evaluation stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationStats {
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_rule_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<String>,
}

/* ============================= POLICY CRD ============================= */

/// `Policy` — cluster-wide unique by `.metadata.name`, targets one
/// `(apiGroup, kind)`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "activity.miloapis.com",
    version = "v1alpha1",
    kind = "Policy",
    plural = "policies",
    status = "PolicyStatus",
    cluster
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub target_api_group: String,
    pub target_kind: String,
    #[serde(default)]
    pub audit_rules: Vec<PolicyRule>,
    #[serde(default)]
    pub event_rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<EvaluationStats>,
}

impl PolicySpec {
    pub fn target(&self) -> (String, String) {
        (self.target_api_group.clone(), self.target_kind.clone())
    }
}

/* ============================= REINDEX JOB CRD ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReindexPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReindexConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u32>,
}

/// `ReindexJob` — a persistent resource driving a single batch re-processing
/// run.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "activity.miloapis.com",
    version = "v1alpha1",
    kind = "ReindexJob",
    plural = "reindexjobs",
    status = "ReindexJobStatus",
    cluster
)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJobSpec {
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_names: Option<Vec<String>>,
    #[serde(default)]
    pub config: ReindexConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReindexProgress {
    #[serde(default)]
    pub total_events: u64,
    #[serde(default)]
    pub processed_events: u64,
    #[serde(default)]
    pub activities_generated: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub current_batch: u32,
    #[serde(default)]
    pub total_batches: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_batch_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJobStatus {
    #[serde(default)]
    pub phase: ReindexPhase,
    #[serde(default)]
    pub progress: ReindexProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn policy_crd_is_cluster_scoped() {
        let crd = Policy::crd();
        assert_eq!(crd.spec.group, "activity.miloapis.com");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "Policy");
        assert_eq!(crd.spec.names.plural, "policies");
    }

    #[test]
    fn reindexjob_crd_is_cluster_scoped() {
        let crd = ReindexJob::crd();
        assert_eq!(crd.spec.names.kind, "ReindexJob");
        assert_eq!(crd.spec.scope, "Cluster");
    }

    #[test]
    fn policy_spec_roundtrips() {
        let spec = PolicySpec {
            target_api_group: "apps".into(),
            target_kind: "Deployment".into(),
            audit_rules: vec![PolicyRule {
                match_expr: "audit.verb == 'create'".into(),
                summary: "{{ actor }} created {{ audit.objectRef.name }}".into(),
            }],
            event_rules: vec![],
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: PolicySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target(), ("apps".into(), "Deployment".into()));
        assert_eq!(back.audit_rules.len(), 1);
    }

    #[test]
    fn reindex_config_defaults_are_none_and_not_dry_run() {
        let cfg = ReindexConfig::default();
        assert!(cfg.batch_size.is_none());
        assert!(!cfg.dry_run);
    }

    #[test]
    fn reindex_phase_default_is_pending() {
        assert_eq!(ReindexPhase::default(), ReindexPhase::Pending);
    }

    #[test]
    fn reindex_job_status_json_uses_camel_case() {
        let status = ReindexJobStatus {
            phase: ReindexPhase::Running,
            progress: ReindexProgress {
                total_events: 10,
                processed_events: 3,
                ..Default::default()
            },
            message: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"processedEvents\":3"));
        assert!(!json.contains("message"));
    }
}
