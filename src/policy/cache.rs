//! Concurrent-readable snapshot cache of compiled, Ready policies, grouped
//! by target kind.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{info, warn};

use crate::crd::{EvaluationStats, Policy, PolicyRule};
use crate::policy::expr::{self, CompiledMatch, CompiledTemplate, CompileError, RuleKind};

#[derive(Debug, Error)]
pub enum CompileFailure {
    #[error("rule {rule_index} failed to compile: {source}")]
    Rule {
        rule_index: usize,
        #[source]
        source: CompileError,
    },
}

/// One compiled rule: its match expression and summary template.
#[derive(Clone)]
pub struct CompiledRule {
    pub matcher: CompiledMatch,
    pub template: CompiledTemplate,
}

pub fn compile_rule(rule: &PolicyRule, kind: RuleKind) -> Result<CompiledRule, CompileError> {
    Ok(CompiledRule {
        matcher: expr::compile_match(&rule.match_expr, kind)?,
        template: expr::compile_template(&rule.summary, kind)?,
    })
}

fn compile_rules(rules: &[PolicyRule], kind: RuleKind) -> Result<Vec<CompiledRule>, CompileFailure> {
    rules
        .iter()
        .enumerate()
        .map(|(rule_index, r)| {
            compile_rule(r, kind).map_err(|source| CompileFailure::Rule { rule_index, source })
        })
        .collect()
}

/// The compiled artifact for one `(apiGroup, kind)` target, plus the source
/// policy's identity.
#[derive(Clone)]
pub struct TargetRules {
    pub policy_name: String,
    pub generation: i64,
    pub audit_rules: Vec<CompiledRule>,
    pub event_rules: Vec<CompiledRule>,
}

type Key = (String, String);

#[derive(Default, Clone)]
struct Snapshot {
    targets: HashMap<Key, TargetRules>,
}

/// Snapshot-replace cache: writers build a new snapshot and atomically swap
/// a pointer; readers hold the pointer they acquired for the entire
/// evaluation, so a concurrent reload never tears a batch.
pub struct PolicyCache {
    snapshot: RwLock<Arc<Snapshot>>,
    /// Per-policy rolling evaluation stats, keyed by policy name. Kept
    /// separate from `snapshot` since it updates on every evaluation, not
    /// just on reload.
    stats: RwLock<HashMap<String, EvaluationStats>>,
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            stats: RwLock::new(HashMap::new()),
        }
    }
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Get(apiGroup, kind)`: missing kind yields empty slices, not an
    /// error.
    pub fn get(&self, api_group: &str, kind: &str) -> (Vec<CompiledRule>, Vec<CompiledRule>) {
        let snapshot = self.snapshot.read().unwrap().clone();
        match snapshot.targets.get(&(api_group.to_string(), kind.to_string())) {
            Some(target) => (target.audit_rules.clone(), target.event_rules.clone()),
            None => (Vec::new(), Vec::new()),
        }
    }

    pub fn target_meta(&self, api_group: &str, kind: &str) -> Option<(String, i64)> {
        let snapshot = self.snapshot.read().unwrap().clone();
        snapshot
            .targets
            .get(&(api_group.to_string(), kind.to_string()))
            .map(|t| (t.policy_name.clone(), t.generation))
    }

    /// Recompile one policy and fold it into a freshly cloned snapshot, then
    /// swap the pointer. Returns the compile outcome so the caller can patch
    /// `.status`.
    ///
    /// First-registered wins on a `(apiGroup, kind)` collision between two
    /// policies — the existing target entry is left
    /// untouched and the caller is told to set a warning condition.
    pub fn apply(&self, name: &str, generation: i64, spec: &crate::crd::PolicySpec) -> ApplyResult {
        let audit_rules = match compile_rules(&spec.audit_rules, RuleKind::Audit) {
            Ok(r) => r,
            Err(e) => return ApplyResult::CompileFailed(e.to_string()),
        };
        let event_rules = match compile_rules(&spec.event_rules, RuleKind::Event) {
            Ok(r) => r,
            Err(e) => return ApplyResult::CompileFailed(e.to_string()),
        };

        let key = spec.target();
        let mut current = (*self.snapshot.read().unwrap()).clone();
        if let Some(existing) = current.targets.get(&key) {
            if existing.policy_name != name {
                return ApplyResult::Collision {
                    holder: existing.policy_name.clone(),
                };
            }
        }
        current.targets.insert(
            key,
            TargetRules {
                policy_name: name.to_string(),
                generation,
                audit_rules,
                event_rules,
            },
        );
        *self.snapshot.write().unwrap() = Arc::new(current);
        ApplyResult::Ready
    }

    /// Evict a policy's target on deletion.
    pub fn evict(&self, api_group: &str, kind: &str, name: &str) {
        let mut current = (*self.snapshot.read().unwrap()).clone();
        let key = (api_group.to_string(), kind.to_string());
        if current.targets.get(&key).map(|t| t.policy_name.as_str()) == Some(name) {
            current.targets.remove(&key);
            *self.snapshot.write().unwrap() = Arc::new(current);
            self.stats.write().unwrap().remove(name);
        }
    }

    /// Fold a successful rule-match evaluation into the rolling window for
    /// the policy currently targeting `(api_group, kind)`.
    pub fn record_success(&self, api_group: &str, kind: &str) {
        let Some((name, _)) = self.target_meta(api_group, kind) else { return };
        let mut stats = self.stats.write().unwrap();
        let entry = stats.entry(name).or_default();
        entry.success_count += 1;
        if entry.window_start.is_none() {
            entry.window_start = Some(chrono::Utc::now().to_rfc3339());
        }
    }

    /// Fold a rule match-expression runtime error into the rolling window
    /// for the policy currently targeting `(api_group, kind)`.
    pub fn record_error(&self, api_group: &str, kind: &str, rule_index: usize, message: String) {
        let Some((name, _)) = self.target_meta(api_group, kind) else { return };
        let mut stats = self.stats.write().unwrap();
        let entry = stats.entry(name).or_default();
        entry.error_count += 1;
        entry.last_error = Some(message);
        entry.last_error_rule_index = Some(rule_index as u32);
        entry.last_error_timestamp = Some(chrono::Utc::now().to_rfc3339());
        if entry.window_start.is_none() {
            entry.window_start = Some(chrono::Utc::now().to_rfc3339());
        }
    }

    pub fn stats(&self, name: &str) -> Option<EvaluationStats> {
        self.stats.read().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub enum ApplyResult {
    Ready,
    CompileFailed(String),
    Collision { holder: String },
}

/* ============================= RECONCILE CONTROLLER ============================= */

struct ReconcileContext {
    client: Client,
    cache: Arc<PolicyCache>,
}

#[derive(Debug, Error)]
enum ReconcileError {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),
}

async fn reconcile(policy: Arc<Policy>, ctx: Arc<ReconcileContext>) -> Result<Action, ReconcileError> {
    let name = policy.name_any();
    let generation = policy.metadata.generation.unwrap_or(0);
    let result = ctx.cache.apply(&name, generation, &policy.spec);

    match &result {
        ApplyResult::Ready => info!(policy = %name, generation, "policy compiled and ready"),
        ApplyResult::CompileFailed(msg) => warn!(policy = %name, error = %msg, "policy failed to compile"),
        ApplyResult::Collision { holder } => {
            warn!(policy = %name, holder, "policy target already claimed by another policy")
        }
    }

    let status = build_status(generation, &result, ctx.cache.stats(&name));
    let api: Api<Policy> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({ "status": status });
    let _ = api
        .patch_status(
            &name,
            &kube::api::PatchParams::apply("activity-pipeline-policy-controller"),
            &kube::api::Patch::Merge(&patch),
        )
        .await;

    // At most one recompile per 1s per policy; requeue imposes the floor on
    // accidental tight loops.
    Ok(Action::requeue(Duration::from_secs(1)))
}

fn build_status(
    generation: i64,
    result: &ApplyResult,
    stats: Option<EvaluationStats>,
) -> crate::crd::PolicyStatus {
    let (status, reason, message) = match result {
        ApplyResult::Ready => ("True", "CompileSucceeded", "all rules compiled".to_string()),
        ApplyResult::CompileFailed(msg) => ("False", "CompileFailed", msg.clone()),
        ApplyResult::Collision { holder } => (
            "False",
            "TargetClaimed",
            format!("target already claimed by policy '{holder}'"),
        ),
    };
    crate::crd::PolicyStatus {
        observed_generation: matches!(result, ApplyResult::Ready).then_some(generation),
        conditions: vec![crate::crd::Condition {
            condition_type: "Ready".to_string(),
            status: match status {
                "True" => crate::crd::ConditionStatus::True,
                _ => crate::crd::ConditionStatus::False,
            },
            reason: reason.to_string(),
            message,
            last_transition_time: chrono::Utc::now().to_rfc3339(),
        }],
        stats,
    }
}

fn on_error(_policy: Arc<Policy>, _err: &ReconcileError, _ctx: Arc<ReconcileContext>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Run the `Policy` CRD reconcile loop, keeping `cache` up to date forever.
/// Returns when the controller stream ends (normally only on
/// cancellation).
pub async fn run_controller(client: Client, cache: Arc<PolicyCache>) {
    let api: Api<Policy> = Api::all(client.clone());
    let ctx = Arc::new(ReconcileContext { client, cache });

    Controller::new(api, watcher::Config::default())
        .run(reconcile, on_error, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "policy reconcile failed");
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PolicySpec;

    fn spec(api_group: &str, kind: &str, rule_match: &str, rule_summary: &str) -> PolicySpec {
        PolicySpec {
            target_api_group: api_group.into(),
            target_kind: kind.into(),
            audit_rules: vec![PolicyRule {
                match_expr: rule_match.into(),
                summary: rule_summary.into(),
            }],
            event_rules: vec![],
        }
    }

    #[test]
    fn missing_kind_yields_empty_not_error() {
        let cache = PolicyCache::new();
        let (audit, event) = cache.get("apps", "Deployment");
        assert!(audit.is_empty());
        assert!(event.is_empty());
    }

    #[test]
    fn apply_then_get_returns_compiled_rules() {
        let cache = PolicyCache::new();
        let s = spec("apps", "Deployment", "true", "x");
        assert!(matches!(cache.apply("p1", 1, &s), ApplyResult::Ready));
        let (audit, _) = cache.get("apps", "Deployment");
        assert_eq!(audit.len(), 1);
        assert_eq!(cache.target_meta("apps", "Deployment"), Some(("p1".into(), 1)));
    }

    #[test]
    fn first_registered_wins_on_collision() {
        let cache = PolicyCache::new();
        let s1 = spec("apps", "Deployment", "true", "x");
        let s2 = spec("apps", "Deployment", "true", "y");
        assert!(matches!(cache.apply("p1", 1, &s1), ApplyResult::Ready));
        match cache.apply("p2", 1, &s2) {
            ApplyResult::Collision { holder } => assert_eq!(holder, "p1"),
            _ => panic!("expected collision"),
        }
        // p1's rules remain untouched
        let (audit, _) = cache.get("apps", "Deployment");
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn compile_failure_does_not_affect_other_policies() {
        let cache = PolicyCache::new();
        let good = spec("apps", "Deployment", "true", "ok");
        let bad = spec("apps", "StatefulSet", "bogus.field == 1", "x");
        assert!(matches!(cache.apply("good", 1, &good), ApplyResult::Ready));
        assert!(matches!(cache.apply("bad", 1, &bad), ApplyResult::CompileFailed(_)));
        let (audit, _) = cache.get("apps", "Deployment");
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn evict_removes_target_only_if_owned_by_name() {
        let cache = PolicyCache::new();
        let s = spec("apps", "Deployment", "true", "x");
        cache.apply("p1", 1, &s);
        cache.evict("apps", "Deployment", "someone-else");
        assert_eq!(cache.len(), 1);
        cache.evict("apps", "Deployment", "p1");
        assert_eq!(cache.len(), 0);
    }
}
