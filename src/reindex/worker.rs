//! Re-index worker pipeline.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus;
use crate::crd::{ReindexConfig, ReindexProgress};
use crate::policy::{self, EvaluationInput, PolicyCache, RuleKind};
use crate::processor::actor::{audit_evaluation_parts, event_evaluation_parts};
use crate::query::builder::{apply_bounds, build_record_query, SurfaceSpec};
use crate::query::cursor::Cursor;
use crate::query::scope::scope_predicate;
use crate::query::time::EffectiveWindow;
use crate::query::ClickHouseConfig;
use crate::types::{AuditRecord, ClusterEventRecord, ScopeType, TenantRef};

const DEFAULT_BATCH_SIZE: u32 = 500;
const DEFAULT_RATE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cancelled")]
    Cancelled,
    #[error("bus disconnected: {0}")]
    BusDisconnected(String),
    #[error("backend exhausted retry budget: {0}")]
    BackendExhausted(String),
}

pub struct WorkerParams {
    pub job_name: String,
    pub window: EffectiveWindow,
    pub policy_names: Option<Vec<String>>,
    pub config: ReindexConfig,
    pub cache: Arc<PolicyCache>,
    pub clickhouse: ClickHouseConfig,
    pub bus_url: String,
}

/// Paginate the source table ascending, re-evaluate each batch against the
/// current policy snapshot, rate-limit emission, and track progress. Returns
/// the final progress on success.
pub async fn run_worker(params: WorkerParams, cancel: CancellationToken) -> Result<ReindexProgress, WorkerError> {
    let client = crate::query::QueryClient::connect(&params.clickhouse);
    let nats = bus::connect(&params.bus_url)
        .await
        .map_err(|e| WorkerError::BusDisconnected(e.to_string()))?;
    let jetstream = async_nats::jetstream::new(nats);

    let batch_size = params.config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
    let rate = params.config.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT).max(1);
    let limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(rate).unwrap()));

    let mut progress = ReindexProgress {
        start_time: Some(chrono::Utc::now().to_rfc3339()),
        ..Default::default()
    };

    progress = process_audit(&params, &client, &jetstream, &limiter, batch_size, &cancel, progress).await?;
    progress = process_events(&params, &client, &jetstream, &limiter, batch_size, &cancel, progress).await?;

    Ok(progress)
}

async fn process_audit(
    params: &WorkerParams,
    client: &crate::query::QueryClient,
    jetstream: &async_nats::jetstream::Context,
    limiter: &RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    batch_size: u32,
    cancel: &CancellationToken,
    mut progress: ReindexProgress,
) -> Result<ReindexProgress, WorkerError> {
    let surface = SurfaceSpec {
        table: "audit_log",
        timestamp_col: "timestamp",
        tiebreak_col: "audit_id",
    };
    let scope = scope_predicate(&TenantRef {
        scope_type: ScopeType::Platform,
        name: String::new(),
    });

    let mut cursor: Option<Cursor> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let q = build_record_query(&surface, &scope, &params.window, None, cursor.as_ref(), batch_size.min(1000));
        let query = client.inner().query(&q.sql);
        let query = apply_bounds(query, &q.params);
        let rows: Vec<AuditRecord> = query
            .fetch_all()
            .await
            .map_err(|e| WorkerError::BackendExhausted(e.to_string()))?;

        if rows.is_empty() {
            break;
        }

        progress.total_batches += 1;
        progress.current_batch = progress.total_batches;

        for record in &rows {
            progress.total_events += 1;
            match evaluate_and_publish_audit(params, jetstream, record).await {
                Ok(true) => progress.activities_generated += 1,
                Ok(false) => {}
                Err(_) => progress.errors += 1,
            }
            progress.processed_events += 1;
            if !params.config.dry_run {
                limiter.until_ready().await;
            }
        }

        let last = rows.last().unwrap();
        cursor = Some(Cursor {
            timestamp: last.request_received_timestamp,
            tie_breaker: last.audit_id.clone(),
        });
        progress.last_batch_at = Some(chrono::Utc::now().to_rfc3339());

        if (rows.len() as u32) < batch_size {
            break;
        }
    }

    Ok(progress)
}

async fn process_events(
    params: &WorkerParams,
    client: &crate::query::QueryClient,
    jetstream: &async_nats::jetstream::Context,
    limiter: &RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    batch_size: u32,
    cancel: &CancellationToken,
    mut progress: ReindexProgress,
) -> Result<ReindexProgress, WorkerError> {
    let surface = SurfaceSpec {
        table: "cluster_events",
        timestamp_col: "event_time",
        tiebreak_col: "uid",
    };
    let scope = scope_predicate(&TenantRef {
        scope_type: ScopeType::Platform,
        name: String::new(),
    });

    let mut cursor: Option<Cursor> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let q = build_record_query(&surface, &scope, &params.window, None, cursor.as_ref(), batch_size.min(1000));
        let query = client.inner().query(&q.sql);
        let query = apply_bounds(query, &q.params);
        let rows: Vec<ClusterEventRecord> = query
            .fetch_all()
            .await
            .map_err(|e| WorkerError::BackendExhausted(e.to_string()))?;

        if rows.is_empty() {
            break;
        }

        progress.total_batches += 1;
        progress.current_batch = progress.total_batches;

        for record in &rows {
            progress.total_events += 1;
            match evaluate_and_publish_event(params, jetstream, record).await {
                Ok(true) => progress.activities_generated += 1,
                Ok(false) => {}
                Err(_) => progress.errors += 1,
            }
            progress.processed_events += 1;
            if !params.config.dry_run {
                limiter.until_ready().await;
            }
        }

        let last = rows.last().unwrap();
        cursor = Some(Cursor {
            timestamp: last.event_time,
            tie_breaker: last.uid.clone(),
        });
        progress.last_batch_at = Some(chrono::Utc::now().to_rfc3339());

        if (rows.len() as u32) < batch_size {
            break;
        }
    }

    Ok(progress)
}

async fn evaluate_and_publish_audit(
    params: &WorkerParams,
    jetstream: &async_nats::jetstream::Context,
    record: &AuditRecord,
) -> Result<bool, String> {
    let (rules, _) = params
        .cache
        .get(record.object_ref.api_group.as_deref().unwrap_or(""), &record.object_ref.resource);
    let rules = filter_by_policy_names(rules, &params.policy_names, &params.cache, record.object_ref.api_group.as_deref().unwrap_or(""), &record.object_ref.resource);
    let (actor, resource, origin, change_source, record_json, actor_json) = audit_evaluation_parts(record);
    let input = EvaluationInput {
        record_json: &record_json,
        actor_json: &actor_json,
        actor,
        tenant: record.tenant.clone(),
        origin,
        resource,
        change_source,
    };
    let outcome = policy::evaluate(RuleKind::Audit, &rules, &input, reindex_version()).map_err(|e| e.to_string())?;
    record_outcome_stats(
        &params.cache,
        record.object_ref.api_group.as_deref().unwrap_or(""),
        &record.object_ref.resource,
        &outcome,
    );
    let Some(activity) = outcome.activity else { return Ok(false) };
    if params.config.dry_run {
        return Ok(true);
    }
    publish(jetstream, &record.tenant, &activity).await?;
    Ok(true)
}

async fn evaluate_and_publish_event(
    params: &WorkerParams,
    jetstream: &async_nats::jetstream::Context,
    record: &ClusterEventRecord,
) -> Result<bool, String> {
    let (_, rules) = params
        .cache
        .get(record.regarding.api_version.as_deref().unwrap_or(""), &record.regarding.kind);
    let (actor, resource, origin, change_source, record_json, actor_json) = event_evaluation_parts(record);
    let input = EvaluationInput {
        record_json: &record_json,
        actor_json: &actor_json,
        actor,
        tenant: record.tenant.clone(),
        origin,
        resource,
        change_source,
    };
    let outcome = policy::evaluate(RuleKind::Event, &rules, &input, reindex_version()).map_err(|e| e.to_string())?;
    record_outcome_stats(
        &params.cache,
        record.regarding.api_version.as_deref().unwrap_or(""),
        &record.regarding.kind,
        &outcome,
    );
    let Some(activity) = outcome.activity else { return Ok(false) };
    if params.config.dry_run {
        return Ok(true);
    }
    publish(jetstream, &record.tenant, &activity).await?;
    Ok(true)
}

/// Fold one evaluation's per-rule outcome into the targeted policy's
/// rolling success/error window.
fn record_outcome_stats(cache: &PolicyCache, api_group: &str, kind: &str, outcome: &policy::EvaluationOutcome) {
    if outcome.match_errors.is_empty() {
        cache.record_success(api_group, kind);
    } else {
        for (rule_index, err) in &outcome.match_errors {
            cache.record_error(api_group, kind, *rule_index, err.to_string());
        }
    }
}

fn filter_by_policy_names(
    rules: Vec<policy::CompiledRule>,
    names: &Option<Vec<String>>,
    cache: &PolicyCache,
    api_group: &str,
    kind: &str,
) -> Vec<policy::CompiledRule> {
    match names {
        None => rules,
        Some(allow) => match cache.target_meta(api_group, kind) {
            Some((owner, _)) if allow.contains(&owner) => rules,
            _ => Vec::new(),
        },
    }
}

async fn publish(
    jetstream: &async_nats::jetstream::Context,
    tenant: &TenantRef,
    activity: &crate::types::ActivityRecord,
) -> Result<(), String> {
    let tenant_type = match tenant.scope_type {
        ScopeType::Platform => "platform",
        ScopeType::Organization => "organization",
        ScopeType::Project => "project",
        ScopeType::User => "user",
    };
    let subject = bus::activity_subject(tenant_type, &tenant.name);
    let body = serde_json::to_vec(activity).map_err(|e| e.to_string())?;
    jetstream
        .publish(subject, body.into())
        .await
        .map_err(|e| e.to_string())?
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Re-index always writes with a newer `reindex_version` than 0 (live
/// processor's value) so the replace-on-merge key prefers the re-index
/// output over stale live rows for the same source record.
fn reindex_version() -> i64 {
    chrono::Utc::now().timestamp()
}
