//! Ephemeral REST harness: one POST handler per query/preview kind, an axum
//! router plus shared state and Prometheus counters serving `create`-only
//! ephemeral resources.

use std::sync::{Arc, LazyLock};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::info;

use crate::api::ephemeral::*;
use crate::api::scope_extract::extract_scope;
use crate::error::AppError;
use crate::policy::{self, PolicyCache};
use crate::query::builder::{apply_bounds, build_facet_query, build_record_query, SurfaceSpec};
use crate::query::cursor::{self, Cursor};
use crate::query::filter::{self, FieldSchema, FieldType};
use crate::query::scope::scope_predicate;
use crate::query::time::{resolve_window, Surface};
use crate::query::{run_facets_bounded, QueryClient};

static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "activity_pipeline_api_requests_total",
        "Ephemeral query/preview requests handled, by kind and outcome",
        &["kind", "outcome"]
    )
    .expect("metric registration")
});

#[derive(Clone)]
pub struct ApiState {
    pub clickhouse: Arc<QueryClient>,
    pub policy_cache: Arc<PolicyCache>,
    pub max_page_size: u32,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/apis/activity.miloapis.com/v1alpha1/auditlogqueries", post(audit_log_query))
        .route("/apis/activity.miloapis.com/v1alpha1/eventqueries", post(event_query))
        .route("/apis/activity.miloapis.com/v1alpha1/activityqueries", post(activity_query))
        .route(
            "/apis/activity.miloapis.com/v1alpha1/auditlogfacetsqueries",
            post(audit_log_facets_query),
        )
        .route(
            "/apis/activity.miloapis.com/v1alpha1/activityfacetqueries",
            post(activity_facet_query),
        )
        .route(
            "/apis/activity.miloapis.com/v1alpha1/eventfacetqueries",
            post(event_facet_query),
        )
        .route("/apis/activity.miloapis.com/v1alpha1/policypreviews", post(policy_preview))
        .with_state(state)
}

fn audit_schema() -> FieldSchema {
    let mut m = FieldSchema::new();
    m.insert("verb", FieldType::String);
    m.insert("responseStatusCode", FieldType::String);
    m
}

fn event_schema() -> FieldSchema {
    let mut m = FieldSchema::new();
    m.insert("reason", FieldType::String);
    m.insert("type", FieldType::String);
    m
}

fn activity_schema() -> FieldSchema {
    let mut m = FieldSchema::new();
    m.insert("summary", FieldType::String);
    m.insert("changeSource", FieldType::String);
    m
}

/// The `limit` field applied to all three surfaces: `0` means "use the
/// default", anything above `max_page_size` is a validation error, never a
/// silent clamp.
fn resolve_limit(requested: u32, max_page_size: u32) -> Result<u32, AppError> {
    const DEFAULT_PAGE_SIZE: u32 = 100;
    let effective = if requested == 0 { DEFAULT_PAGE_SIZE } else { requested };
    if effective > max_page_size {
        return Err(AppError::invalid(
            "spec.limit",
            format!("limit {effective} exceeds the configured maximum of {max_page_size}"),
        ));
    }
    Ok(effective)
}

struct ResolvedCommon {
    window: crate::query::time::EffectiveWindow,
    filter_expr: Option<filter::FilterExpr>,
    cursor: Option<Cursor>,
    fingerprint: String,
}

/// Resolve window + filter + cursor for one request; shared across every
/// record-returning handler.
fn resolve_common(common: &QuerySpecCommon, surface: Surface, schema: &FieldSchema) -> Result<ResolvedCommon, AppError> {
    let reference = chrono::Utc::now();
    let window = resolve_window(&common.start_time, common.end_time.as_deref(), surface, reference)
        .map_err(|e| AppError::invalid("spec.startTime", e.to_string()))?;

    let filter_expr = match &common.filter {
        Some(src) => Some(
            filter::parse(src, schema).map_err(|e| AppError::invalid("spec.filter", e.to_string()))?,
        ),
        None => None,
    };

    let fingerprint = format!("{}|{}|{:?}", common.start_time, common.end_time.as_deref().unwrap_or(""), common.filter);
    let cursor = match &common.r#continue {
        Some(token) => Some(
            cursor::decode(token, &fingerprint).map_err(|e| AppError::invalid("spec.continue", e.to_string()))?,
        ),
        None => None,
    };

    Ok(ResolvedCommon { window, filter_expr, cursor, fingerprint })
}

async fn audit_log_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(spec): Json<AuditLogQuerySpec>,
) -> Result<Json<serde_json::Value>, AppError> {
    REQUESTS_TOTAL.with_label_values(&["AuditLogQuery", "received"]).inc();
    let tenant = extract_scope(&headers);
    let resolved = resolve_common(&spec.common, Surface::Audit, &audit_schema())?;
    let scope_pred = scope_predicate(&tenant);
    let surface = SurfaceSpec {
        table: "audit_log",
        timestamp_col: "timestamp",
        tiebreak_col: "audit_id",
    };
    let limit = resolve_limit(spec.common.limit, state.max_page_size)?;
    let q = build_record_query(
        &surface,
        &scope_pred,
        &resolved.window,
        resolved.filter_expr.as_ref(),
        resolved.cursor.as_ref(),
        limit,
    );
    let query = apply_bounds(state.clickhouse.inner().query(&q.sql), &q.params);
    let items: Vec<crate::types::AuditRecord> = query
        .fetch_all()
        .await
        .map_err(|e| crate::error::service_unavailable("audit-log-query", e))?;

    let r#continue = (items.len() as u32 == limit)
        .then(|| items.last())
        .flatten()
        .map(|last| {
            cursor::encode(
                &resolved.fingerprint,
                &Cursor { timestamp: last.request_received_timestamp, tie_breaker: last.audit_id.clone() },
            )
        });

    let status = AuditLogQueryStatus {
        common: QueryStatusCommon {
            effective_start_time: resolved.window.start.to_rfc3339(),
            effective_end_time: resolved.window.end.to_rfc3339(),
            r#continue,
            errors: Vec::new(),
        },
        items,
    };
    REQUESTS_TOTAL.with_label_values(&["AuditLogQuery", "ok"]).inc();
    Ok(Json(serde_json::json!({ "spec": spec, "status": status })))
}

async fn event_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(spec): Json<EventQuerySpecExt>,
) -> Result<Json<serde_json::Value>, AppError> {
    REQUESTS_TOTAL.with_label_values(&["EventQuery", "received"]).inc();
    let tenant = extract_scope(&headers);
    let resolved = resolve_common(&spec.base.common, Surface::Event, &event_schema())?;

    if let Some(selector) = &spec.field_selector {
        crate::watch::parse_field_selector(selector)
            .map_err(|e| AppError::invalid("spec.fieldSelector", e.to_string()))?;
    }

    let scope_pred = scope_predicate(&tenant);
    let surface = SurfaceSpec {
        table: "cluster_events",
        timestamp_col: "event_time",
        tiebreak_col: "uid",
    };
    let limit = resolve_limit(spec.base.common.limit, state.max_page_size)?;
    let q = build_record_query(
        &surface,
        &scope_pred,
        &resolved.window,
        resolved.filter_expr.as_ref(),
        resolved.cursor.as_ref(),
        limit,
    );
    let query = apply_bounds(state.clickhouse.inner().query(&q.sql), &q.params);
    let items: Vec<crate::types::ClusterEventRecord> = query
        .fetch_all()
        .await
        .map_err(|e| crate::error::service_unavailable("event-query", e))?;

    let r#continue = (items.len() as u32 == limit)
        .then(|| items.last())
        .flatten()
        .map(|last| {
            cursor::encode(&resolved.fingerprint, &Cursor { timestamp: last.event_time, tie_breaker: last.uid.clone() })
        });

    let status = EventQueryStatus {
        common: QueryStatusCommon {
            effective_start_time: resolved.window.start.to_rfc3339(),
            effective_end_time: resolved.window.end.to_rfc3339(),
            r#continue,
            errors: Vec::new(),
        },
        items,
    };
    REQUESTS_TOTAL.with_label_values(&["EventQuery", "ok"]).inc();
    Ok(Json(serde_json::json!({ "spec": spec, "status": status })))
}

async fn activity_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(spec): Json<ActivityQuerySpec>,
) -> Result<Json<serde_json::Value>, AppError> {
    REQUESTS_TOTAL.with_label_values(&["ActivityQuery", "received"]).inc();
    let tenant = extract_scope(&headers);
    let resolved = resolve_common(&spec.common, Surface::Activity, &activity_schema())?;
    let scope_pred = scope_predicate(&tenant);
    let surface = SurfaceSpec {
        table: "activities",
        timestamp_col: "timestamp",
        tiebreak_col: "origin_id",
    };
    let limit = resolve_limit(spec.common.limit, state.max_page_size)?;
    let q = build_record_query(
        &surface,
        &scope_pred,
        &resolved.window,
        resolved.filter_expr.as_ref(),
        resolved.cursor.as_ref(),
        limit,
    );
    let query = apply_bounds(state.clickhouse.inner().query(&q.sql), &q.params);
    let items: Vec<crate::types::ActivityRecord> = query
        .fetch_all()
        .await
        .map_err(|e| crate::error::service_unavailable("activity-query", e))?;

    let r#continue = (items.len() as u32 == limit)
        .then(|| items.last())
        .flatten()
        .map(|last| {
            cursor::encode(
                &resolved.fingerprint,
                &Cursor { timestamp: last.creation_timestamp, tie_breaker: last.origin.id.clone() },
            )
        });

    let status = ActivityQueryStatus {
        common: QueryStatusCommon {
            effective_start_time: resolved.window.start.to_rfc3339(),
            effective_end_time: resolved.window.end.to_rfc3339(),
            r#continue,
            errors: Vec::new(),
        },
        items,
    };
    REQUESTS_TOTAL.with_label_values(&["ActivityQuery", "ok"]).inc();
    Ok(Json(serde_json::json!({ "spec": spec, "status": status })))
}

const MAX_FACET_LIMIT_DEFAULT: u32 = 100;
const MAX_FACET_LIMIT_AUDIT: u32 = 500;

async fn run_facet_surface(
    state: &ApiState,
    common: &QuerySpecCommon,
    facets: &[FacetRequest],
    surface: Surface,
    table: &str,
    timestamp_col: &str,
    tenant: &crate::types::TenantRef,
    schema: &FieldSchema,
    max_facet_limit: u32,
) -> Result<(crate::query::time::EffectiveWindow, Vec<FacetResult>), AppError> {
    if facets.len() > crate::query::MAX_FACETS_PER_REQUEST {
        return Err(AppError::invalid("spec.facets", "at most 10 facets per request"));
    }
    let resolved = resolve_common(common, surface, schema)?;
    let window = resolved.window;
    let filter_expr = resolved.filter_expr;
    let scope_pred = scope_predicate(tenant);

    let names: Vec<String> = facets.iter().map(|f| f.field.clone()).collect();
    let facets_by_name: std::collections::HashMap<String, FacetRequest> =
        facets.iter().map(|f| (f.field.clone(), f.clone())).collect();

    let window_owned = window.clone();
    let filter_owned = filter_expr.clone();
    let client = state.clickhouse.clone();
    let table = table.to_string();
    let timestamp_col = timestamp_col.to_string();

    let results = run_facets_bounded(&names, move |name| {
        let facet = facets_by_name.get(&name).cloned().unwrap_or_default();
        let limit = facet.limit.unwrap_or(20).min(max_facet_limit);
        let q = build_facet_query(
            &table,
            &name,
            &scope_pred,
            &timestamp_col,
            &window_owned,
            filter_owned.as_ref(),
            limit,
        );
        let client = client.clone();
        async move {
            let query = apply_bounds(client.inner().query(&q.sql), &q.params);
            let rows: Vec<crate::query::builder::FacetRow> = query
                .fetch_all()
                .await
                .map_err(|e| crate::query::QueryError::Backend(e.to_string()))?;
            Ok(FacetResult {
                field: name,
                values: rows
                    .into_iter()
                    .map(|r| FacetValue { value: r.value, count: r.cnt })
                    .collect(),
            })
        }
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "facet query failed");
        AppError::ServiceUnavailable
    })?;

    Ok((window, results))
}

async fn audit_log_facets_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(spec): Json<AuditLogFacetsQuerySpec>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = extract_scope(&headers);
    let (window, results) = run_facet_surface(
        &state,
        &spec.common,
        &spec.facets,
        Surface::Audit,
        "audit_log",
        "timestamp",
        &tenant,
        &audit_schema(),
        MAX_FACET_LIMIT_AUDIT,
    )
    .await?;
    let status = AuditLogFacetsQueryStatus {
        common: QueryStatusCommon {
            effective_start_time: window.start.to_rfc3339(),
            effective_end_time: window.end.to_rfc3339(),
            r#continue: None,
            errors: Vec::new(),
        },
        results,
    };
    Ok(Json(serde_json::json!({ "spec": spec, "status": status })))
}

async fn activity_facet_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(spec): Json<ActivityFacetQuerySpec>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = extract_scope(&headers);
    let (window, results) = run_facet_surface(
        &state,
        &spec.common,
        &spec.facets,
        Surface::Activity,
        "activities",
        "timestamp",
        &tenant,
        &activity_schema(),
        MAX_FACET_LIMIT_DEFAULT,
    )
    .await?;
    let status = ActivityFacetQueryStatus {
        common: QueryStatusCommon {
            effective_start_time: window.start.to_rfc3339(),
            effective_end_time: window.end.to_rfc3339(),
            r#continue: None,
            errors: Vec::new(),
        },
        results,
    };
    Ok(Json(serde_json::json!({ "spec": spec, "status": status })))
}

async fn event_facet_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(spec): Json<EventFacetQuerySpec>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = extract_scope(&headers);
    let (window, results) = run_facet_surface(
        &state,
        &spec.common,
        &spec.facets,
        Surface::Event,
        "cluster_events",
        "event_time",
        &tenant,
        &event_schema(),
        MAX_FACET_LIMIT_DEFAULT,
    )
    .await?;
    let status = EventFacetQueryStatus {
        common: QueryStatusCommon {
            effective_start_time: window.start.to_rfc3339(),
            effective_end_time: window.end.to_rfc3339(),
            r#continue: None,
            errors: Vec::new(),
        },
        results,
    };
    Ok(Json(serde_json::json!({ "spec": spec, "status": status })))
}

async fn policy_preview(
    Json(spec): Json<PolicyPreviewSpec>,
) -> Result<Json<serde_json::Value>, AppError> {
    let samples: Vec<(serde_json::Value, serde_json::Value)> =
        spec.samples.iter().map(|s| (s.record.clone(), s.actor.clone())).collect();
    let results = policy::preview(spec.kind, &spec.rules, &samples);
    info!(rule_count = spec.rules.len(), "policy preview evaluated");
    let status = PolicyPreviewStatus { results };
    Ok(Json(serde_json::json!({ "spec": spec, "status": status })))
}
