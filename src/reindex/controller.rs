//! `ReindexJob` reconcile loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::{ReindexJob, ReindexJobStatus, ReindexPhase};
use crate::policy::PolicyCache;
use crate::query::time::{resolve_window, Surface, TimeParseError};
use crate::query::ClickHouseConfig;
use crate::reindex::worker::{run_worker, WorkerError, WorkerParams};

/// Re-index jobs may only reach back this far from job creation,
/// regardless of how narrow the requested `(startTime, endTime)` window is.
const RETENTION_WINDOW_DAYS: i64 = 60;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("invalid time range: {0}")]
    Time(#[from] TimeParseError),
    #[error("startTime {start} exceeds the {RETENTION_WINDOW_DAYS}-day retention window")]
    RetentionExceeded { start: String },
}

pub struct ReconcileContext {
    pub client: Client,
    pub cache: Arc<PolicyCache>,
    pub clickhouse: ClickHouseConfig,
    pub bus_url: String,
}

/// Spec is immutable once the worker has started; mutation attempts after
/// `Phase != Pending` are rejected at the API layer with 409 Conflict — see
/// `api::ephemeral` validation for the mirrored rule on the ephemeral kinds.
/// Here the controller only guards against double-starting the worker for
/// the same generation.
async fn reconcile(job: Arc<ReindexJob>, ctx: Arc<ReconcileContext>) -> Result<Action, ReconcileError> {
    let name = job.name_any();
    let phase = job.status.as_ref().map(|s| s.phase).unwrap_or_default();

    if phase != ReindexPhase::Pending {
        if phase == ReindexPhase::Succeeded || phase == ReindexPhase::Failed {
            if let Some(ttl) = job.spec.config.ttl_seconds_after_finished {
                return Ok(Action::requeue(Duration::from_secs(ttl as u64)));
            }
        }
        return Ok(Action::await_change());
    }

    let reference = Utc::now();
    let end_expr = job.spec.end_time.clone().unwrap_or_else(|| "now".to_string());
    let window = resolve_window(&job.spec.start_time, Some(&end_expr), Surface::Activity, reference)?;
    if reference - window.start > chrono::Duration::days(RETENTION_WINDOW_DAYS) {
        return Err(ReconcileError::RetentionExceeded {
            start: window.start.to_rfc3339(),
        });
    }

    patch_status(
        &ctx.client,
        &name,
        ReindexJobStatus {
            phase: ReindexPhase::Running,
            ..Default::default()
        },
    )
    .await;

    let params = WorkerParams {
        job_name: name.clone(),
        window,
        policy_names: job.spec.policy_names.clone(),
        config: job.spec.config.clone(),
        cache: ctx.cache.clone(),
        clickhouse: ctx.clickhouse.clone(),
        bus_url: ctx.bus_url.clone(),
    };

    let client = ctx.client.clone();
    let job_name = name.clone();
    tokio::spawn(async move {
        let outcome = run_worker(params, CancellationToken::new()).await;
        let status = match outcome {
            Ok(progress) => ReindexJobStatus {
                phase: ReindexPhase::Succeeded,
                progress,
                message: None,
            },
            Err(WorkerError::Cancelled) => ReindexJobStatus {
                phase: ReindexPhase::Failed,
                message: Some("Cancelled".to_string()),
                ..Default::default()
            },
            Err(e) => ReindexJobStatus {
                phase: ReindexPhase::Failed,
                message: Some(e.to_string()),
                ..Default::default()
            },
        };
        patch_status(&client, &job_name, status).await;
    });

    Ok(Action::requeue(Duration::from_secs(5)))
}

async fn patch_status(client: &Client, name: &str, status: ReindexJobStatus) {
    let api: Api<ReindexJob> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });
    if let Err(e) = api
        .patch_status(
            name,
            &kube::api::PatchParams::apply("activity-pipeline-reindex-controller"),
            &kube::api::Patch::Merge(&patch),
        )
        .await
    {
        warn!(job = %name, error = %e, "failed to patch reindex job status");
    }
}

fn on_error(_job: Arc<ReindexJob>, _err: &ReconcileError, _ctx: Arc<ReconcileContext>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

pub async fn run_controller(ctx: ReconcileContext) {
    let api: Api<ReindexJob> = Api::all(ctx.client.clone());
    let ctx = Arc::new(ctx);

    Controller::new(api, watcher::Config::default())
        .run(reconcile, on_error, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "reindex job reconcile failed");
            } else {
                info!("reindex job reconciled");
            }
        })
        .await;
}
