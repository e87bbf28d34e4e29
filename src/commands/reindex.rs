use std::sync::Arc;

use anyhow::Context;
use kube::CustomResourceExt;

use crate::cli::{CrdCommand, ReindexCommand};
use crate::crd::ReindexJob;
use crate::policy::{self, PolicyCache};
use crate::query::ClickHouseConfig;
use crate::reindex::{self, ReconcileContext};

pub async fn run(command: ReindexCommand) -> anyhow::Result<()> {
    match command {
        ReindexCommand::Crd { command } => run_crd(command).await,
        ReindexCommand::Controller { bus, clickhouse } => run_controller(bus, clickhouse).await,
        ReindexCommand::Worker { job, bus, clickhouse, reindex } => {
            run_worker(job, bus, clickhouse, reindex).await
        }
    }
}

async fn run_crd(command: CrdCommand) -> anyhow::Result<()> {
    let crd = ReindexJob::crd();
    let yaml = serde_yaml::to_string(&crd).context("serializing ReindexJob CRD")?;
    match command {
        CrdCommand::Generate => {
            println!("{yaml}");
            Ok(())
        }
        CrdCommand::Install => {
            let client = kube::Client::try_default().await.context("connecting to cluster")?;
            let crds: kube::Api<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition> =
                kube::Api::all(client);
            crds.create(&kube::api::PostParams::default(), &crd).await?;
            Ok(())
        }
    }
}

async fn run_controller(bus: crate::config::BusArgs, clickhouse: crate::config::ClickHouseArgs) -> anyhow::Result<()> {
    let client = kube::Client::try_default().await.context("connecting to cluster")?;
    let cache = Arc::new(PolicyCache::new());
    let policy_task = tokio::spawn(policy::run_controller(client.clone(), cache.clone()));

    let ctx = ReconcileContext {
        client,
        cache,
        clickhouse: ClickHouseConfig::from(&clickhouse),
        bus_url: bus.bus_url,
    };
    reindex::run_controller(ctx).await;
    policy_task.abort();
    Ok(())
}

async fn run_worker(
    job_name: String,
    bus: crate::config::BusArgs,
    clickhouse: crate::config::ClickHouseArgs,
    reindex_args: crate::config::ReindexArgs,
) -> anyhow::Result<()> {
    let client = kube::Client::try_default().await.context("connecting to cluster")?;
    let api: kube::Api<ReindexJob> = kube::Api::all(client.clone());
    let job = api.get(&job_name).await.context("fetching ReindexJob")?;

    let reference = chrono::Utc::now();
    let end_expr = job.spec.end_time.clone().unwrap_or_else(|| "now".to_string());
    let window = crate::query::time::resolve_window(
        &job.spec.start_time,
        Some(&end_expr),
        crate::query::time::Surface::Activity,
        reference,
    )?;

    let mut config = job.spec.config.clone();
    if config.rate_limit.is_none() {
        config.rate_limit = Some(reindex_args.rate_limit);
    }

    let cache = Arc::new(PolicyCache::new());
    let policy_task = tokio::spawn(policy::run_controller(client.clone(), cache.clone()));
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let params = reindex::WorkerParams {
        job_name: job_name.clone(),
        window,
        policy_names: job.spec.policy_names.clone(),
        config,
        cache,
        clickhouse: ClickHouseConfig::from(&clickhouse),
        bus_url: bus.bus_url,
    };

    let progress = reindex::run_worker(params, tokio_util::sync::CancellationToken::new()).await?;
    policy_task.abort();
    println!("{}", serde_json::to_string_pretty(&progress)?);
    Ok(())
}
