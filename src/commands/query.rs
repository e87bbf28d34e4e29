use std::sync::Arc;

use anyhow::Context;

use crate::api::{self, ApiState};
use crate::cli::QueryCommand;
use crate::policy::PolicyCache;
use crate::query::{ClickHouseConfig, QueryClient};

pub async fn run(command: QueryCommand) -> anyhow::Result<()> {
    match command {
        QueryCommand::Serve { addr, clickhouse, limits } => run_serve(addr, clickhouse, limits).await,
    }
}

async fn run_serve(
    addr: String,
    clickhouse_args: crate::config::ClickHouseArgs,
    limits: crate::config::QueryLimitsArgs,
) -> anyhow::Result<()> {
    let clickhouse = QueryClient::connect(&ClickHouseConfig::from(&clickhouse_args));
    let kube_client = kube::Client::try_default().await.context("connecting to cluster")?;
    let cache = Arc::new(PolicyCache::new());
    let policy_task = tokio::spawn(crate::policy::run_controller(kube_client, cache.clone()));

    let state = ApiState {
        clickhouse: Arc::new(clickhouse),
        policy_cache: cache,
        max_page_size: limits.max_page_size,
    };
    let router = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await.context("binding query server address")?;
    tracing::info!(%addr, "query server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("query server error")?;

    policy_task.abort();
    Ok(())
}
