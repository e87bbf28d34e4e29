use std::convert::Infallible;

use anyhow::Context;
use async_nats::jetstream;
use axum::extract::{Query as QueryExtract, State};
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::bus;
use crate::cli::WatchCommand;
use crate::watch;

#[derive(Clone)]
struct WatchState {
    jetstream: jetstream::Context,
}

pub async fn run(command: WatchCommand) -> anyhow::Result<()> {
    match command {
        WatchCommand::Serve { addr, bus } => run_serve(addr, bus).await,
    }
}

async fn run_serve(addr: String, bus_args: crate::config::BusArgs) -> anyhow::Result<()> {
    let client = bus::connect(&bus_args.bus_url).await.context("connecting to NATS")?;
    let state = WatchState {
        jetstream: jetstream::new(client),
    };

    let router = Router::new()
        .route("/apis/activity.miloapis.com/v1alpha1/clusterevents/watch", get(watch_events))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await.context("binding watch server address")?;
    tracing::info!(%addr, "watch server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("watch server error")?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WatchQuery {
    #[serde(default = "default_stream")]
    stream: String,
    #[serde(default, rename = "resourceVersion")]
    resource_version: u64,
    #[serde(default, rename = "fieldSelector")]
    field_selector: String,
}

fn default_stream() -> String {
    "events".to_string()
}

async fn watch_events(
    State(state): State<WatchState>,
    QueryExtract(params): QueryExtract<WatchQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, crate::error::AppError> {
    let selector = watch::parse_field_selector(&params.field_selector)
        .map_err(|e| crate::error::AppError::invalid("fieldSelector", e.to_string()))?;

    let cancel = CancellationToken::new();
    let rx = watch::watch(state.jetstream, &params.stream, params.resource_version, selector, cancel)
        .await
        .map_err(|e| crate::error::service_unavailable("watch-open", e))?;

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(stream))
}
