use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_nats::jetstream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus;
use crate::cli::ProcessorCommand;
use crate::policy::{self, PolicyCache};
use crate::processor::mapping::MappingCache;
use crate::processor::pool::{Processor, ProcessorConfig, SourceKind};

pub async fn run(command: ProcessorCommand) -> anyhow::Result<()> {
    match command {
        ProcessorCommand::Serve { bus, processor } => run_serve(bus, processor).await,
    }
}

async fn run_serve(bus_args: crate::config::BusArgs, processor_args: crate::config::ProcessorArgs) -> anyhow::Result<()> {
    let client = bus::connect(&bus_args.bus_url).await.context("connecting to NATS")?;
    let jetstream = jetstream::new(client);

    let config = ProcessorConfig {
        worker_count: processor_args.worker_count,
        batch_size: processor_args.batch_size,
        ..ProcessorConfig::default()
    };

    let kube_client = kube::Client::try_default().await.context("connecting to cluster")?;
    let cache = Arc::new(PolicyCache::new());
    let mapping = Arc::new(MappingCache::new(kube_client.clone()));
    let processor = Arc::new(Processor::new(config, cache.clone(), mapping.clone(), jetstream.clone()));

    let policy_task = tokio::spawn(policy::run_controller(kube_client, cache));
    let mapping_refresh_task = tokio::spawn(mapping.run_background_refresh(Duration::from_secs(600)));

    let audit_stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: "audit".to_string(),
            subjects: vec![bus::AUDIT_SUBJECT.to_string()],
            ..Default::default()
        })
        .await
        .context("ensuring audit stream")?;
    let audit_consumer = audit_stream
        .get_or_create_consumer(
            "audit-processor",
            jetstream::consumer::pull::Config {
                durable_name: Some("audit-processor".to_string()),
                ..Default::default()
            },
        )
        .await
        .context("binding audit consumer")?;

    let event_stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: "events".to_string(),
            subjects: vec![bus::EVENT_SUBJECT.to_string()],
            ..Default::default()
        })
        .await
        .context("ensuring event stream")?;
    let event_consumer = event_stream
        .get_or_create_consumer(
            "event-processor",
            jetstream::consumer::pull::Config {
                durable_name: Some("event-processor".to_string()),
                ..Default::default()
            },
        )
        .await
        .context("binding event consumer")?;

    let cancel = CancellationToken::new();

    let audit_cancel = cancel.clone();
    let audit_processor = processor.clone();
    let audit_task = tokio::spawn(async move {
        audit_processor.run(audit_consumer, SourceKind::Audit, audit_cancel).await;
    });

    let event_cancel = cancel.clone();
    let event_processor = processor.clone();
    let event_task = tokio::spawn(async move {
        event_processor.run(event_consumer, SourceKind::Event, event_cancel).await;
    });

    tokio::signal::ctrl_c().await.context("awaiting shutdown signal")?;
    info!("shutdown signal received, draining processor pool");
    cancel.cancel();

    policy_task.abort();
    mapping_refresh_task.abort();
    let _ = tokio::join!(audit_task, event_task);
    Ok(())
}
