use std::sync::Arc;

use anyhow::Context;
use kube::CustomResourceExt;

use crate::cli::{CrdCommand, PolicyCommand};
use crate::crd::Policy;
use crate::policy::{self, PolicyCache};

pub async fn run(command: PolicyCommand) -> anyhow::Result<()> {
    match command {
        PolicyCommand::Crd { command } => run_crd(command).await,
        PolicyCommand::Preview { file } => run_preview(&file).await,
        PolicyCommand::Controller => run_controller().await,
    }
}

async fn run_crd(command: CrdCommand) -> anyhow::Result<()> {
    let crd = Policy::crd();
    let yaml = serde_yaml::to_string(&crd).context("serializing Policy CRD")?;
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

#[derive(serde::Deserialize)]
struct PreviewFile {
    kind: policy::RuleKind,
    rules: Vec<crate::crd::PolicyRule>,
    samples: Vec<PreviewSample>,
}

#[derive(serde::Deserialize)]
struct PreviewSample {
    record: serde_json::Value,
    actor: serde_json::Value,
}

async fn run_preview(file: &str) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file).await.context("reading preview file")?;
    let parsed: PreviewFile = serde_yaml::from_str(&content).context("parsing preview file")?;
    let samples: Vec<(serde_json::Value, serde_json::Value)> =
        parsed.samples.into_iter().map(|s| (s.record, s.actor)).collect();
    let results = policy::preview(parsed.kind, &parsed.rules, &samples);
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

async fn run_controller() -> anyhow::Result<()> {
    let client = kube::Client::try_default().await.context("connecting to cluster")?;
    let cache = Arc::new(PolicyCache::new());
    policy::run_controller(client, cache).await;
    Ok(())
}
