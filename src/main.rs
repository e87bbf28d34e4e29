use activity_pipeline::cli::{Cli, Commands};
use activity_pipeline::commands;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Policy { command } => commands::policy::run(command).await,
        Commands::Reindex { command } => commands::reindex::run(command).await,
        Commands::Processor { command } => commands::processor::run(command).await,
        Commands::Query { command } => commands::query::run(command).await,
        Commands::Watch { command } => commands::watch::run(command).await,
    }
}
