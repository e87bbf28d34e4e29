//! Shared CLI flag groups, reused across subcommands via `#[command(flatten)]`.

use clap::Args;

use crate::query::ClickHouseConfig;

#[derive(Debug, Clone, Args)]
pub struct BusArgs {
    #[arg(long, env = "ACTIVITY_PIPELINE_BUS_URL", default_value = "nats://127.0.0.1:4222")]
    pub bus_url: String,
    #[arg(long, env = "ACTIVITY_PIPELINE_BUS_TLS_CERT")]
    pub bus_tls_cert: Option<String>,
    #[arg(long, env = "ACTIVITY_PIPELINE_BUS_TLS_KEY")]
    pub bus_tls_key: Option<String>,
    #[arg(long, env = "ACTIVITY_PIPELINE_BUS_TLS_CA")]
    pub bus_tls_ca: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ClickHouseArgs {
    #[arg(long, env = "ACTIVITY_PIPELINE_CLICKHOUSE_URL", default_value = "http://127.0.0.1:8123")]
    pub clickhouse_url: String,
    #[arg(long, env = "ACTIVITY_PIPELINE_CLICKHOUSE_DATABASE", default_value = "activity_pipeline")]
    pub clickhouse_database: String,
    #[arg(long, env = "ACTIVITY_PIPELINE_CLICKHOUSE_USER")]
    pub clickhouse_user: Option<String>,
    #[arg(long, env = "ACTIVITY_PIPELINE_CLICKHOUSE_PASSWORD")]
    pub clickhouse_password: Option<String>,
    #[arg(long, env = "ACTIVITY_PIPELINE_CLICKHOUSE_TLS_CA")]
    pub clickhouse_tls_ca: Option<String>,
}

impl From<&ClickHouseArgs> for ClickHouseConfig {
    fn from(args: &ClickHouseArgs) -> Self {
        ClickHouseConfig {
            url: args.clickhouse_url.clone(),
            database: args.clickhouse_database.clone(),
            user: args.clickhouse_user.clone(),
            password: args.clickhouse_password.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ProcessorArgs {
    #[arg(long, env = "ACTIVITY_PIPELINE_WORKER_COUNT", default_value_t = 4)]
    pub worker_count: usize,
    #[arg(long, env = "ACTIVITY_PIPELINE_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Args)]
pub struct ReindexArgs {
    #[arg(long, env = "ACTIVITY_PIPELINE_RATE_LIMIT", default_value_t = 100)]
    pub rate_limit: u32,
}

#[derive(Debug, Clone, Args)]
pub struct QueryLimitsArgs {
    #[arg(long, env = "ACTIVITY_PIPELINE_MAX_PAGE_SIZE", default_value_t = 1000)]
    pub max_page_size: u32,
}
