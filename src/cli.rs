//! Top-level CLI surface: one subcommand per runnable part of the system.

use clap::{Parser, Subcommand};

use crate::config::{BusArgs, ClickHouseArgs, ProcessorArgs, QueryLimitsArgs, ReindexArgs};

#[derive(Debug, Parser)]
#[command(name = "activity-pipeline", about = "Multi-tenant activity and audit pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Policy CRD management and the policy reconcile/preview surfaces.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// ReindexJob CRD management, controller, and worker.
    Reindex {
        #[command(subcommand)]
        command: ReindexCommand,
    },
    /// Event/audit processor (NATS -> policy engine -> activity bus).
    Processor {
        #[command(subcommand)]
        command: ProcessorCommand,
    },
    /// Ephemeral query/preview REST harness over ClickHouse.
    Query {
        #[command(subcommand)]
        command: QueryCommand,
    },
    /// Watch-layer HTTP server over the event bus.
    Watch {
        #[command(subcommand)]
        command: WatchCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Crd {
        #[command(subcommand)]
        command: CrdCommand,
    },
    /// Evaluate `PolicyPreview` against sample inputs from a file.
    Preview {
        #[arg(long)]
        file: String,
    },
    /// Run the `Policy` CRD reconcile loop (cache reload driver).
    Controller,
}

#[derive(Debug, Subcommand)]
pub enum ReindexCommand {
    Crd {
        #[command(subcommand)]
        command: CrdCommand,
    },
    /// Run the `ReindexJob` controller.
    Controller {
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        clickhouse: ClickHouseArgs,
    },
    /// Run a single worker pass for one job (the controller's child-process
    /// mode).
    Worker {
        #[arg(long)]
        job: String,
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        clickhouse: ClickHouseArgs,
        #[command(flatten)]
        reindex: ReindexArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum CrdCommand {
    Generate,
    Install,
}

#[derive(Debug, Subcommand)]
pub enum ProcessorCommand {
    Serve {
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        processor: ProcessorArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
        #[command(flatten)]
        clickhouse: ClickHouseArgs,
        #[command(flatten)]
        limits: QueryLimitsArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum WatchCommand {
    Serve {
        #[arg(long, default_value = "0.0.0.0:8081")]
        addr: String,
        #[command(flatten)]
        bus: BusArgs,
    },
}
