mod adapters;
mod config;
mod db;
mod error;
mod executor;
mod jobs;
mod models;
mod parser;
mod queue;

use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    db::SqliteScanStore,
    jobs::{spawn_worker_pool, TaskDispatcher, WorkerContext},
    models::{OptionValue, ScanJob, ScanPreset, TaskStatus, ToolKind},
    queue::Broker,
};

#[derive(Debug, Parser)]
#[command(name = "justsploit-rs", about = "Run nmap / WhatWeb scans through the task queue")]
struct Cli {
    /// Status poll interval in milliseconds
    #[arg(long, global = true, default_value_t = 500)]
    poll_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Port/service scan with nmap
    Nmap {
        target: String,
        #[arg(long, value_enum, default_value_t = ScanPreset::Basic)]
        preset: ScanPreset,
        /// e.g. `22,80,443` or `1-1000`; all ports when omitted
        #[arg(long)]
        ports: Option<String>,
        /// Extra tool option, `key=value` or a bare flag (repeatable)
        #[arg(long = "opt", value_parser = parse_option, allow_hyphen_values = true)]
        options: Vec<(String, OptionValue)>,
        #[arg(long)]
        project: Option<i64>,
    },
    /// Basic nmap scan of ports 1-1000
    Quick {
        target: String,
        #[arg(long)]
        project: Option<i64>,
    },
    /// Aggressive nmap scan of every TCP port
    Full {
        target: String,
        #[arg(long)]
        project: Option<i64>,
    },
    /// Web fingerprint with WhatWeb
    Whatweb {
        target: String,
        #[arg(long = "opt", value_parser = parse_option, allow_hyphen_values = true)]
        options: Vec<(String, OptionValue)>,
        #[arg(long)]
        project: Option<i64>,
    },
    /// Print stored scan results of a project
    Results {
        #[arg(long)]
        project: i64,
    },
}

impl Command {
    fn into_job(self) -> Option<ScanJob> {
        let (mut job, options, project) = match self {
            Command::Nmap {
                target,
                preset,
                ports,
                options,
                project,
            } => {
                let mut job = ScanJob::new(ToolKind::PortScan, target).with_preset(preset);
                job.ports = ports;
                (job, options, project)
            }
            Command::Quick { target, project } => (ScanJob::quick(target), Vec::new(), project),
            Command::Full { target, project } => (ScanJob::full(target), Vec::new(), project),
            Command::Whatweb {
                target,
                options,
                project,
            } => (ScanJob::new(ToolKind::Fingerprint, target), options, project),
            Command::Results { .. } => return None,
        };
        for (key, value) in options {
            job = job.with_option(key, value);
        }
        if let Some(project) = project {
            job = job.for_project(project);
        }
        Some(job)
    }
}

fn parse_option(raw: &str) -> Result<(String, OptionValue), String> {
    match raw.split_once('=') {
        Some((key, _)) if key.trim().is_empty() => Err(format!("missing option name in {raw:?}")),
        Some((key, value)) => Ok((key.to_string(), OptionValue::from(value))),
        None if raw.trim().is_empty() => Err("empty option".to_string()),
        None => Ok((raw.to_string(), OptionValue::Flag(true))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    db::run_migrations(&pool).await?;
    let store = SqliteScanStore::new(pool);

    let job = match cli.command {
        Command::Results { project } => {
            let rows = store.list_for_project(project).await?;
            info!(project, rows = rows.len(), "loaded stored scan results");
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(ExitCode::SUCCESS);
        }
        command => command.into_job(),
    };
    let Some(job) = job else {
        return Ok(ExitCode::SUCCESS);
    };

    let broker = Broker::connect(config.result_ttl());
    let ctx = WorkerContext::new(
        broker.clone(),
        config.clone(),
        Arc::new(store),
    );
    let workers = spawn_worker_pool(ctx, config.workers);
    let dispatcher = TaskDispatcher::new(broker.clone(), config.tools());

    let task_id = dispatcher.submit(job).await?;
    info!(%task_id, "waiting for scan to finish");

    let poll = Duration::from_millis(cli.poll_ms.max(10));
    let snapshot = tokio::select! {
        finished = dispatcher.wait(task_id, poll) => finished?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%task_id, "interrupted, cancelling scan");
            dispatcher.cancel(task_id).await?;
            dispatcher.status(task_id).await?
        }
    };

    broker.close().await;
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "worker ended abnormally");
        }
    }

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(if snapshot.status == TaskStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();
}
