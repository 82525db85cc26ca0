// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use depwatch::{path::default_config_path, Scheduler, UpdateWorkflow, UpdaterConfig};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{future::pending, path::PathBuf, process::exit};
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "depwatch [options] <depwatch-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config = load_config(self.config)?;
        match self.command {
            Command::Run => run_once(config).await,
            Command::Watch => run_watch(config).await,
            Command::Status => run_status(config).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Check for new version once, and update targets if needed.
    #[command(override_usage = "depwatch run [options]")]
    Run,

    /// Keep checking for new versions on configured schedule.
    #[command(override_usage = "depwatch watch [options]")]
    Watch,

    /// Show recorded and latest version without updating anything.
    #[command(override_usage = "depwatch status [options]")]
    Status,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer().compact().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_config(path: Option<PathBuf>) -> Result<UpdaterConfig> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    UpdaterConfig::load(&path)
        .with_context(|| format!("failed to load configuration from {:?}", path.display()))
}

async fn run_once(config: UpdaterConfig) -> Result<()> {
    let workflow = UpdateWorkflow::from_config(&config)?;

    // INVARIANT: Failed run already logged its own error.
    if workflow.run().await.is_err() {
        exit(1);
    }

    Ok(())
}

async fn run_watch(config: UpdaterConfig) -> Result<()> {
    let workflow = UpdateWorkflow::from_config(&config)?;
    let scheduler = Scheduler::from_settings(&config.schedule)?;
    scheduler.run_until(&workflow, shutdown_signal()).await;

    Ok(())
}

async fn run_status(config: UpdaterConfig) -> Result<()> {
    let workflow = UpdateWorkflow::from_config(&config)?;
    let check = workflow.check().await?;

    let state = match (&check.local, check.is_pending()) {
        (None, _) => "not initialized",
        (Some(_), true) => "update pending",
        (Some(_), false) => "up to date",
    };

    println!("package: {}", workflow.package_name());
    println!("record:  {:?}", config.version_file_path().display());
    println!("local:   {}", check.local.as_deref().unwrap_or("<none>"));
    println!("remote:  {}", check.remote);
    println!("status:  {state}");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for shutdown signal: {error}");
        pending::<()>().await;
    }
}
