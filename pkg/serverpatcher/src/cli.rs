// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Command-line surface of the `serverpatcher` binary.

use crate::backend;
use crate::config::{self, Config, DEFAULT_CONFIG_PATH, Settings};
use crate::context::RunContext;
use crate::health::{self, HealthState};
use crate::host::HostEnv;
use crate::orchestrator::Orchestrator;
use crate::osinfo;
use crate::scheduler::Scheduler;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

const APP: &str = "serverpatcher";

/// Patch Linux servers with their native package manager
#[derive(Parser, Debug)]
#[command(name = APP, version)]
pub struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Also log to stdout
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Apply patches once and exit
    RunOnce,
    /// Run continuously on an interval
    Daemon,
    /// Print detected OS and selected backend
    Detect,
    /// Validate the configuration and exit
    ValidateConfig,
    /// Print the default configuration to stdout
    PrintDefaultConfig {
        /// One line of JSON instead of YAML
        #[arg(long)]
        compact: bool,
    },
    /// Print version and build metadata
    Version,
}

/// `<version> (commit=<sha> build=<date>)`, with the commit and date taken
/// from `SERVERPATCHER_COMMIT` and `SERVERPATCHER_BUILD_DATE` at build time.
pub fn version_string() -> String {
    format!(
        "{} (commit={} build={})",
        env!("CARGO_PKG_VERSION"),
        option_env!("SERVERPATCHER_COMMIT").unwrap_or("dev"),
        option_env!("SERVERPATCHER_BUILD_DATE").unwrap_or("unknown"),
    )
}

impl Cli {
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Command::Version => {
                println!("{APP} {}", version_string());
                Ok(ExitCode::SUCCESS)
            }
            Command::Detect => detect(),
            Command::PrintDefaultConfig { compact } => {
                print!("{}", config::default_document(compact)?);
                Ok(ExitCode::SUCCESS)
            }
            Command::ValidateConfig => {
                load_settings(&self.config)?;
                println!("OK");
                Ok(ExitCode::SUCCESS)
            }
            Command::RunOnce => run_once(self.setup()?).await,
            Command::Daemon => daemon(self.setup()?).await,
        }
    }

    /// Load the configuration and install the logger.
    fn setup(&self) -> Result<Settings> {
        let mut settings = load_settings(&self.config)?;
        settings.log.also_stdout |= self.verbose;
        sp_log::init(APP, &settings.log).context("failed to initialize logging")?;
        info!("{APP} {} starting", version_string());
        Ok(settings)
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let config = Config::load(path)?;
    Ok(config.validate()?)
}

fn detect() -> Result<ExitCode> {
    let env = HostEnv::from_process();
    let identity = osinfo::detect(&env.paths.os_release)?;
    let selected = backend::select(&identity, &env)?;
    println!("os={}", identity.name);
    println!("id={}", identity.id);
    println!("version={}", identity.version_id);
    println!("pretty={}", identity.pretty_name);
    println!("backend={selected}");
    Ok(ExitCode::SUCCESS)
}

/// Cancel `cancel` on the first SIGINT or SIGTERM.
fn cancel_on_signal(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
    Ok(())
}

async fn run_once(settings: Settings) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;
    let ctx = RunContext::new(settings.run_timeout, cancel);

    let outcome = Orchestrator::new(settings, HostEnv::from_process())
        .run_once(&ctx)
        .await;
    println!("{}", outcome.report.summary());
    match outcome.error {
        Some(e) => {
            eprintln!("{e}");
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

async fn daemon(settings: Settings) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let state = Arc::new(HealthState::new());
    let health_task = match settings.health_listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind health listener on {addr}"))?;
            let (state, cancel) = (Arc::clone(&state), cancel.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = health::serve(listener, state, cancel).await {
                    error!("health server error: {e}");
                }
            }))
        }
        None => None,
    };

    let (interval, jitter, run_timeout) = (settings.interval, settings.jitter, settings.run_timeout);
    let orchestrator = Orchestrator::new(settings, HostEnv::from_process());
    let mut scheduler = Scheduler::new(orchestrator, interval, jitter, run_timeout, StdRng::from_entropy())
        .with_health(state);
    scheduler.run(cancel.clone()).await;

    cancel.cancel();
    if let Some(task) = health_task
        && let Err(e) = task.await
    {
        error!("health server task failed: {e}");
    }
    info!("{APP} stopped");
    Ok(ExitCode::SUCCESS)
}
