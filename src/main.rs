#![forbid(unsafe_code)]

//! `agent-warden`: headless agent session supervisor binary.
//!
//! `serve` runs the supervisor loop until interrupted, `exec` drives a
//! single command through a session, and `audit` runs one supervisor tick
//! and reports the fleet health.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_warden::config::GlobalConfig;
use agent_warden::orchestrator::registry::SessionRegistry;
use agent_warden::orchestrator::supervisor::ProcessSupervisor;
use agent_warden::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-warden", about = "Headless agent session supervisor", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root that holds per-agent directories.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Leave session processes running when the supervisor exits.
    #[arg(long, global = true)]
    persist: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the supervisor loop until SIGINT or SIGTERM.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Execute one command in an agent's session and print the result.
    Exec {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
        /// Agent whose session runs the command.
        #[arg(long)]
        agent: String,
        /// Command timeout in seconds; defaults to the configured value.
        #[arg(long)]
        timeout: Option<u64>,
        /// Line written to the session's stdin.
        command: String,
    },
    /// Run one supervisor tick and print its report.
    Audit {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let Cli {
        workspace,
        persist,
        command,
        ..
    } = args;

    match command {
        Command::Serve { config } => {
            let config = load_config(&config, workspace.as_deref(), persist)?;
            serve(&config).await
        }
        Command::Exec {
            config,
            agent,
            timeout,
            command,
        } => {
            let config = load_config(&config, workspace.as_deref(), persist)?;
            exec(&config, &agent, &command, timeout.map(Duration::from_secs)).await
        }
        Command::Audit { config } => {
            let config = load_config(&config, workspace.as_deref(), persist)?;
            audit(&config).await
        }
    }
}

fn load_config(path: &Path, workspace: Option<&Path>, persist: bool) -> Result<GlobalConfig> {
    let mut config = GlobalConfig::load_from_path(path)?;

    if let Some(ws) = workspace {
        std::fs::create_dir_all(ws)
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.workspace_root = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
    }
    if persist {
        config.session.persist = true;
    }

    info!(
        executable = %config.spawn.executable,
        workspace_root = %config.workspace_root.display(),
        persist = config.session.persist,
        "configuration loaded"
    );
    Ok(config)
}

async fn serve(config: &GlobalConfig) -> Result<()> {
    let registry = Arc::new(SessionRegistry::from_config(config)?);
    let supervisor = Arc::new(ProcessSupervisor::from_config(
        Arc::clone(&registry),
        config,
    ));

    let ct = CancellationToken::new();
    let monitor = Arc::clone(&supervisor).spawn(ct.clone());
    info!("agent-warden ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Err(err) = monitor.await {
        error!(%err, "supervisor task failed");
    }

    let outcomes = supervisor.shutdown_all(config.session.persist).await;
    for (agent_id, outcome) in &outcomes {
        info!(agent_id = %agent_id, ?outcome, "session closed on shutdown");
    }
    info!(sessions = outcomes.len(), "agent-warden shut down");
    Ok(())
}

async fn exec(
    config: &GlobalConfig,
    agent_id: &str,
    command: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    let registry = SessionRegistry::from_config(config)?;
    let outcome = registry.execute(agent_id, command, timeout).await;
    registry.remove_all(config.session.persist).await;

    print_json(&outcome?)
}

async fn audit(config: &GlobalConfig) -> Result<()> {
    let registry = Arc::new(SessionRegistry::from_config(config)?);
    let supervisor = ProcessSupervisor::from_config(registry, config);
    let report = supervisor.tick().await;
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Io(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
