//! taskgridd — the TaskGrid daemon.
//!
//! Single binary that assembles the TaskGrid subsystems:
//! - State store (redb)
//! - Engine with the HTTP remote client
//! - Heartbeat / cancel-timeout sweep loop
//! - REST API
//!
//! Several daemons may point at one store; they coordinate only through it.
//!
//! # Usage
//!
//! ```text
//! taskgridd serve --config /etc/taskgrid/taskgrid.toml --port 8650
//! taskgridd print-config > taskgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use taskgrid_core::GridConfig;
use taskgrid_engine::{CasRetry, Engine, EngineOptions, HeartbeatSupervisor, HttpRemoteClient};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "taskgridd", about = "TaskGrid daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and API server.
    Serve {
        /// Path to taskgrid.toml. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Base URL remote jobs use to call back.
        #[arg(long)]
        callback_base_url: Option<String>,

        /// Identifier recorded on slot claims made by this daemon.
        #[arg(long)]
        node_id: Option<String>,
    },
    /// Print the effective default configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            callback_base_url,
            node_id,
        } => {
            let mut config = match config {
                Some(path) => GridConfig::from_file(&path)?,
                None => GridConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            if let Some(url) = callback_base_url {
                config.server.callback_base_url = url;
            }
            if node_id.is_some() {
                config.server.node_id = node_id;
            }
            run_serve(config).await
        }
        Command::PrintConfig => {
            print!("{}", GridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,taskgridd=debug,taskgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_serve(config: GridConfig) -> anyhow::Result<()> {
    let server = &config.server;
    let node_id = server
        .node_id
        .clone()
        .unwrap_or_else(|| format!("taskgridd-{}", std::process::id()));
    info!(%node_id, "TaskGrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&server.data_dir)?;
    let db_path = server.data_dir.join("taskgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = taskgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    if store.seed_settings(&config.defaults)? {
        info!(settings = ?config.defaults, "settings seeded from config");
    }

    // Engine.
    let remote = HttpRemoteClient::new(
        config.engine.remote_attempts,
        Duration::from_millis(config.engine.remote_timeout_ms),
    );
    let engine = Engine::new(
        store,
        Arc::new(remote),
        EngineOptions {
            callback_base_url: server.callback_base_url.clone(),
            node_id,
            retry: CasRetry::with_attempts(config.engine.cas_max_attempts),
        },
    );
    info!(callback_base_url = %server.callback_base_url, "engine initialized");

    // Work enqueued before a restart is admitted now.
    engine.poke().await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let sweep_interval = Duration::from_secs(config.engine.sweep_interval_secs.max(1));
    let sweep_handle = HeartbeatSupervisor::spawn(engine.clone(), sweep_interval, shutdown_rx);
    info!(interval = ?sweep_interval, "sweep loop started");

    // ── Start API server ───────────────────────────────────────

    let router = taskgrid_api::build_router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = sweep_handle.await;

    info!("TaskGrid daemon stopped");
    Ok(())
}
