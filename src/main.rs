#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gse-tunnel
//!
//! Tunnel engine of the configuration-distribution service. Keeps one TLS
//! session per GSE task-server, answers sidecar requests relayed by the
//! platform and pushes notifications back to the sidecars.
//!
//! ## Subcommands
//!
//! - `gse-tunnel run` (default) — run the engine
//! - `gse-tunnel supervise` — run as supervisor: starts the engine and restarts on crash
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, status loop, graceful shutdown
//! supervisor.rs    — built-in supervisor (spawn/restart loop)
//! config.rs        — TOML + env-var configuration
//! protocol/        — frame codec, platform JSON bodies, protobuf commands
//! tls.rs           — rustls client config and TCP/TLS dialer
//! tunnel/
//!   manager.rs     — one connection per endpoint, all-or-nothing init
//!   connection.rs  — register, reconnect, write guard
//!   reader.rs      — session validation, immediate ack
//!   dispatcher.rs  — decode and route to command queues
//!   workers.rs     — command worker pools
//!   writer.rs      — outbound writer pool, push handle
//! ```

mod supervisor;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};

use gse_tunnel::{
    Config, ConnectionManager, CounterObserver, DefaultHandlers, MemoryRegistry, Services,
};

/// Status line and registry sweep period.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Tunnel engine between the config service and GSE task-servers.
#[derive(Parser)]
#[command(name = "gse-tunnel", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel engine (default when no subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts the engine and restarts it on crash.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run { config: None }) {
        Commands::Supervise { config } => run_supervisor_mode(config.as_deref()).await,
        Commands::Run { config } => run_engine(config.as_deref()).await,
    }
}

fn load_config(config_path: Option<&str>) -> Option<Config> {
    match Config::load(config_path) {
        Ok(config) => {
            // Initialize tracing
            let log_filter =
                std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
            tracing_subscriber::fmt().with_env_filter(log_filter).init();
            Some(config)
        }
        Err(e) => {
            // No subscriber yet.
            eprintln!("gse-tunnel: {e}");
            None
        }
    }
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ExitCode {
    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };
    info!("gse-tunnel supervisor starting");
    match supervisor::run_supervisor(config_path, &config.supervisor).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Supervisor failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_engine(config_path: Option<&str>) -> ExitCode {
    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };
    info!("gse-tunnel v{} starting", env!("CARGO_PKG_VERSION"));
    if let Err(e) = config.tunnel.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    info!(
        service_id = config.tunnel.service_id,
        endpoints = ?config.tunnel.endpoints,
        "Connecting to GSE"
    );

    let registry = MemoryRegistry::new();
    let observer = CounterObserver::new();
    let services = Services {
        handlers: Arc::new(DefaultHandlers),
        registry: registry.clone(),
        observer: observer.clone(),
    };
    let manager = Arc::new(ConnectionManager::new(config.tunnel.clone(), services));
    if let Err(e) = manager.init().await {
        error!("Tunnel init failed: {e}");
        return ExitCode::FAILURE;
    }
    info!("Tunnel ready");

    // Periodic status: expire plugin sessions, log connection states
    let status_task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = registry.sweep() {
                    warn!("Registry sweep failed: {e}");
                }
                let sessions = manager.session_count().unwrap_or_default();
                for (endpoint, state) in manager.states().await {
                    info!(endpoint = %endpoint, ?state, sessions, "Tunnel status");
                }
                for (series, value) in observer.snapshot() {
                    debug!(target: "metrics", "{series} = {value}");
                }
            }
        })
    };

    if let Err(e) = shutdown_signal().await {
        error!("Signal handling failed: {e}");
    }

    // Cleanup
    info!("Shutting down...");
    status_task.abort();
    manager.close().await;
    info!("Goodbye");
    ExitCode::SUCCESS
}

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => { r?; info!("Received SIGINT"); }
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        info!("Received SIGINT");
    }
    Ok(())
}
