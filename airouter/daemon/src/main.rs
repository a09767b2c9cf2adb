//! AI Router Daemon
//!
//! Hosts the provider router behind a Unix socket. Clients write one JSON
//! request per line and read one JSON response per line.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! airouter-daemon
//!
//! # Custom socket path and config file
//! airouter-daemon --socket-path /tmp/router.sock --config /etc/airouter/router.toml
//!
//! # Override settings for this run
//! airouter-daemon --failure-threshold 3 --no-direct-path --strategy cost
//!
//! # Verbose logging
//! RUST_LOG=debug airouter-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Reload live settings from the config file

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use airouter_core::config::{load_settings_from_path, ConfigOverrides, RouterSettings};
use airouter_core::{
    HttpProviderAdapter, OptimizationStrategy, ProviderIdentity, ProviderRegistry, RouterRuntime,
    TracingAuditSink, TracingMetricsSink,
};

use server::{DaemonServer, ServerConfig};

/// AI Router Daemon - routes AI requests across a provider fleet
#[derive(Parser, Debug)]
#[command(name = "airouter-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, env = "AIROUTER_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "AIROUTER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// PID file path
    #[arg(long, env = "AIROUTER_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "AIROUTER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Consecutive failures before a circuit opens
    #[arg(long, value_name = "N")]
    failure_threshold: Option<u32>,

    /// Seconds an open circuit waits before a trial
    #[arg(long, value_name = "SECS")]
    cooldown_secs: Option<u64>,

    /// Route everything over brokered paths
    #[arg(long)]
    no_direct_path: bool,

    /// Keep routing rules fixed
    #[arg(long)]
    no_optimizer: bool,

    /// Optimization strategy (latency, success-rate, cost, balanced, adaptive)
    #[arg(long, value_name = "STRATEGY")]
    strategy: Option<String>,

    /// Seconds between optimizer cycles
    #[arg(long, value_name = "SECS")]
    optimizer_interval_secs: Option<u64>,

    /// Seconds between health probe rounds
    #[arg(long, value_name = "SECS")]
    health_interval_secs: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Result<ConfigOverrides> {
        let mut overrides = ConfigOverrides::new();
        overrides.failure_threshold = self.failure_threshold;
        overrides.cooldown_secs = self.cooldown_secs;
        overrides.optimizer_interval_secs = self.optimizer_interval_secs;
        overrides.health_interval_secs = self.health_interval_secs;
        if self.no_direct_path {
            overrides.direct_path_enabled = Some(false);
        }
        if self.no_optimizer {
            overrides.optimizer_enabled = Some(false);
        }
        if let Some(name) = &self.strategy {
            let strategy = name
                .parse::<OptimizationStrategy>()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid --strategy")?;
            overrides.strategy = Some(strategy);
        }
        Ok(overrides)
    }
}

fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("airouter")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/airouter-{uid}"))
    }
}

/// Get the default socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/airouter-$UID/
fn default_socket_path() -> PathBuf {
    runtime_dir().join("router.sock")
}

fn default_pid_path() -> PathBuf {
    runtime_dir().join("router.pid")
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid, path = ?path, "PID file created");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start if the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    // Signal 0 only checks existence
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another airouter-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "airouter_daemon={level},airouter_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Register an HTTP adapter for every configured provider
fn build_registry(settings: &RouterSettings) -> Result<ProviderRegistry> {
    let registry = ProviderRegistry::new();
    for provider in &settings.providers {
        let adapter = HttpProviderAdapter::from_settings(provider)
            .with_context(|| format!("Provider {} is misconfigured", provider.id))?;
        registry.register(
            ProviderIdentity::new(provider.id.clone(), provider.role)
                .with_cost(provider.cost_per_request),
            Arc::new(adapter),
        );
        info!(
            provider = %provider.id,
            role = ?provider.role,
            enabled = provider.enabled,
            "Provider registered"
        );
    }
    if registry.is_empty() {
        anyhow::bail!("No providers configured; add [[providers]] entries to the config file");
    }
    Ok(registry)
}

/// Forward process signals to the server
fn spawn_signal_handler(shutdown: watch::Sender<bool>, reload: Arc<Notify>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    reload.notify_one();
                }
            }
        }
        let _ = shutdown.send(true);
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("AI Router Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let socket_path = args.socket_path.clone().unwrap_or_else(default_socket_path);
    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);
    info!(socket_path = ?socket_path, "Socket path");
    info!(pid_path = ?pid_path, "PID file path");

    let overrides = args.overrides()?;
    let mut settings = load_settings_from_path(args.config.as_deref())
        .context("Failed to load configuration")?;
    overrides
        .apply(&mut settings)
        .context("Invalid command-line overrides")?;
    info!(
        source = %settings.source(),
        config_file = ?settings.config_file_path,
        providers = settings.providers.len(),
        "Configuration loaded"
    );

    let registry = build_registry(&settings)?;
    let runtime = Arc::new(
        RouterRuntime::builder(settings)
            .registry(Arc::new(registry))
            .audit_sink(Arc::new(TracingAuditSink))
            .metrics_sink(Arc::new(TracingMetricsSink))
            .build()
            .context("Failed to build routing rules")?,
    );

    check_existing_daemon(&pid_path)?;
    write_pid_file(&pid_path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reload = Arc::new(Notify::new());
    spawn_signal_handler(shutdown_tx, Arc::clone(&reload))?;

    runtime.start();

    let server = DaemonServer::new(
        socket_path,
        args.config.clone(),
        overrides,
        Arc::clone(&runtime),
    )
    .with_server_config(ServerConfig {
        max_connections: args.max_connections,
        ..ServerConfig::default()
    });
    let result = server.run(shutdown_rx, reload).await;

    info!("Shutting down...");
    runtime.shutdown().await;
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("AI router daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
