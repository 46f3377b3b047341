//! Sentinel — host-resident abuse-detection daemon.
//!
//! Watches per-tenant volume directories in real time, scans changed files
//! against a YARA signature corpus, and reacts to matches: optional LLM
//! triage, a Discord alert, and remediation plugins (tenant auto-suspend).
//!
//! The runtime is a channel pipeline:
//! observer → batcher → bounded work queue → worker pool → reaction fan-out
//!
//! - **scanner**: compiles the signature corpus, expands zip/jar/rar
//!   containers, scans byte buffers with a hard timeout
//! - **watcher**: the pipeline supervisor — observer, batcher, dedup cache,
//!   auto-tuned worker pool
//! - **reaction**: AI triage, Discord webhook, plugin fan-out
//! - **plugins**: builder-assembled remediators (Pterodactyl auto-suspend)
//! - **daemon**: PID-file start/stop/status for unattended hosts

mod banner;
mod config;
mod daemon;
mod integrations;
mod logger;
mod plugins;
mod reaction;
mod scanner;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use config::{Config, APP_NAME, COMPANY};
use plugins::pterodactyl::PterodactylAutoSuspend;
use plugins::PluginSetBuilder;
use reaction::Reactor;
use scanner::Scanner;
use watcher::Watcher;

#[derive(Debug, Parser)]
#[command(name = "sentinel", version, about = "Advanced Abuse Detection & Prevention System")]
struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run as daemon
    #[arg(long)]
    daemon: bool,

    /// Daemon control action
    #[arg(long, value_enum)]
    action: Option<Action>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Action {
    Start,
    Stop,
    Restart,
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    if cli.daemon {
        // Daemon mode logs to file; stdio is detached by the parent.
        logger::init_with_file(&cli.log_level, Path::new(daemon::LOG_FILE))?;
    } else {
        logger::init(&cli.log_level);
        banner::print_banner();
    }

    match cli.action {
        Some(Action::Start) => {
            let binary = std::env::current_exe().context("failed to get executable path")?;
            daemon::start(&binary, &config_path, &cli.log_level)
        }
        Some(Action::Stop) => daemon::stop(),
        Some(Action::Restart) => {
            let binary = std::env::current_exe().context("failed to get executable path")?;
            daemon::restart(&binary, &config_path, &cli.log_level)
        }
        Some(Action::Status) => daemon::status(),
        None => tokio::runtime::Runtime::new()?.block_on(run(config_path, cli.daemon)),
    }
}

/// Load everything, start the pipeline, and block until a shutdown signal.
async fn run(config_path: PathBuf, daemon_mode: bool) -> Result<()> {
    let config = Arc::new(Config::load(&config_path)?);
    info!(
        "Starting {} v{} by {}",
        APP_NAME,
        env!("CARGO_PKG_VERSION"),
        COMPANY
    );

    // Plugins first: a remediator that cannot start must abort startup
    // before anything gets watched.
    let mut builder = PluginSetBuilder::new();
    if config.plugin_table(plugins::pterodactyl::TABLE).is_some() {
        builder = builder.register(Box::new(PterodactylAutoSuspend::new()?));
    }
    let plugin_set = builder.build(&config).await?;

    // Signature load is soft: an empty corpus still starts the daemon so
    // signatures can be synced and reloaded later.
    let signature_path = PathBuf::from(&config.detection.signature_path);
    let scanner = Arc::new(Scanner::new(&signature_path)?);

    let reactor = Arc::new(Reactor::new(config.clone(), plugin_set)?);
    let mut watcher = Watcher::new(config.clone(), scanner.clone(), reactor);

    let tuning = watcher.tuning();
    if !daemon_mode {
        banner::print_system_info(
            tuning.workers,
            tuning.buffer_size,
            tuning.cpu_count,
            tuning.ram_gb,
        );
    }

    watcher.start()?;
    info!("{} is running. Press Ctrl+C to stop.", APP_NAME);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down (SIGINT)");
                break;
            }
            _ = sigterm.recv() => {
                info!("shutting down (SIGTERM)");
                break;
            }
            _ = sighup.recv() => {
                info!("reloading signature rules (SIGHUP)");
                match scanner.reload(&signature_path) {
                    Ok(()) => info!(rulesets = scanner.ruleset_count(), "signature rules reloaded"),
                    Err(e) => warn!(error = %e, "signature reload failed"),
                }
            }
        }
    }

    watcher.stop().await;
    info!("shutdown complete");
    Ok(())
}
