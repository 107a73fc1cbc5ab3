//! virtiod - Root-cell virtio backend daemon for hvisor
//!
//! Provides:
//! - Forwarded MMIO access handling for guest cells
//! - Per-cell device windows from configuration
//! - Clean shutdown on SIGINT/SIGTERM

mod backend;
mod config;
mod dispatch;
mod unplugged;

use crate::backend::Backend;
use crate::config::VirtiodConfig;
use crate::dispatch::DeviceTable;
use anyhow::{Context, Result};
use clap::Parser;
use libhvisor::{block_hvi, ControlSurface, HvisorDevice};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// virtiod - virtio backend daemon
#[derive(Parser, Debug)]
#[command(name = "virtiod", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/hvisor/virtiod.toml", env = "VIRTIOD_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // The driver signals the process, not a thread: every runtime thread must
    // inherit the blocked mask or SIGHVI's default action kills the daemon
    block_hvi().context("blocking SIGHVI")?;

    runtime()?.block_on(run(args))
}

/// Runtime whose threads all start with SIGHVI blocked
///
/// The caller must have blocked SIGHVI already.
fn runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

async fn run(args: Args) -> Result<()> {
    let config = VirtiodConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Initialize logging
    let log_level = if args.debug {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    config.validate()?;
    if args.check_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("virtiod v{} starting", VERSION);
    info!("Configuration loaded from {:?}", args.config);

    let table = DeviceTable::from_config(&config.devices);
    if table.is_empty() {
        warn!("No devices configured; every request will be answered with 0");
    }

    let poll = Duration::from_millis(config.daemon.signal_poll_ms);
    let device = Arc::new(
        HvisorDevice::open(&config.daemon.device_path, poll)
            .with_context(|| format!("opening {}", config.daemon.device_path))?,
    );
    info!("Using bridge device {}", device.path().display());

    let mut backend = Backend::new(device.clone(), table);
    let mut worker = tokio::task::spawn_blocking(move || backend.run());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let finished = tokio::select! {
        res = &mut worker => Some(res),

        // Handle SIGTERM
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            None
        }

        // Handle SIGINT
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
            None
        }
    };

    let outcome = match finished {
        Some(res) => res,
        None => {
            device.interrupt();
            worker.await
        }
    };

    let summary = outcome.context("backend thread panicked")??;
    info!(
        "virtiod stopped: handled={} unmatched={} rejected={}",
        summary.handled, summary.unmatched, summary.rejected
    );
    Ok(())
}
