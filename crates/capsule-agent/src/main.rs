// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capsule Agent - Host Daemon
//!
//! Runs the agent runtime on this host:
//! - Capsule lifecycle on Docker and LXC (whichever runtimes are present)
//! - Job processing (install-capsule, notification, email when SMTP is set)
//! - Stats sampling and state reconciliation
//! - Live event bus

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use capsule_agent::config::{Config, StorageConfig};
use capsule_agent::driver::{DockerDriver, Driver, LxcDriver};
use capsule_agent::message_processor::SmtpMailer;
use capsule_agent::runtime::AgentRuntime;
use capsule_core::persistence::{
    CapsuleStore, MemoryCapsuleStore, MemoryMessageStore, MessageStore, SqliteStore,
};

#[derive(Parser, Debug)]
#[command(name = "capsule-agent", version, about = "Docker and LXC capsule host agent")]
struct Cli {
    /// Load environment variables from this file instead of `./.env`.
    #[arg(long, env = "CAPSULE_AGENT_ENV_FILE")]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env file if present, before logging so RUST_LOG can come from it
    let loaded = match &cli.env_file {
        Some(path) => dotenvy::from_path(path).map(|_| path.clone()),
        None => dotenvy::dotenv(),
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capsule_agent=info,capsule_core=info".into()),
        )
        .init();

    if let Err(e) = loaded {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        storage = ?config.storage,
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        "Starting Capsule Agent"
    );

    let (capsule_store, message_store): (Arc<dyn CapsuleStore>, Arc<dyn MessageStore>) =
        match &config.storage {
            StorageConfig::Memory => {
                warn!("Using in-memory stores; capsules and jobs are lost on restart");
                (
                    Arc::new(MemoryCapsuleStore::new()),
                    Arc::new(MemoryMessageStore::new()),
                )
            }
            StorageConfig::Sqlite(url) => {
                let store = Arc::new(
                    SqliteStore::connect(url)
                        .await
                        .with_context(|| format!("failed to open {url}"))?,
                );
                info!("Connected to database");
                let capsule_store: Arc<dyn CapsuleStore> = store.clone();
                let message_store: Arc<dyn MessageStore> = store;
                (capsule_store, message_store)
            }
        };

    let mut builder = AgentRuntime::builder()
        .config(&config)
        .capsule_store(capsule_store)
        .message_store(message_store);
    for driver in available_drivers(&config).await {
        builder = builder.driver(driver);
    }
    if let Some(smtp) = &config.smtp {
        match SmtpMailer::new(smtp) {
            Ok(mailer) => {
                info!(host = %smtp.host, tls = ?smtp.tls, "Email delivery enabled");
                builder = builder.mailer(Arc::new(mailer));
            }
            Err(e) => warn!(error = %e, "SMTP mailer unavailable, email jobs disabled"),
        }
    }

    let runtime = builder
        .build()
        .context("no capsule backend is available on this host")?
        .start()
        .await?;

    info!("Capsule Agent ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
        }
        _ = terminate() => {}
    }
    info!("Shutdown signal received");

    match tokio::time::timeout(config.shutdown_timeout, runtime.shutdown()).await {
        Ok(Ok(())) => info!("Capsule Agent shut down"),
        Ok(Err(e)) => error!(error = %e, "Capsule Agent shut down with errors"),
        Err(_) => error!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Shutdown timed out, abandoning remaining work"
        ),
    }

    Ok(())
}

/// Drivers that are enabled and whose runtime answers a probe.
async fn available_drivers(config: &Config) -> Vec<Arc<dyn Driver>> {
    let mut candidates: Vec<Arc<dyn Driver>> = Vec::new();
    if config.docker_enabled {
        candidates.push(Arc::new(
            DockerDriver::new(config.docker_bin.clone()).with_timeout(config.driver_timeout),
        ));
    }
    if config.lxc_enabled {
        let mut lxc = LxcDriver::new().with_timeout(config.driver_timeout);
        if let Some(path) = &config.lxc_path {
            lxc = lxc.with_lxc_path(path.clone());
        }
        candidates.push(Arc::new(lxc));
    }

    let mut drivers = Vec::new();
    for driver in candidates {
        match driver.probe().await {
            Ok(()) => {
                info!(backend = %driver.backend(), "Backend available");
                drivers.push(driver);
            }
            Err(e) => warn!(backend = %driver.backend(), error = %e, "Backend unavailable, skipping"),
        }
    }
    drivers
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
