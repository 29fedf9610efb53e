//! Swap Watch-tower - cross-chain HTLC swap tracking and automation
//!
//! Follows atomic swap contracts across chains, redeems counterpart legs once
//! the secret is revealed and refunds legs whose deadline has passed.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use swap_watchtower::chain::{ChainWatcher, MemoryWatcher};
use swap_watchtower::config::Settings;
use swap_watchtower::metrics::MetricsServer;
use swap_watchtower::{PolicyConfig, Tracker, TrackerConfig, WatchTower};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Swap Watch-tower v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize chain watchers
    let mut watchers: Vec<Arc<dyn ChainWatcher>> = Vec::new();
    for (name, chain) in settings.enabled_chains() {
        let mut watcher = MemoryWatcher::new(chain.chain_type);
        if let Some(path) = &chain.backlog_file {
            watcher = watcher
                .with_backlog_file(path)
                .with_context(|| format!("Failed to load backlog for chain {}", name))?;
        }
        info!(
            "Chain {} watched as {} (lock time {}s, redeem reward {})",
            name, chain.chain_type, chain.lock_time_secs, chain.reward_for_redeem
        );
        watchers.push(Arc::new(watcher));
    }

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start tracker
    let (tracker, streams) = Tracker::new(watchers, TrackerConfig::from(&settings.tracker))?;
    let tracker = Arc::new(tracker);

    // Start watch-tower before restoring so the status queue is drained
    let (stop_tx, stop_rx) = watch::channel(false);
    let watchtower = WatchTower::new(tracker.clone(), PolicyConfig::from_settings(&settings));
    let watchtower_handle = tokio::spawn(watchtower.run(streams, stop_rx));

    tracker.start().await?;
    info!("Tracker started for {:?}", tracker.chains());

    info!("Swap Watch-tower is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    let _ = stop_tx.send(true);
    if let Err(e) = watchtower_handle.await {
        warn!("Watch-tower task ended abnormally: {}", e);
    }
    if let Err(e) = tracker.close().await {
        warn!("Tracker close failed: {}", e);
    }

    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap Watch-tower stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_watchtower=debug,hyper=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
