//! Hestia gateway server.
//!
//! Serves the Gaia hub protocol over a user's storage connections, runs driver
//! maintenance on a scheduler tick and periodically repairs lagging connections.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hestia_gateway::{router, Config, DriverRegistry, Hestia, MemoryStore, TrustingAuthenticator};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let settings = config.settings()?;
    let table = config.driver_table()?;

    info!("Starting hestia-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Origin: {}", settings.origin);

    let store = Arc::new(match &config.state_file {
        Some(path) => {
            info!("  State file: {}", path.display());
            MemoryStore::open(path)
                .await
                .with_context(|| format!("Failed to open state file {}", path.display()))?
        }
        None => {
            warn!("  State file: none, state is lost on shutdown");
            MemoryStore::new()
        }
    });

    let drivers = DriverRegistry::init(&table, &settings.origin, store.clone()).await;
    if drivers.is_empty() {
        anyhow::bail!("No driver could be initialized");
    }

    warn!("  Auth: DISABLED (bearer tokens are trusted without verification)");
    let app = Hestia::new(settings, store.clone(), drivers, Arc::new(TrustingAuthenticator));

    // Scheduler: driver ticks and snapshots
    {
        let app = app.clone();
        let store = store.clone();
        let period = Duration::from_millis(config.tick_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                app.drivers.tick();
                if let Err(e) = store.flush().await {
                    error!("Failed to save state: {}", e);
                }
            }
        });
    }

    // Background read-repair
    {
        let app = app.clone();
        let period = Duration::from_secs(config.sync_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match app.sync.sweep().await {
                    Ok(report) => info!(
                        "Sync sweep: {} repaired, {} deleted, {} failed",
                        report.repaired, report.deleted, report.failed
                    ),
                    Err(e) => error!("Sync sweep failed: {}", e),
                }
            }
        });
    }

    let router = router(app);

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = store.flush().await {
        error!("Failed to save state on shutdown: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
        info!("Received SIGTERM, initiating shutdown");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
