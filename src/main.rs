use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketpulse::api::{self, AppState};
use marketpulse::cache::HotCache;
use marketpulse::mode::ModeController;
use marketpulse::models::Config;
use marketpulse::pipeline;
use marketpulse::storage::PriceStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        port = config.port,
        exchanges = config.exchanges.len(),
        symbols = config.symbols.len(),
        "🚀 marketpulse starting"
    );

    let store = Arc::new(
        PriceStore::open(&config.database_path).context("Failed to initialize price store")?,
    );

    let shutdown = CancellationToken::new();

    let cache = HotCache::connect(&config.cache_addr, config.cache_pool_size, shutdown.clone())
        .await
        .context("Failed to connect to hot cache")?;
    info!(
        addr = %config.cache_addr,
        pool = config.cache_pool_size,
        "🔌 Hot cache pool ready"
    );

    let mode = Arc::new(ModeController::new());

    let handles = pipeline::start_ingestion(
        &config,
        cache.clone(),
        store.clone(),
        mode.clone(),
        shutdown.clone(),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        cache,
        mode,
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let tcp = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "🎯 API server listening");

    tokio::spawn(trigger_shutdown_on_signal(shutdown.clone()));

    let server_shutdown = shutdown.clone();
    let server = async move {
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    };

    // The server drains in-flight requests after the shutdown signal; cap
    // the wait so a stuck request cannot hold the process.
    tokio::select! {
        served = server => {
            if let Err(e) = served {
                error!(error = %e, "Server error");
            }
        }
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("HTTP server did not drain within the grace period");
        }
    }

    // Cancellation has already cascaded through the sources; wait for the
    // persistence sink to flush its final batches.
    info!("Draining pipeline");
    if tokio::time::timeout(SHUTDOWN_GRACE, handles.persistence)
        .await
        .is_err()
    {
        warn!("Persistence sink did not drain within the grace period");
    }

    info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketpulse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn trigger_shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
