//! # parley-api
//!
//! Real-time gateway of the Parley chat service.
//!
//! This binary provides:
//! - **WebSocket gateway** (`/ws`) for private and global messaging, presence
//!   and typing indicators
//! - **Health probes** (`/health`, `/health/live`, `/health/ready`)
//! - **Maintenance loop** for guest eviction, presence writes and attachment
//!   cleanup

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_api::config::{Config, LogFormat, StoreBackend};
use parley_api::{create_router, maintenance, AppState};
use parley_shared::{create_pool, run_migrations, MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------------------------------------------------
    // 1. Load configuration and initialize tracing (respects RUST_LOG)
    // -----------------------------------------------------------------------
    let config = Config::from_env().context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parley_api=debug"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!("Starting Parley gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        bind_address = %config.bind_address,
        store_backend = ?config.store_backend,
        settle_ms = config.presence_settle.as_millis() as u64,
        guest_grace_secs = config.guest_grace.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 2. Connect the record store
    // -----------------------------------------------------------------------
    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let pool = create_pool(url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, nothing will survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // -----------------------------------------------------------------------
    // 3. Start the gateway actors and background tasks
    // -----------------------------------------------------------------------
    let bind_address = config.bind_address.clone();
    let (state, _tasks) = AppState::start(config, store);
    let _maintenance = maintenance::spawn(&state);

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    info!(address = %bind_address, "Listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
