use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

mod config;
mod db;
mod error;
mod identity;
mod remote;
mod status;
mod sync;

use config::{Command, Config};
use db::models::Identity;
use db::{Database, KeyValueStore, MemoryStore};
use identity::LocalIdentityProvider;
use remote::{HttpRemote, RemoteSource};
use status::AppState;
use sync::{SnapshotStore, SyncController, SystemClock};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let remote = HttpRemote::new(
        &config.remote_url,
        config.api_token.clone(),
        config.request_timeout(),
    )?;

    if let Some(Command::Invalidate { scope, source }) = &config.command {
        let marker = remote
            .post_invalidation_marker(*scope, source)
            .await
            .context("Failed to post invalidation marker")?;
        info!(
            scope = %marker.scope,
            source = %marker.source,
            timestamp = %marker.timestamp,
            "Invalidation marker posted"
        );
        return Ok(());
    }

    info!(remote = remote.name(), url = %config.remote_url, "Remote data service configured");

    let kv: Arc<dyn KeyValueStore> = if config.no_persist {
        info!("Persistence disabled; snapshot kept in memory");
        Arc::new(MemoryStore::new())
    } else {
        let db = Database::open(&config.database_path)?;
        info!("Database opened: {}", config.database_path);
        Arc::new(db)
    };
    let store = SnapshotStore::open(kv);

    let identity = Arc::new(LocalIdentityProvider::new(
        config.user_id.clone().map(Identity::new),
    ));
    let controller = SyncController::new(
        Arc::new(remote),
        store,
        identity.clone(),
        Arc::new(SystemClock),
        config.sync_settings(),
    );

    // A failed start still serves the persisted snapshot; the background
    // loop keeps trying and /api/retry forces an attempt.
    if let Err(e) = controller.ensure_initialized().await {
        warn!("Starting without a fresh snapshot: {}", e);
    }
    let handle = controller.start();

    let app = status::router(AppState {
        controller: controller.clone(),
        identity,
    });
    let addr: SocketAddr = config
        .status_addr
        .parse()
        .with_context(|| format!("Invalid status address: {}", config.status_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Status API listening on http://{}", addr);

    // Run status server (blocks until Ctrl-C)
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    handle.shutdown();
    info!("Shut down");
    Ok(())
}
