//! # satchel-server
//!
//! HTTP surface of the attachment store.
//!
//! This binary provides:
//! - **Upload**: content-addressed ingestion plus a pending grant for the
//!   uploader
//! - **Send flow**: promoting pending uploads onto a sent message and sharing
//!   them with local recipients
//! - **Listing and download**: attachment chips per message, downloads by
//!   opaque handle
//! - **Deletion**: trashing a message revokes its grants; purging queues it
//!   for the reaper

mod api;
mod config;
mod error;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,satchel_server=debug,satchel_store=debug,tower_http=debug")
        }))
        .init();

    info!("Starting satchel server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.uses_dev_secret() {
        warn!("Download handles are sealed with the development secret; set HANDLE_SECRET in production");
    }

    // -----------------------------------------------------------------------
    // 3. Open storage and run migrations
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState::new(config)?;
    info!(root = %app_state.files.root().display(), "Attachment storage ready");

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
