//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use satchel_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_MAX_UPLOAD_SIZE};

/// Used when `HANDLE_SECRET` is unset. Handles minted with it are only as
/// private as this source file.
const DEV_HANDLE_SECRET: &str = "satchel-development-handle-secret";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH`
    /// Default: `./satchel.db`
    pub database_path: PathBuf,

    /// Root directory of the content-addressed blob files.
    /// Env: `STORAGE_ROOT`
    /// Default: `./attachments`
    pub storage_root: PathBuf,

    /// Maximum upload size in bytes.
    /// Env: `MAX_UPLOAD_SIZE`
    /// Default: 25 MiB
    pub max_upload_size: u64,

    /// Secret the download-handle key is derived from.
    /// Env: `HANDLE_SECRET`
    pub handle_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./satchel.db"),
            storage_root: PathBuf::from("./attachments"),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            handle_secret: DEV_HANDLE_SECRET.to_string(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("storage_root", &self.storage_root)
            .field("max_upload_size", &self.max_upload_size)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = var("STORAGE_ROOT") {
            config.storage_root = PathBuf::from(path);
        }

        if let Some(val) = var("MAX_UPLOAD_SIZE") {
            match val.trim().parse::<u64>() {
                Ok(n) if n > 0 => config.max_upload_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_UPLOAD_SIZE, using default"),
            }
        }

        if let Some(secret) = var("HANDLE_SECRET").filter(|s| !s.is_empty()) {
            config.handle_secret = secret;
        }

        config
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.handle_secret == DEV_HANDLE_SECRET
    }
}
