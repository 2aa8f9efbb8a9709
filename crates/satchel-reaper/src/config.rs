//! Reaper configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the reaper can run with zero
//! configuration for local development.

use std::path::PathBuf;
use std::time::Duration;

use satchel_shared::constants::DEFAULT_IMAP_PORT;

/// Credentials of the mailbox account messages are deleted from.
#[derive(Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Env: `DATABASE_PATH`
    /// Default: `./satchel.db`
    pub database_path: PathBuf,

    /// Env: `STORAGE_ROOT`
    /// Default: `./attachments`
    pub storage_root: PathBuf,

    /// Maximum number of queue items claimed per run.
    /// Env: `REAPER_BATCH_SIZE`
    /// Default: `50`
    pub batch_size: usize,

    /// Wall-clock budget of one run; unstarted items are handed back once
    /// it is spent.
    /// Env: `REAPER_BATCH_BUDGET_SECS`
    /// Default: `240`
    pub batch_budget: Duration,

    /// Per-operation timeout for remote mailbox calls.
    /// Env: `REAPER_MAILBOX_TIMEOUT_SECS`
    /// Default: `10`
    pub mailbox_timeout: Duration,

    /// Env: `REAPER_LOCK_PATH`
    /// Default: `<STORAGE_ROOT>/.reaper.lock`
    pub lock_path: PathBuf,

    /// Remote deletion is skipped entirely when `IMAP_HOST` is unset.
    /// Env: `IMAP_HOST`, `IMAP_PORT`, `IMAP_USERNAME`, `IMAP_PASSWORD`
    pub imap: Option<ImapSettings>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        let storage_root = PathBuf::from("./attachments");
        Self {
            database_path: PathBuf::from("./satchel.db"),
            lock_path: storage_root.join(".reaper.lock"),
            storage_root,
            batch_size: 50,
            batch_budget: Duration::from_secs(240),
            mailbox_timeout: Duration::from_secs(10),
            imap: None,
        }
    }
}

impl ReaperConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = var("STORAGE_ROOT") {
            config.storage_root = PathBuf::from(path);
        }
        config.lock_path = match var("REAPER_LOCK_PATH") {
            Some(path) => PathBuf::from(path),
            None => config.storage_root.join(".reaper.lock"),
        };

        if let Some(n) = parse_var(&var, "REAPER_BATCH_SIZE") {
            config.batch_size = n;
        }
        if let Some(secs) = parse_var(&var, "REAPER_BATCH_BUDGET_SECS") {
            config.batch_budget = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "REAPER_MAILBOX_TIMEOUT_SECS") {
            config.mailbox_timeout = Duration::from_secs(secs);
        }

        if let Some(host) = var("IMAP_HOST").filter(|h| !h.is_empty()) {
            config.imap = Some(ImapSettings {
                host,
                port: parse_var(&var, "IMAP_PORT").unwrap_or(DEFAULT_IMAP_PORT),
                username: var("IMAP_USERNAME").unwrap_or_default(),
                password: var("IMAP_PASSWORD").unwrap_or_default(),
            });
        }

        config
    }

    /// A lock file older than this is assumed to belong to a crashed run.
    pub fn stale_lock_after(&self) -> Duration {
        self.batch_budget * 2 + self.mailbox_timeout * 2
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
