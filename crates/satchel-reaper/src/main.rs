//! # satchel-reaper
//!
//! Drains one batch of the attachment deletion queue and exits. Meant to be
//! started by cron or a systemd timer with no arguments.
//!
//! Exit status:
//! - `0` clean run
//! - `1` at least one queue item was parked as `failed` during this run
//! - `2` another run holds the lock

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use satchel_reaper::imap::ImapConnector;
use satchel_reaper::{BatchSettings, MailboxConnector, Processor, ReaperConfig, ReaperError, RunLock};
use satchel_shared::constants::DEFAULT_MAX_UPLOAD_SIZE;
use satchel_store::{BlobFiles, Database};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,satchel_reaper=debug,satchel_store=debug")),
        )
        .init();

    let config = ReaperConfig::from_env();
    info!(?config, "Loaded configuration");

    let Some(_lock) = RunLock::acquire(&config.lock_path, config.stale_lock_after())
        .map_err(ReaperError::Lock)?
    else {
        warn!(path = %config.lock_path.display(), "another reaper run is in progress, exiting");
        return Ok(ExitCode::from(2));
    };

    let db = Database::open_at(&config.database_path)?;
    let files = BlobFiles::new(config.storage_root.clone(), DEFAULT_MAX_UPLOAD_SIZE)?;
    let connector = config
        .imap
        .clone()
        .map(|imap| Arc::new(ImapConnector::new(imap)) as Arc<dyn MailboxConnector>);
    if connector.is_none() {
        info!("IMAP_HOST not set, remote mailbox deletion disabled");
    }

    let settings = BatchSettings {
        batch_size: config.batch_size,
        budget: config.batch_budget,
        mailbox_timeout: config.mailbox_timeout,
    };
    let mut processor = Processor::new(db, files, connector, settings);
    let report = processor.run_batch().await?;

    info!(?report, "reaper run complete");
    if report.has_terminal_failures() {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
