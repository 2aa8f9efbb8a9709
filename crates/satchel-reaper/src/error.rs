use thiserror::Error;

use satchel_store::StoreError;

/// Errors talking to the remote mailbox.
#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mailbox operation timed out")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(#[from] async_native_tls::Error),

    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    #[error("Mailbox unavailable: {0}")]
    Unavailable(String),
}

/// Errors that abort a whole reaper run.
#[derive(Error, Debug)]
pub enum ReaperError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Run lock error: {0}")]
    Lock(std::io::Error),
}
