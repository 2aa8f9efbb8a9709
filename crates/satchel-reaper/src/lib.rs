//! # satchel-reaper
//!
//! Batch worker that drains the deletion queue: removes messages from the
//! remote mailbox (best effort) and from the database, and physically
//! destroys blobs nothing references any more.
//!
//! One run processes one batch and exits. Runs are kept from overlapping by
//! a lock file ([`RunLock`]).

pub mod config;
pub mod error;
pub mod imap;
pub mod lock;
pub mod mailbox;
pub mod processor;

pub use config::ReaperConfig;
pub use error::{MailboxError, ReaperError};
pub use lock::RunLock;
pub use mailbox::{MailboxConnector, MailboxSession, SessionPool};
pub use processor::{BatchReport, BatchSettings, Processor};
