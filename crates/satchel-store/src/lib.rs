//! # satchel-store
//!
//! Content-addressed attachment storage backed by SQLite and a local
//! directory tree.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and carries the typed operations of the three
//! tables that make up the attachment core:
//!
//! - `blobs`: one row per distinct content hash, with a reference count
//!   ([`Database::ingest`], [`Database::touch`])
//! - `access_grants`: who may see which blob in which message
//!   ([`Database::grant`], [`Database::revoke`], [`Database::list_visible`])
//! - `deletion_queue`: durable reclamation work for the reaper
//!
//! File bytes live under a [`BlobFiles`] root, addressed by hash.

pub mod blobs;
pub mod database;
pub mod files;
pub mod grants;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod queue;

mod error;

pub use blobs::{Ingested, PendingUpload, Reclaim};
pub use database::Database;
pub use error::{Result, StoreError};
pub use files::BlobFiles;
pub use models::*;
