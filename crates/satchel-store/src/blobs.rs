//! Content-hash store.
//!
//! A blob row exists once per distinct content hash. Ingesting bytes that are
//! already stored bumps the row's reference count instead of writing a second
//! copy. All count changes are single `UPDATE ... reference_count +/- 1`
//! statements run under the write lock taken by `BEGIN IMMEDIATE`.

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use satchel_shared::{BlobId, ContentHash, GrantKind, UserId};

use crate::database::{parse_ts, ts, Database};
use crate::error::{is_constraint_violation, not_found, Result, StoreError};
use crate::files::{BlobFiles, SpooledUpload};
use crate::grants::insert_grant_in;
use crate::models::Blob;

const BLOB_COLUMNS: &str = "id, uuid, content_hash, size, mime_type, extension, storage_location,
     reference_count, created_at, last_accessed_at";

const DEFAULT_MIME: &str = "application/octet-stream";

/// Result of [`Database::ingest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingested {
    pub blob_id: BlobId,
    pub uuid: Uuid,
    /// `false` when the content was already stored and only its count moved.
    pub was_new: bool,
    pub size: u64,
}

/// Result of [`Database::ingest_pending`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub grant_id: i64,
    pub ingested: Ingested,
}

/// Outcome of [`Database::reclaim_blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// The row was deleted. `file_removed` is false if the file was already gone.
    Deleted { file_removed: bool },
    /// The blob gained a reference since it was queued; nothing was touched.
    Resurrected { reference_count: i64 },
    /// No row with that id exists any more.
    Missing { file_removed: bool },
}

fn extension_hint(declared_name: &str) -> Option<String> {
    Path::new(declared_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 16)
        .map(|e| e.to_ascii_lowercase())
}

/// Bump the count of an existing blob by hash. Returns `(id, uuid, location)`.
fn increment_by_hash(
    conn: &Connection,
    hash: &ContentHash,
    now: DateTime<Utc>,
) -> Result<Option<(BlobId, Uuid, String)>> {
    let hit = conn
        .query_row(
            "UPDATE blobs
             SET reference_count = reference_count + 1, last_accessed_at = ?2
             WHERE content_hash = ?1
             RETURNING id, uuid, storage_location",
            params![hash.to_hex(), ts(now)],
            |row| {
                let id: i64 = row.get(0)?;
                let uuid: String = row.get(1)?;
                let location: String = row.get(2)?;
                Ok((id, uuid, location))
            },
        )
        .optional()?;

    match hit {
        Some((id, uuid, location)) => Ok(Some((
            BlobId(id),
            Uuid::parse_str(&uuid).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            location,
        ))),
        None => Ok(None),
    }
}

/// Finish a dedup hit: the spooled copy is discarded unless the stored file
/// has gone missing, in which case it takes its place.
fn settle_dedup_hit(files: &BlobFiles, spooled: SpooledUpload, id: BlobId, location: &str) -> Result<()> {
    if !files.exists(location)? {
        warn!(blob_id = %id, "stored file missing on dedup hit, restoring from upload");
        files.place(spooled, location)?;
    }
    Ok(())
}

/// Count or store spooled bytes. Runs under the write lock.
fn ingest_spooled_in(
    conn: &Connection,
    files: &BlobFiles,
    spooled: SpooledUpload,
    declared_name: &str,
    declared_mime: &str,
    now: DateTime<Utc>,
) -> Result<Ingested> {
    let hash = *spooled.hash();
    let size = spooled.size();
    if let Some((blob_id, uuid, location)) = increment_by_hash(conn, &hash, now)? {
        settle_dedup_hit(files, spooled, blob_id, &location)?;
        debug!(blob_id = %blob_id, "ingest dedup hit");
        return Ok(Ingested { blob_id, uuid, was_new: false, size });
    }
    insert_or_count_in(conn, files, spooled, declared_name, declared_mime, now)
}

/// Insert a row for content with no row yet. If another writer inserted the
/// same hash first, the unique index rejects ours and the call becomes a
/// dedup hit on theirs.
fn insert_or_count_in(
    conn: &Connection,
    files: &BlobFiles,
    spooled: SpooledUpload,
    declared_name: &str,
    declared_mime: &str,
    now: DateTime<Utc>,
) -> Result<Ingested> {
    let hash = *spooled.hash();
    let size = spooled.size();
    let location = BlobFiles::location_for(&hash);
    let uuid = Uuid::new_v4();
    let mime = match declared_mime.trim() {
        "" => DEFAULT_MIME,
        trimmed => trimmed,
    };

    let inserted = conn.execute(
        "INSERT INTO blobs (uuid, content_hash, size, mime_type, extension, storage_location,
                            reference_count, created_at, last_accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
        params![
            uuid.to_string(),
            hash.to_hex(),
            size as i64,
            mime,
            extension_hint(declared_name),
            location,
            ts(now),
        ],
    );

    match inserted {
        Ok(_) => {
            let blob_id = BlobId(conn.last_insert_rowid());
            files.place(spooled, &location)?;
            info!(blob_id = %blob_id, size, "stored new blob");
            Ok(Ingested { blob_id, uuid, was_new: true, size })
        }
        Err(e) if is_constraint_violation(&e) => {
            let (blob_id, uuid, location) =
                increment_by_hash(conn, &hash, now)?.ok_or(StoreError::NotFound)?;
            settle_dedup_hit(files, spooled, blob_id, &location)?;
            debug!(blob_id = %blob_id, "ingest lost insert race, counted as dedup hit");
            Ok(Ingested { blob_id, uuid, was_new: false, size })
        }
        Err(e) => Err(e.into()),
    }
}

impl Database {
    /// Store `reader`'s bytes, deduplicating by content hash.
    ///
    /// Returns the blob id and whether a new blob was created. An existing
    /// blob only has its reference count incremented. Nothing is left behind
    /// when reading the stream fails.
    pub fn ingest<R: Read>(
        &mut self,
        files: &BlobFiles,
        reader: R,
        declared_name: &str,
        declared_mime: &str,
    ) -> Result<Ingested> {
        let spooled = files.spool(reader)?;
        let now = Utc::now();
        self.immediate(|tx| ingest_spooled_in(tx, files, spooled, declared_name, declared_mime, now))
    }

    /// Ingest an upload and record `user`'s pending grant on it in one
    /// transaction. The reference ingestion counts never exists without the
    /// grant that accounts for it.
    pub fn ingest_pending<R: Read>(
        &mut self,
        files: &BlobFiles,
        reader: R,
        user: UserId,
        display_name: &str,
        declared_mime: &str,
    ) -> Result<PendingUpload> {
        let spooled = files.spool(reader)?;
        let now = Utc::now();
        self.immediate(|tx| {
            let ingested = ingest_spooled_in(tx, files, spooled, display_name, declared_mime, now)?;
            let grant_id = insert_grant_in(
                tx,
                user,
                ingested.blob_id,
                None,
                GrantKind::Pending,
                display_name,
                now,
            )?;
            Ok(PendingUpload { grant_id, ingested })
        })
    }

    /// Record an access without changing the reference count.
    pub fn touch(&self, id: BlobId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE blobs SET last_accessed_at = ?2 WHERE id = ?1",
            params![id.0, ts(Utc::now())],
        )?;
        Ok(affected > 0)
    }

    pub fn get_blob(&self, id: BlobId) -> Result<Blob> {
        self.conn()
            .query_row(
                &format!("SELECT {BLOB_COLUMNS} FROM blobs WHERE id = ?1"),
                params![id.0],
                row_to_blob,
            )
            .map_err(not_found)
    }

    pub fn reference_count(&self, id: BlobId) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT reference_count FROM blobs WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .map_err(not_found)
    }

    /// Physically destroy a blob whose count is zero.
    ///
    /// The count is re-read under the write lock; a blob that has been
    /// referenced again is left alone. Otherwise the file is removed (already
    /// absent is fine) and then the row. `queued_location` is the path copied
    /// onto the queue item, used when the row itself is already gone.
    pub fn reclaim_blob(
        &mut self,
        files: &BlobFiles,
        id: BlobId,
        queued_location: Option<&str>,
    ) -> Result<Reclaim> {
        self.immediate(|tx| {
            let row: Option<(i64, String)> = tx
                .query_row(
                    "SELECT reference_count, storage_location FROM blobs WHERE id = ?1",
                    params![id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((reference_count, location)) = row else {
                let Some(location) = queued_location else {
                    return Ok(Reclaim::Missing { file_removed: false });
                };
                // The same content may have been stored again under a new row.
                let reused: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM blobs WHERE storage_location = ?1",
                        params![location],
                        |row| row.get(0),
                    )
                    .optional()?;
                let file_removed = match reused {
                    Some(_) => false,
                    None => files.remove(location)?,
                };
                return Ok(Reclaim::Missing { file_removed });
            };

            if reference_count > 0 {
                return Ok(Reclaim::Resurrected { reference_count });
            }

            let file_removed = files.remove(&location)?;
            tx.execute(
                "DELETE FROM blobs WHERE id = ?1 AND reference_count = 0",
                params![id.0],
            )?;
            info!(blob_id = %id, file_removed, "reclaimed blob");
            Ok(Reclaim::Deleted { file_removed })
        })
    }
}

pub(crate) fn row_to_blob(row: &rusqlite::Row<'_>) -> rusqlite::Result<Blob> {
    let uuid_str: String = row.get(1)?;
    let created_str: String = row.get(8)?;
    let accessed_str: String = row.get(9)?;

    let uuid = Uuid::parse_str(&uuid_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Blob {
        id: BlobId(row.get(0)?),
        uuid,
        content_hash: row.get(2)?,
        size: row.get(3)?,
        mime_type: row.get(4)?,
        extension: row.get(5)?,
        storage_location: row.get(6)?,
        reference_count: row.get(7)?,
        created_at: parse_ts(8, &created_str)?,
        last_accessed_at: parse_ts(9, &accessed_str)?,
    })
}
