//! Deletion-queue rows.
//!
//! Producers insert with `INSERT OR IGNORE` against the partial unique index
//! on live `(item_kind, target_id)` pairs, so queuing the same target twice
//! while an item for it is pending or in flight is a no-op.
//!
//! Retry policy: a failed attempt goes back to `pending` with
//! `scheduled_at = now + 30s * 2^(attempts - 1)` (capped at one hour) until
//! the attempt ceiling, after which the item is parked as `failed`.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use satchel_shared::constants::{MAX_QUEUE_ATTEMPTS, RETRY_BASE_DELAY_SECS, RETRY_MAX_DELAY_SECS};
use satchel_shared::{QueueItemKind, QueueStatus};

use crate::database::{parse_text, parse_ts, ts, Database};
use crate::error::{not_found, Result};
use crate::models::QueueItem;

const ITEM_COLUMNS: &str =
    "id, item_kind, target_id, file_path, status, attempts, last_error, scheduled_at, updated_at";

/// Delay before the next attempt of an item that has failed `attempts` times.
pub fn retry_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let secs = RETRY_BASE_DELAY_SECS.saturating_mul(1i64 << exp);
    Duration::seconds(secs.min(RETRY_MAX_DELAY_SECS))
}

/// Queue a target unless a live item for it already exists.
///
/// Returns whether a row was inserted.
pub(crate) fn enqueue_in(
    conn: &Connection,
    kind: QueueItemKind,
    target_id: i64,
    file_path: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO deletion_queue
             (item_kind, target_id, file_path, status, attempts, scheduled_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
        params![kind.as_str(), target_id, file_path, ts(now)],
    )?;
    if inserted > 0 {
        tracing::debug!(kind = %kind, target_id, "queued for deletion");
    }
    Ok(inserted > 0)
}

pub(crate) fn has_live_item_in(conn: &Connection, kind: QueueItemKind, target_id: i64) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM deletion_queue
             WHERE item_kind = ?1 AND target_id = ?2 AND status IN ('pending', 'processing')",
            params![kind.as_str(), target_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn record_failure_in(conn: &Connection, id: i64, error: &str, now: DateTime<Utc>) -> Result<QueueStatus> {
    let attempts: u32 = conn
        .query_row(
            "UPDATE deletion_queue SET attempts = attempts + 1 WHERE id = ?1 RETURNING attempts",
            params![id],
            |row| row.get(0),
        )
        .map_err(not_found)?;

    let status = if attempts >= MAX_QUEUE_ATTEMPTS {
        QueueStatus::Failed
    } else {
        QueueStatus::Pending
    };
    let scheduled_at = now + retry_delay(attempts);

    conn.execute(
        "UPDATE deletion_queue
         SET status = ?2, last_error = ?3, scheduled_at = ?4, updated_at = ?5
         WHERE id = ?1",
        params![id, status.as_str(), error, ts(scheduled_at), ts(now)],
    )?;
    Ok(status)
}

impl Database {
    /// Queue a message for permanent deletion (called by the mail UI).
    pub fn enqueue_message_deletion(&self, message_id: satchel_shared::MessageId) -> Result<bool> {
        enqueue_in(self.conn(), QueueItemKind::Message, message_id.0, None, Utc::now())
    }

    pub fn enqueue(&self, kind: QueueItemKind, target_id: i64, file_path: Option<&str>) -> Result<bool> {
        enqueue_in(self.conn(), kind, target_id, file_path, Utc::now())
    }

    pub fn has_live_queue_item(&self, kind: QueueItemKind, target_id: i64) -> Result<bool> {
        has_live_item_in(self.conn(), kind, target_id)
    }

    /// Move up to `limit` due pending items to `processing`, oldest schedule
    /// first, and return them.
    pub fn claim_batch(&mut self, limit: usize, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        self.immediate(|tx| {
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM deletion_queue
                     WHERE status = 'pending' AND scheduled_at <= ?1
                     ORDER BY scheduled_at ASC, id ASC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![ts(now), limit as i64], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                let item = tx.query_row(
                    &format!(
                        "UPDATE deletion_queue SET status = 'processing', updated_at = ?2
                         WHERE id = ?1 RETURNING {ITEM_COLUMNS}"
                    ),
                    params![id, ts(now)],
                    row_to_item,
                )?;
                items.push(item);
            }
            Ok(items)
        })
    }

    pub fn complete_queue_item(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE deletion_queue SET status = 'completed', last_error = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Count a failed attempt and reschedule or park the item.
    pub fn record_queue_failure(&mut self, id: i64, error: &str, now: DateTime<Utc>) -> Result<QueueStatus> {
        self.immediate(|tx| record_failure_in(tx, id, error, now))
    }

    /// Hand a claimed item back untouched (the batch ran out of time).
    pub fn release_queue_item(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE deletion_queue SET status = 'pending', updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Items still `processing` when a run starts were abandoned by a run
    /// that crashed. Count the lost attempt and make them eligible again.
    pub fn recover_interrupted(&mut self, now: DateTime<Utc>) -> Result<Vec<(i64, QueueStatus)>> {
        self.immediate(|tx| {
            let ids: Vec<i64> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM deletion_queue WHERE status = 'processing'")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let status = record_failure_in(tx, id, "interrupted before completion", now)?;
                out.push((id, status));
            }
            Ok(out)
        })
    }

    pub fn get_queue_item(&self, id: i64) -> Result<QueueItem> {
        self.conn()
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM deletion_queue WHERE id = ?1"),
                params![id],
                row_to_item,
            )
            .map_err(not_found)
    }

    /// All items for a target, oldest first.
    pub fn queue_items_for(&self, kind: QueueItemKind, target_id: i64) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM deletion_queue
             WHERE item_kind = ?1 AND target_id = ?2
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![kind.as_str(), target_id], row_to_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub fn count_queue_items(&self, status: QueueStatus) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM deletion_queue WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;
    let scheduled: String = row.get(7)?;
    let updated: String = row.get(8)?;

    Ok(QueueItem {
        id: row.get(0)?,
        kind: parse_text(1, &kind)?,
        target_id: row.get(2)?,
        file_path: row.get(3)?,
        status: parse_text(4, &status)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        scheduled_at: parse_ts(7, &scheduled)?,
        updated_at: parse_ts(8, &updated)?,
    })
}
