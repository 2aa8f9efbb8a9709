use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use satchel_shared::{BlobId, GrantKind, MessageId, QueueItemKind, UserId};

use crate::database::{parse_ts, ts, Database};
use crate::error::{not_found, Result, StoreError};
use crate::grants::{insert_grant_in, revoke_message_grants_in};
use crate::models::{Delivery, Message, MessageDrop, NewMessage, Revocation};
use crate::queue::{enqueue_in, has_live_item_in};

const MESSAGE_COLUMNS: &str = "id, user_id, folder, remote_uid, subject, created_at, deleted_at";

fn insert_message_in(conn: &Connection, message: &NewMessage, now: DateTime<Utc>) -> Result<MessageId> {
    conn.execute(
        "INSERT INTO messages (user_id, folder, remote_uid, subject, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.user_id.0,
            message.folder,
            message.remote_uid,
            message.subject,
            ts(now),
        ],
    )?;
    Ok(MessageId(conn.last_insert_rowid()))
}

impl Database {
    pub fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        insert_message_in(self.conn(), message, Utc::now())
    }

    /// Record `copy` (a local recipient's instance of `sent`) and grant the
    /// recipient every attachment `sender` has live on `sent`.
    ///
    /// One transaction: either the copy exists with all its grants counted,
    /// or nothing changed.
    pub fn deliver_copy(&mut self, sender: UserId, sent: MessageId, copy: &NewMessage) -> Result<Delivery> {
        let now = Utc::now();
        self.immediate(|tx| {
            let owned = tx
                .query_row(
                    "SELECT 1 FROM messages WHERE id = ?1 AND user_id = ?2",
                    params![sent.0, sender.0],
                    |_| Ok(()),
                )
                .optional()?;
            if owned.is_none() {
                return Err(StoreError::NotFound);
            }

            let attachments: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT blob_id, display_filename FROM access_grants
                     WHERE user_id = ?1 AND message_id = ?2 AND revoked = 0
                     ORDER BY position ASC, id ASC",
                )?;
                let rows = stmt.query_map(params![sender.0, sent.0], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let message_id = insert_message_in(tx, copy, now)?;
            for (blob_id, name) in &attachments {
                insert_grant_in(
                    tx,
                    copy.user_id,
                    BlobId(*blob_id),
                    Some(message_id),
                    GrantKind::Recipient,
                    name,
                    now,
                )?;
            }
            Ok(Delivery { message_id, attachments: attachments.len() })
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// Move a message to the trash: flag it deleted and revoke the owner's
    /// grants on its attachments.
    pub fn soft_delete_message(&mut self, user: UserId, id: MessageId) -> Result<Vec<Revocation>> {
        let now = Utc::now();
        self.immediate(|tx| {
            let affected = tx.execute(
                "UPDATE messages SET deleted_at = COALESCE(deleted_at, ?3)
                 WHERE id = ?1 AND user_id = ?2",
                params![id.0, user.0, ts(now)],
            )?;
            if affected == 0 {
                return Err(StoreError::NotFound);
            }
            revoke_message_grants_in(tx, user, id, now)
        })
    }

    /// Delete the message row (its grants cascade with it).
    ///
    /// Grants still live at this point hold references, so they are released
    /// first. Afterwards every blob the message referenced is re-checked and
    /// queued if nothing references it any more. Returns `None` when the
    /// message no longer exists.
    pub fn drop_message(&mut self, id: MessageId) -> Result<Option<MessageDrop>> {
        let now = Utc::now();
        self.immediate(|tx| {
            let owner: Option<i64> = tx
                .query_row("SELECT user_id FROM messages WHERE id = ?1", params![id.0], |row| {
                    row.get(0)
                })
                .optional()?;
            if owner.is_none() {
                return Ok(None);
            }

            let grants: Vec<(i64, i64, bool)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, blob_id, revoked FROM access_grants WHERE message_id = ?1",
                )?;
                let rows = stmt.query_map(params![id.0], |row| {
                    let revoked: i32 = row.get(2)?;
                    Ok((row.get(0)?, row.get(1)?, revoked != 0))
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut report = MessageDrop::default();
            let mut blobs = BTreeSet::new();
            for (grant_id, blob_id, revoked) in grants {
                blobs.insert(blob_id);
                if !revoked {
                    crate::grants::revoke_grant_in(tx, grant_id, BlobId(blob_id), now)?;
                    report.released_grants += 1;
                }
            }

            tx.execute("DELETE FROM messages WHERE id = ?1", params![id.0])?;

            for blob_id in blobs {
                let row: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT reference_count, storage_location FROM blobs WHERE id = ?1",
                        params![blob_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((0, location)) = row else { continue };
                if has_live_item_in(tx, QueueItemKind::Blob, blob_id)? {
                    report.queued_blobs.push(BlobId(blob_id));
                    continue;
                }
                if enqueue_in(tx, QueueItemKind::Blob, blob_id, Some(&location), now)? {
                    report.queued_blobs.push(BlobId(blob_id));
                }
            }

            info!(
                message_id = %id,
                released = report.released_grants,
                queued = report.queued_blobs.len(),
                "dropped message record"
            );
            Ok(Some(report))
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let created: String = row.get(5)?;
    let deleted: Option<String> = row.get(6)?;

    Ok(Message {
        id: MessageId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        folder: row.get(2)?,
        remote_uid: row.get(3)?,
        subject: row.get(4)?,
        created_at: parse_ts(5, &created)?,
        deleted_at: deleted.map(|s| parse_ts(6, &s)).transpose()?,
    })
}
