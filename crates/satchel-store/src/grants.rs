//! Access ledger.
//!
//! A grant makes a blob visible to one user, either as a pending upload on
//! the compose form or attached to a message. Grants are never deleted by
//! revocation, only flagged, so the table doubles as an audit trail.
//!
//! Reference counting: ingestion accounts for the uploader's grant, so a
//! pending grant and its later promotion leave the count alone. A grant
//! created directly for a message (a local recipient receiving an already
//! stored blob) adds one. Revocation always takes one away, and the call
//! that takes the count to zero queues the blob for deletion in the same
//! transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use satchel_shared::{BlobId, GrantKind, MessageId, QueueItemKind, UserId};

use crate::database::{parse_text, parse_ts, ts, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::{AccessGrant, Revocation, VisibleAttachment};
use crate::queue::enqueue_in;

const GRANT_COLUMNS: &str = "id, user_id, blob_id, message_id, kind, display_filename, position,
     revoked, revoked_at, created_at";

fn next_position(conn: &Connection, user: UserId, message: Option<MessageId>) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM access_grants
         WHERE user_id = ?1 AND message_id IS ?2",
        params![user.0, message.map(|m| m.0)],
        |row| row.get(0),
    )?)
}

fn check_kind(kind: GrantKind, message: Option<MessageId>) -> Result<()> {
    match (kind.is_message_bound(), message.is_some()) {
        (false, true) => Err(StoreError::InvalidGrant("pending grants carry no message")),
        (true, false) => Err(StoreError::InvalidGrant("sender/recipient grants need a message")),
        _ => Ok(()),
    }
}

fn row_exists(conn: &Connection, sql: &str, id: i64) -> Result<bool> {
    Ok(conn.query_row(sql, params![id], |_| Ok(())).optional()?.is_some())
}

/// Insert a grant row at the end of its list. Message-bound kinds add a
/// reference; a pending grant stands for the reference its ingest counted.
pub(crate) fn insert_grant_in(
    conn: &Connection,
    user: UserId,
    blob: BlobId,
    message: Option<MessageId>,
    kind: GrantKind,
    display_name: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let position = next_position(conn, user, message)?;
    conn.execute(
        "INSERT INTO access_grants
             (user_id, blob_id, message_id, kind, display_filename, position, revoked, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        params![
            user.0,
            blob.0,
            message.map(|m| m.0),
            kind.as_str(),
            display_name,
            position,
            ts(now),
        ],
    )?;
    let grant_id = conn.last_insert_rowid();

    if kind.is_message_bound() {
        conn.execute(
            "UPDATE blobs SET reference_count = reference_count + 1, last_accessed_at = ?2
             WHERE id = ?1",
            params![blob.0, ts(now)],
        )?;
    }

    debug!(grant_id, user_id = %user, blob_id = %blob, kind = %kind, "granted");
    Ok(grant_id)
}

/// Flag one grant revoked and release its reference.
///
/// Returns the blob's remaining count and whether this call queued the blob.
pub(crate) fn revoke_grant_in(
    conn: &Connection,
    grant_id: i64,
    blob_id: BlobId,
    now: DateTime<Utc>,
) -> Result<(i64, bool)> {
    conn.execute(
        "UPDATE access_grants SET revoked = 1, revoked_at = ?2 WHERE id = ?1 AND revoked = 0",
        params![grant_id, ts(now)],
    )?;

    let decremented: Option<(i64, String)> = conn
        .query_row(
            "UPDATE blobs SET reference_count = reference_count - 1
             WHERE id = ?1 AND reference_count > 0
             RETURNING reference_count, storage_location",
            params![blob_id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    // Only the transition to zero queues the blob. A count that was already
    // zero means someone else made that transition and queued it.
    match decremented {
        Some((0, location)) => {
            let enqueued = enqueue_in(conn, QueueItemKind::Blob, blob_id.0, Some(&location), now)?;
            Ok((0, enqueued))
        }
        Some((remaining, _)) => Ok((remaining, false)),
        None => Ok((0, false)),
    }
}

impl Database {
    /// Make `blob` visible to `user`.
    ///
    /// Pending grants (`message == None`) belong to an upload that ingestion
    /// already counted. Message-bound grants add a reference.
    pub fn grant(
        &mut self,
        user: UserId,
        blob: BlobId,
        message: Option<MessageId>,
        kind: GrantKind,
        display_name: &str,
    ) -> Result<i64> {
        check_kind(kind, message)?;
        let now = Utc::now();

        self.immediate(|tx| {
            if !row_exists(tx, "SELECT 1 FROM blobs WHERE id = ?1", blob.0)? {
                return Err(StoreError::NotFound);
            }
            if let Some(m) = message {
                if !row_exists(tx, "SELECT 1 FROM messages WHERE id = ?1", m.0)? {
                    return Err(StoreError::NotFound);
                }
            }

            insert_grant_in(tx, user, blob, message, kind, display_name, now)
        })
    }

    /// Attach a pending upload to a message at send time.
    ///
    /// Only the message id and kind change; the reference was counted when
    /// the bytes were ingested. Returns false if the grant is not a live
    /// pending grant of `user`.
    pub fn promote_grant(
        &mut self,
        grant_id: i64,
        user: UserId,
        message: MessageId,
        kind: GrantKind,
    ) -> Result<bool> {
        check_kind(kind, Some(message))?;

        self.immediate(|tx| {
            if !row_exists(tx, "SELECT 1 FROM messages WHERE id = ?1", message.0)? {
                return Err(StoreError::NotFound);
            }
            let position = next_position(tx, user, Some(message))?;
            let affected = tx.execute(
                "UPDATE access_grants SET message_id = ?3, kind = ?4, position = ?5
                 WHERE id = ?1 AND user_id = ?2 AND kind = 'pending' AND revoked = 0",
                params![grant_id, user.0, message.0, kind.as_str(), position],
            )?;
            Ok(affected > 0)
        })
    }

    /// Revoke `user`'s live grant on `blob` within `message` (or the pending
    /// grant when `message` is `None`).
    ///
    /// Retrying after a grant is already revoked matches nothing and changes
    /// nothing, so a blob is queued at most once per transition to zero.
    pub fn revoke(
        &mut self,
        user: UserId,
        blob: BlobId,
        message: Option<MessageId>,
    ) -> Result<Revocation> {
        let now = Utc::now();
        self.immediate(|tx| {
            let grant_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM access_grants
                     WHERE user_id = ?1 AND blob_id = ?2 AND message_id IS ?3 AND revoked = 0
                     ORDER BY id ASC LIMIT 1",
                    params![user.0, blob.0, message.map(|m| m.0)],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(grant_id) = grant_id else {
                return Ok(Revocation::NoMatch);
            };

            let (remaining, enqueued) = revoke_grant_in(tx, grant_id, blob, now)?;
            info!(grant_id, blob_id = %blob, remaining, enqueued, "revoked grant");
            Ok(Revocation::Revoked { blob_id: blob, remaining, enqueued })
        })
    }

    /// Revoke one of `user`'s pending uploads by grant id.
    ///
    /// The same bytes uploaded twice give two pending grants on one blob;
    /// only the named one is released.
    pub fn revoke_pending(&mut self, user: UserId, grant_id: i64) -> Result<Revocation> {
        let now = Utc::now();
        self.immediate(|tx| {
            let blob: Option<i64> = tx
                .query_row(
                    "SELECT blob_id FROM access_grants
                     WHERE id = ?1 AND user_id = ?2 AND kind = 'pending' AND revoked = 0",
                    params![grant_id, user.0],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(blob) = blob.map(BlobId) else {
                return Ok(Revocation::NoMatch);
            };

            let (remaining, enqueued) = revoke_grant_in(tx, grant_id, blob, now)?;
            info!(grant_id, blob_id = %blob, remaining, enqueued, "discarded pending upload");
            Ok(Revocation::Revoked { blob_id: blob, remaining, enqueued })
        })
    }

    /// Revoke every live grant `user` holds within `message`.
    pub fn revoke_message_grants(&mut self, user: UserId, message: MessageId) -> Result<Vec<Revocation>> {
        let now = Utc::now();
        self.immediate(|tx| revoke_message_grants_in(tx, user, message, now))
    }

    /// Live attachments of `message` as seen by `user`, in declared order.
    /// With `message == None`, lists the user's pending uploads.
    pub fn list_visible(&self, user: UserId, message: Option<MessageId>) -> Result<Vec<VisibleAttachment>> {
        let mut stmt = self.conn().prepare(
            "SELECT g.id, g.blob_id, b.uuid, g.display_filename, g.kind, g.position,
                    b.size, b.mime_type, b.extension
             FROM access_grants g
             JOIN blobs b ON b.id = g.blob_id
             WHERE g.user_id = ?1 AND g.message_id IS ?2 AND g.revoked = 0
             ORDER BY g.position ASC, g.id ASC",
        )?;

        let rows = stmt.query_map(params![user.0, message.map(|m| m.0)], |row| {
            let uuid: String = row.get(2)?;
            let kind: String = row.get(4)?;
            Ok(VisibleAttachment {
                grant_id: row.get(0)?,
                blob_id: BlobId(row.get(1)?),
                blob_uuid: parse_text(2, &uuid)?,
                display_filename: row.get(3)?,
                kind: parse_text(4, &kind)?,
                position: row.get(5)?,
                size: row.get(6)?,
                mime_type: row.get(7)?,
                extension: row.get(8)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Whether `user` holds a live grant on `blob`.
    pub fn can_access(&self, user: UserId, blob: BlobId) -> Result<bool> {
        Ok(self
            .conn()
            .query_row(
                "SELECT 1 FROM access_grants WHERE user_id = ?1 AND blob_id = ?2 AND revoked = 0",
                params![user.0, blob.0],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    pub fn get_grant(&self, id: i64) -> Result<AccessGrant> {
        self.conn()
            .query_row(
                &format!("SELECT {GRANT_COLUMNS} FROM access_grants WHERE id = ?1"),
                params![id],
                row_to_grant,
            )
            .map_err(not_found)
    }

    /// Every grant ever made on `blob`, revoked ones included.
    pub fn grants_for_blob(&self, blob: BlobId) -> Result<Vec<AccessGrant>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GRANT_COLUMNS} FROM access_grants WHERE blob_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![blob.0], row_to_grant)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn live_grant_count(&self, blob: BlobId) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM access_grants WHERE blob_id = ?1 AND revoked = 0",
            params![blob.0],
            |row| row.get(0),
        )?)
    }
}

pub(crate) fn revoke_message_grants_in(
    conn: &Connection,
    user: UserId,
    message: MessageId,
    now: DateTime<Utc>,
) -> Result<Vec<Revocation>> {
    let live: Vec<(i64, i64)> = {
        let mut stmt = conn.prepare(
            "SELECT id, blob_id FROM access_grants
             WHERE user_id = ?1 AND message_id = ?2 AND revoked = 0
             ORDER BY position ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![user.0, message.0], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut out = Vec::with_capacity(live.len());
    for (grant_id, blob_id) in live {
        let blob_id = BlobId(blob_id);
        let (remaining, enqueued) = revoke_grant_in(conn, grant_id, blob_id, now)?;
        out.push(Revocation::Revoked { blob_id, remaining, enqueued });
    }
    Ok(out)
}

fn row_to_grant(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessGrant> {
    let kind: String = row.get(4)?;
    let revoked: i32 = row.get(7)?;
    let revoked_at: Option<String> = row.get(8)?;
    let created: String = row.get(9)?;
    let message_id: Option<i64> = row.get(3)?;

    Ok(AccessGrant {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        blob_id: BlobId(row.get(2)?),
        message_id: message_id.map(MessageId),
        kind: parse_text(4, &kind)?,
        display_filename: row.get(5)?,
        position: row.get(6)?,
        revoked: revoked != 0,
        revoked_at: revoked_at.map(|s| parse_ts(8, &s)).transpose()?,
        created_at: parse_ts(9, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::{fixture, Fixture};
    use crate::models::NewMessage;
    use satchel_shared::QueueStatus;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    fn message(fx: &Fixture, user: UserId) -> MessageId {
        fx.db
            .insert_message(&NewMessage {
                user_id: user,
                folder: "Sent".into(),
                remote_uid: None,
                subject: "hello".into(),
            })
            .unwrap()
    }

    fn upload(fx: &mut Fixture, user: UserId, bytes: &[u8], name: &str) -> (BlobId, i64) {
        let out = fx.db.ingest(&fx.files, bytes, name, "application/pdf").unwrap();
        let grant = fx
            .db
            .grant(user, out.blob_id, None, GrantKind::Pending, name)
            .unwrap();
        (out.blob_id, grant)
    }

    #[test]
    fn test_pending_grant_does_not_count() {
        let mut fx = fixture();
        let (blob, _) = upload(&mut fx, ALICE, b"doc", "doc.pdf");
        assert_eq!(fx.db.reference_count(blob).unwrap(), 1);
        assert_eq!(fx.db.live_grant_count(blob).unwrap(), 1);
    }

    #[test]
    fn test_invalid_kind_message_pairs_rejected() {
        let mut fx = fixture();
        let (blob, _) = upload(&mut fx, ALICE, b"doc", "doc.pdf");
        let msg = message(&fx, ALICE);
        assert!(matches!(
            fx.db.grant(ALICE, blob, Some(msg), GrantKind::Pending, "x"),
            Err(StoreError::InvalidGrant(_))
        ));
        assert!(matches!(
            fx.db.grant(ALICE, blob, None, GrantKind::Sender, "x"),
            Err(StoreError::InvalidGrant(_))
        ));
        assert!(matches!(
            fx.db.grant(ALICE, BlobId(404), None, GrantKind::Pending, "x"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_promote_keeps_count_and_orders_attachments() {
        let mut fx = fixture();
        let (first, g1) = upload(&mut fx, ALICE, b"one", "one.pdf");
        let (second, g2) = upload(&mut fx, ALICE, b"two", "two.pdf");
        let msg = message(&fx, ALICE);

        assert!(fx.db.promote_grant(g2, ALICE, msg, GrantKind::Sender).unwrap());
        assert!(fx.db.promote_grant(g1, ALICE, msg, GrantKind::Sender).unwrap());
        // Already promoted: no longer pending.
        assert!(!fx.db.promote_grant(g1, ALICE, msg, GrantKind::Sender).unwrap());
        // Not Bob's grant.
        assert!(!fx.db.promote_grant(g1, BOB, msg, GrantKind::Sender).unwrap());

        assert_eq!(fx.db.reference_count(first).unwrap(), 1);
        assert_eq!(fx.db.reference_count(second).unwrap(), 1);

        let listed = fx.db.list_visible(ALICE, Some(msg)).unwrap();
        let names: Vec<&str> = listed.iter().map(|a| a.display_filename.as_str()).collect();
        assert_eq!(names, vec!["two.pdf", "one.pdf"]);
        assert!(listed.iter().all(|a| a.kind == GrantKind::Sender));
        assert!(fx.db.list_visible(ALICE, None).unwrap().is_empty());
    }

    #[test]
    fn test_recipient_grant_adds_reference() {
        let mut fx = fixture();
        let (blob, g) = upload(&mut fx, ALICE, b"shared", "s.pdf");
        let sent = message(&fx, ALICE);
        let inbox = message(&fx, BOB);
        fx.db.promote_grant(g, ALICE, sent, GrantKind::Sender).unwrap();
        fx.db
            .grant(BOB, blob, Some(inbox), GrantKind::Recipient, "s.pdf")
            .unwrap();

        assert_eq!(fx.db.reference_count(blob).unwrap(), 2);
        assert!(fx.db.can_access(BOB, blob).unwrap());
        assert_eq!(fx.db.list_visible(BOB, Some(inbox)).unwrap().len(), 1);
    }

    #[test]
    fn test_revoke_last_grant_enqueues_exactly_once() {
        let mut fx = fixture();
        let (blob, _) = upload(&mut fx, ALICE, b"bye", "bye.pdf");

        let first = fx.db.revoke(ALICE, blob, None).unwrap();
        assert_eq!(
            first,
            Revocation::Revoked { blob_id: blob, remaining: 0, enqueued: true }
        );
        // Retried revoke is a no-op.
        assert_eq!(fx.db.revoke(ALICE, blob, None).unwrap(), Revocation::NoMatch);
        assert_eq!(fx.db.reference_count(blob).unwrap(), 0);

        let items = fx.db.queue_items_for(QueueItemKind::Blob, blob.0).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Pending);
        let location = fx.db.get_blob(blob).unwrap().storage_location;
        assert_eq!(items[0].file_path.as_deref(), Some(location.as_str()));

        let grant = &fx.db.grants_for_blob(blob).unwrap()[0];
        assert!(grant.revoked);
        assert!(grant.revoked_at.is_some());
    }

    #[test]
    fn test_count_is_ingests_minus_revokes() {
        let mut fx = fixture();
        let mut blob = BlobId(0);
        for _ in 0..3 {
            blob = upload(&mut fx, ALICE, b"repeat", "r.pdf").0;
        }
        assert_eq!(fx.db.reference_count(blob).unwrap(), 3);

        fx.db.revoke(ALICE, blob, None).unwrap();
        fx.db.revoke(ALICE, blob, None).unwrap();
        assert_eq!(fx.db.reference_count(blob).unwrap(), 1);
        assert_eq!(fx.db.live_grant_count(blob).unwrap(), 1);
        assert!(fx.db.queue_items_for(QueueItemKind::Blob, blob.0).unwrap().is_empty());

        fx.db.revoke(ALICE, blob, None).unwrap();
        // Nothing left to revoke; the count never goes negative.
        fx.db.revoke(ALICE, blob, None).unwrap();
        assert_eq!(fx.db.reference_count(blob).unwrap(), 0);
    }

    #[test]
    fn test_revoke_pending_targets_the_named_grant() {
        let mut fx = fixture();
        let (blob, first) = upload(&mut fx, ALICE, b"twice", "a.pdf");
        let (_, second) = upload(&mut fx, ALICE, b"twice", "b.pdf");

        assert_eq!(
            fx.db.revoke_pending(ALICE, second).unwrap(),
            Revocation::Revoked { blob_id: blob, remaining: 1, enqueued: false }
        );
        assert!(!fx.db.get_grant(first).unwrap().revoked);
        assert!(fx.db.get_grant(second).unwrap().revoked);

        let left: Vec<String> = fx
            .db
            .list_visible(ALICE, None)
            .unwrap()
            .into_iter()
            .map(|a| a.display_filename)
            .collect();
        assert_eq!(left, vec!["a.pdf"]);

        // Already revoked, someone else's, or not pending: nothing happens.
        assert_eq!(fx.db.revoke_pending(ALICE, second).unwrap(), Revocation::NoMatch);
        assert_eq!(fx.db.revoke_pending(BOB, first).unwrap(), Revocation::NoMatch);
        let msg = message(&fx, ALICE);
        fx.db.promote_grant(first, ALICE, msg, GrantKind::Sender).unwrap();
        assert_eq!(fx.db.revoke_pending(ALICE, first).unwrap(), Revocation::NoMatch);
        assert_eq!(fx.db.reference_count(blob).unwrap(), 1);
    }

    #[test]
    fn test_revoke_message_grants() {
        let mut fx = fixture();
        let (a, ga) = upload(&mut fx, ALICE, b"a", "a.pdf");
        let (b, gb) = upload(&mut fx, ALICE, b"b", "b.pdf");
        let msg = message(&fx, ALICE);
        fx.db.promote_grant(ga, ALICE, msg, GrantKind::Sender).unwrap();
        fx.db.promote_grant(gb, ALICE, msg, GrantKind::Sender).unwrap();

        let revoked = fx.db.revoke_message_grants(ALICE, msg).unwrap();
        assert_eq!(revoked.len(), 2);
        assert_eq!(fx.db.reference_count(a).unwrap(), 0);
        assert_eq!(fx.db.reference_count(b).unwrap(), 0);
        assert!(fx.db.list_visible(ALICE, Some(msg)).unwrap().is_empty());
        assert!(!fx.db.can_access(ALICE, a).unwrap());
    }
}
