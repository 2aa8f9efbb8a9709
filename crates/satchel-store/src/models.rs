//! Row structs for the attachment tables.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use satchel_shared::{BlobId, GrantKind, MessageId, QueueItemKind, QueueStatus, UserId};

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// A stored binary object, shared by every grant that points at it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blob {
    /// Internal row id.
    pub id: BlobId,
    /// Stable external identifier.
    pub uuid: Uuid,
    /// Hex BLAKE3 digest of the full content. Unique.
    pub content_hash: String,
    /// Size in bytes.
    pub size: i64,
    /// MIME type declared by the first uploader.
    pub mime_type: String,
    /// Lower-cased file extension hint, without the dot.
    pub extension: Option<String>,
    /// Path of the bytes, relative to the storage root.
    pub storage_location: String,
    /// Number of live grants (never negative).
    pub reference_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AccessGrant
// ---------------------------------------------------------------------------

/// Visibility of one blob to one user, optionally scoped to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessGrant {
    pub id: i64,
    pub user_id: UserId,
    pub blob_id: BlobId,
    /// `None` while the grant is pending (uploaded, not yet sent).
    pub message_id: Option<MessageId>,
    pub kind: GrantKind,
    /// Name the user gave the file, independent of the stored name.
    pub display_filename: String,
    /// Declared attachment order within the message.
    pub position: i64,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One entry of an attachment list, as rendered by the inbox and sent views.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisibleAttachment {
    pub grant_id: i64,
    pub blob_id: BlobId,
    pub blob_uuid: Uuid,
    pub display_filename: String,
    pub kind: GrantKind,
    pub position: i64,
    pub size: i64,
    pub mime_type: String,
    pub extension: Option<String>,
}

/// What a [`Database::revoke`](crate::Database::revoke) call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Revocation {
    /// No live grant matched; nothing changed.
    NoMatch,
    /// A grant was revoked and the blob's count dropped to `remaining`.
    Revoked {
        blob_id: BlobId,
        remaining: i64,
        /// A blob deletion item was queued by this call.
        enqueued: bool,
    },
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The slice of a mail message the attachment core cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub user_id: UserId,
    /// Mailbox folder on the remote server, e.g. `INBOX` or `Sent`.
    pub folder: String,
    /// Server-side UID, if the message exists remotely.
    pub remote_uid: Option<u32>,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields supplied when recording a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub user_id: UserId,
    pub folder: String,
    pub remote_uid: Option<u32>,
    pub subject: String,
}

/// A recipient's copy of a sent message, created by [`Database::deliver_copy`].
///
/// [`Database::deliver_copy`]: crate::Database::deliver_copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: MessageId,
    /// Attachments shared with the recipient.
    pub attachments: usize,
}

/// Local effect of permanently dropping a message record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDrop {
    /// Live grants that were still attached and got released.
    pub released_grants: usize,
    /// Blobs that reached zero references and were queued for deletion.
    pub queued_blobs: Vec<BlobId>,
}

// ---------------------------------------------------------------------------
// DeletionQueueItem
// ---------------------------------------------------------------------------

/// A unit of asynchronous reclamation work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub kind: QueueItemKind,
    pub target_id: i64,
    /// Storage location of the blob at the time it was queued.
    pub file_path: Option<String>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
