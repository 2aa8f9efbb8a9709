//! v001 -- Initial schema creation.
//!
//! Creates `messages`, `blobs`, `access_grants` and `deletion_queue`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (only the columns the attachment core needs)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL,
    folder      TEXT NOT NULL,
    remote_uid  INTEGER,                      -- IMAP UID, NULL when never synced
    subject     TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,                -- RFC-3339, UTC
    deleted_at  TEXT                          -- set by soft delete
);

CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id);

-- ----------------------------------------------------------------
-- Blobs (content-addressed file metadata)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blobs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid             TEXT NOT NULL UNIQUE,
    content_hash     TEXT NOT NULL UNIQUE,    -- hex BLAKE3, the dedup key
    size             INTEGER NOT NULL,
    mime_type        TEXT NOT NULL,
    extension        TEXT,
    storage_location TEXT NOT NULL,           -- relative to the storage root
    reference_count  INTEGER NOT NULL DEFAULT 0 CHECK (reference_count >= 0),
    created_at       TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Access grants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS access_grants (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id          INTEGER NOT NULL,
    blob_id          INTEGER NOT NULL,
    message_id       INTEGER,                 -- NULL while pending
    kind             TEXT NOT NULL,           -- pending | sender | recipient
    display_filename TEXT NOT NULL,
    position         INTEGER NOT NULL DEFAULT 0,
    revoked          INTEGER NOT NULL DEFAULT 0,
    revoked_at       TEXT,
    created_at       TEXT NOT NULL,

    FOREIGN KEY (blob_id) REFERENCES blobs(id) ON DELETE CASCADE,
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_grants_user_message
    ON access_grants(user_id, message_id, position);
CREATE INDEX IF NOT EXISTS idx_grants_blob ON access_grants(blob_id);
CREATE INDEX IF NOT EXISTS idx_grants_message ON access_grants(message_id);

-- ----------------------------------------------------------------
-- Deletion queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS deletion_queue (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    item_kind    TEXT NOT NULL,               -- message | blob
    target_id    INTEGER NOT NULL,
    file_path    TEXT,                        -- copied from blobs.storage_location
    status       TEXT NOT NULL DEFAULT 'pending',
    attempts     INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    scheduled_at TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_status_schedule
    ON deletion_queue(status, scheduled_at);

-- At most one live item per target.
CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_live_target
    ON deletion_queue(item_kind, target_id)
    WHERE status IN ('pending', 'processing');
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
