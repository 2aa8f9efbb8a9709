/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// BLAKE3 digest size in bytes
pub const CONTENT_HASH_SIZE: usize = 32;

/// Key derivation context for the download-handle key (BLAKE3)
pub const KDF_CONTEXT_HANDLE_KEY: &str = "satchel-handle-key-v1";

/// Maximum upload size in bytes (25 MiB)
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 25 * 1024 * 1024;

/// Once a deletion-queue item has been attempted this many times it is
/// parked as `failed` and never picked up automatically again.
pub const MAX_QUEUE_ATTEMPTS: u32 = 5;

/// Retry backoff for deletion-queue items: `base * 2^(attempts - 1)`, capped.
pub const RETRY_BASE_DELAY_SECS: i64 = 30;
pub const RETRY_MAX_DELAY_SECS: i64 = 3600;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default IMAP-over-TLS port
pub const DEFAULT_IMAP_PORT: u16 = 993;
