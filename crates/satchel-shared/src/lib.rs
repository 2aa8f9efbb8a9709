//! # satchel-shared
//!
//! Types and primitives shared by the satchel attachment store, its HTTP
//! surface and the deletion-queue worker: identifiers, grant and queue
//! enums, content hashing and the download-handle codec.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod handle;
pub mod hash;
pub mod types;

pub use error::{CryptoError, HandleError};
pub use handle::HandleCodec;
pub use hash::{ContentHash, ContentHasher};
pub use types::{BlobId, GrantKind, MessageId, QueueItemKind, QueueStatus, UserId};
