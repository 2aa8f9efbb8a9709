//! Content addressing.
//!
//! Blobs are keyed by the BLAKE3 digest of their full byte stream. The hex
//! form doubles as the dedup key in the database and as the on-disk file
//! name, so it must never be truncated.

use std::fmt;
use std::str::FromStr;

use crate::constants::CONTENT_HASH_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; CONTENT_HASH_SIZE]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; CONTENT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; CONTENT_HASH_SIZE];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Self(arr))
    }

    /// Hash an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Incremental hasher that also counts the bytes it has seen.
#[derive(Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(&self) -> ContentHash {
        ContentHash(*self.inner.finalize().as_bytes())
    }
}
