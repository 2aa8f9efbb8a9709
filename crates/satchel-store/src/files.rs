//! On-disk layout of blob bytes.
//!
//! Each blob lives at `<root>/<h[0..2]>/<h[2..4]>/<h>` where `h` is the hex
//! content hash, so the same content always lands on the same path. Uploads
//! are spooled into `<root>/tmp/` while being hashed and only renamed into
//! place once complete.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use satchel_shared::{ContentHash, ContentHasher};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};

const SPOOL_DIR: &str = "tmp";

/// Reject anything but plain relative components, so a stored location can
/// never point outside the root.
fn ensure_within(base: &Path, relative: &str) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            _ => return Err(StoreError::InvalidPath(relative.to_string())),
        }
    }
    if resolved.as_path() == base {
        return Err(StoreError::InvalidPath(relative.to_string()));
    }
    Ok(resolved)
}

#[derive(Debug, Clone)]
pub struct BlobFiles {
    root: PathBuf,
    max_size: u64,
}

impl BlobFiles {
    pub fn new(root: PathBuf, max_size: u64) -> Result<Self> {
        fs::create_dir_all(root.join(SPOOL_DIR))?;
        debug!(path = %root.display(), "blob storage root ready");
        Ok(Self { root, max_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Storage location for a hash, relative to the root.
    pub fn location_for(hash: &ContentHash) -> String {
        let hex = hash.to_hex();
        format!("{}/{}/{}", &hex[..2], &hex[2..4], hex)
    }

    /// Absolute path of a stored location.
    pub fn resolve(&self, location: &str) -> Result<PathBuf> {
        ensure_within(&self.root, location)
    }

    pub fn exists(&self, location: &str) -> Result<bool> {
        Ok(self.resolve(location)?.is_file())
    }

    pub fn open(&self, location: &str) -> Result<File> {
        let path = self.resolve(location)?;
        File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound,
            _ => StoreError::Io(e),
        })
    }

    /// Copy `reader` into a spool file, hashing as it goes.
    ///
    /// Enforces the size limit and rejects empty input. On any error the
    /// spool file is removed.
    pub fn spool<R: Read>(&self, mut reader: R) -> Result<SpooledUpload> {
        let path = self
            .root
            .join(SPOOL_DIR)
            .join(format!("{}.part", Uuid::new_v4()));
        let mut file = File::create(&path)?;
        let mut spooled = SpooledUpload {
            path,
            hash: ContentHash::from_bytes([0; 32]),
            size: 0,
            kept: false,
        };

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if hasher.len() + n as u64 > self.max_size {
                return Err(StoreError::TooLarge { max: self.max_size });
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
        }

        if hasher.is_empty() {
            return Err(StoreError::EmptyUpload);
        }
        file.sync_all()?;

        spooled.hash = hasher.finalize();
        spooled.size = hasher.len();
        Ok(spooled)
    }

    /// Move a spooled upload to its final location, replacing whatever is there.
    pub fn place(&self, mut spooled: SpooledUpload, location: &str) -> Result<()> {
        let target = self.resolve(location)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&spooled.path, &target)?;
        spooled.kept = true;
        debug!(location, size = spooled.size, "placed blob file");
        Ok(())
    }

    /// Remove a stored file. A file that is already gone counts as removed.
    ///
    /// Returns whether a file was actually deleted.
    pub fn remove(&self, location: &str) -> Result<bool> {
        let path = self.resolve(location)?;
        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        // Prune the two fan-out directories when they become empty.
        let mut dir = path.parent();
        for _ in 0..2 {
            match dir {
                Some(d) if d != self.root.as_path() && fs::remove_dir(d).is_ok() => dir = d.parent(),
                _ => break,
            }
        }

        if !removed {
            warn!(location, "blob file already absent");
        }
        Ok(removed)
    }
}

/// A fully written, hashed upload waiting in the spool directory.
///
/// Dropping it without [`BlobFiles::place`] deletes the spool file.
#[derive(Debug)]
pub struct SpooledUpload {
    path: PathBuf,
    hash: ContentHash,
    size: u64,
    kept: bool,
}

impl SpooledUpload {
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for SpooledUpload {
    fn drop(&mut self) {
        if !self.kept {
            let _ = fs::remove_file(&self.path);
        }
    }
}
