//! Single-instance guard for reaper runs.
//!
//! The lock is a file created with `O_EXCL`. It is removed when the guard is
//! dropped; a file older than the stale threshold is taken to be left over
//! from a crashed run and replaced.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::warn;

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock. `Ok(None)` means another run holds it.
    pub fn acquire(path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(Some(Self { path: path.to_path_buf() }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !is_stale(path, stale_after)? {
                        return Ok(None);
                    }
                    warn!(path = %path.display(), "removing stale reaper lock");
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> io::Result<bool> {
    let modified = match fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        // Released between our open and this check.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(age > stale_after)
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release reaper lock");
        }
    }
}
