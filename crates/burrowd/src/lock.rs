//! Exclusive depot lock.
//!
//! Startup recovery (restore + prune) mutates the depot; two daemons
//! sharing one depot would fight over the same containers. The lock is
//! an advisory `flock` on `<depot>/.lock`, released on drop.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

pub struct DepotLock {
    lock_file: File,
}

impl DepotLock {
    pub fn acquire(lock_path: &Path) -> io::Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        file.try_lock_exclusive().map_err(|_| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("depot is locked by another daemon: {}", lock_path.display()),
            )
        })?;

        Ok(Self { lock_file: file })
    }
}

impl Drop for DepotLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock_file);
    }
}
