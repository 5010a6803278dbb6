//! Cross process lock preventing two backup runs against the same target directory.
//!
//! The lock is a `backup_lock.pid` file holding the process id of the run that
//! owns it. It stays on disk if the process dies, so a stuck run can be found
//! by the id in the file.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub static LOCK_FILE_NAME: &str = "backup_lock.pid";

/// Held lock, the marker file is removed when this is dropped.
#[derive(Debug)]
pub struct RunLock {
    lock_file: PathBuf,
    released: bool,
}

impl RunLock {
    /// Acquires the lock of `target_dir` for the current process.
    pub fn acquire<P: AsRef<Path>>(target_dir: P) -> Result<RunLock> {
        Self::acquire_as(target_dir, std::process::id().to_string())
    }

    /// Acquires the lock of `target_dir`, recording `owner` in the marker.
    ///
    /// Fails with [`Error::LockHeld`] without touching anything when a marker exists.
    pub fn acquire_as<P: AsRef<Path>, S: AsRef<str>>(target_dir: P, owner: S) -> Result<RunLock> {
        let lock_file = target_dir.as_ref().join(LOCK_FILE_NAME);
        let mut file = match File::create_new(&lock_file) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(&lock_file)?;
                return Err(Error::LockHeld {
                    lock_file,
                    owner: owner.trim().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let lock = RunLock {
            lock_file,
            released: false,
        };
        file.write_all(owner.as_ref().as_bytes())?;
        file.sync_all()?;
        debug!("Acquired run lock {:?}", lock.lock_file);
        Ok(lock)
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Removes the marker, reporting a failure to do so.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        std::fs::remove_file(&self.lock_file)?;
        debug!("Released run lock {:?}", self.lock_file);
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.lock_file) {
            warn!("Failed to remove run lock {:?}: {e}", self.lock_file);
        }
    }
}
