//! Filesystem helpers for backup targets.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::fs::OpenOptions;
use std::path::Path;

/// Creates `dir` and its parents when missing.
pub fn verify_directory<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Fails when an already existing `file` could not be overwritten by a backup.
///
/// A path that does not exist yet is writable as far as this check goes.
pub fn verify_writable<P: AsRef<Path>>(file: P) -> Result<()> {
    let file = file.as_ref();
    let md = match std::fs::metadata(file) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if md.is_dir() {
        return Err(Error::NotAFile { path: file.into() });
    }

    OpenOptions::new()
        .write(true)
        .open(file)
        .map(|_| ())
        .map_err(|_| Error::UnwritableTarget { path: file.into() })
}
