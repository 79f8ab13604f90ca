//! Non-blocking advisory file locks.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// An open file holding an exclusive advisory lock until dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Opens `path` read-write and takes the lock without blocking.
    ///
    /// Returns [`Error::Busy`] when another handle holds the lock.
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).create(create).open(path).map_err(
            |e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::not_found(format!("{}", path.display()))
                } else {
                    Error::Io(e)
                }
            },
        )?;
        Self::lock(file, path)
    }

    /// Takes the lock on an already open file.
    pub fn lock(file: File, path: &Path) -> Result<Self> {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(LockedFile { file, path: path.to_path_buf() }),
            Err(e) if is_contended(&e) => {
                Err(Error::busy(format!("{} is locked", path.display())))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    e.kind() == contended.kind() || e.raw_os_error() == contended.raw_os_error()
}

impl Deref for LockedFile {
    type Target = File;

    fn deref(&self) -> &File {
        &self.file
    }
}

impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// True when `path` exists and nobody holds its lock right now.
pub fn is_unlocked(path: &Path) -> Result<bool> {
    match LockedFile::open(path, false) {
        Ok(_) => Ok(true),
        Err(Error::Busy(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_is_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");

        let first = LockedFile::open(&path, true).unwrap();
        let second = LockedFile::open(&path, true);
        assert!(matches!(second, Err(Error::Busy(_))));
        assert!(!is_unlocked(&path).unwrap());

        drop(first);
        assert!(LockedFile::open(&path, true).is_ok());
        assert!(is_unlocked(&path).unwrap());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = LockedFile::open(dir.path().join("missing"), false);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
