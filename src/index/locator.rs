//! Global block locator (`<sid>-blkn.sat`).
//!
//! A big-endian u32 array: entry 0 is the highest file number, entry n is the
//! global number of file n's first block. Only used for random lookups by
//! block number, never on the write path's critical steps.

use super::{decode_u32s, read_or_empty};
use crate::error::Result;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Handle to a locator file.
#[derive(Debug, Clone)]
pub struct Locator {
    path: PathBuf,
}

impl Locator {
    /// Wraps `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Locator { path: path.as_ref().to_path_buf() }
    }

    /// Reads every entry. A missing file reads as empty.
    pub fn read(&self) -> Result<Vec<u32>> {
        Ok(decode_u32s(&read_or_empty(&self.path)?))
    }

    /// Records the start block of `file` and raises the highest file number.
    pub fn record(&self, file: u32, start_block: u32, sync: bool) -> Result<()> {
        let entries = self.read()?;
        let max = entries.first().copied().unwrap_or(0).max(file);

        let mut f = OpenOptions::new().write(true).create(true).truncate(false).open(&self.path)?;
        // fill holes so that positions stay aligned with file numbers
        let have = entries.len() as u32;
        if have < file {
            let fill = have.max(1);
            f.seek(SeekFrom::Start(fill as u64 * 4))?;
            for _ in fill..file {
                f.write_all(&0u32.to_be_bytes())?;
            }
        }
        f.seek(SeekFrom::Start(file as u64 * 4))?;
        f.write_all(&start_block.to_be_bytes())?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&max.to_be_bytes())?;
        if sync {
            f.sync_data()?;
        }
        Ok(())
    }

    /// Replaces the whole locator with `starts[i]` as the start block of file `i + 1`.
    pub fn write_all(&self, starts: &[u32], sync: bool) -> Result<()> {
        let mut f = OpenOptions::new().write(true).create(true).truncate(true).open(&self.path)?;
        let mut buf = Vec::with_capacity((starts.len() + 1) * 4);
        buf.extend_from_slice(&(starts.len() as u32).to_be_bytes());
        for start in starts {
            buf.extend_from_slice(&start.to_be_bytes());
        }
        f.write_all(&buf)?;
        if sync {
            f.sync_data()?;
        }
        Ok(())
    }

    /// File whose start block is the greatest one not above `block`.
    ///
    /// Returns None when the locator is empty or `block` precedes file 1.
    pub fn file_for(entries: &[u32], block: u64) -> Option<u32> {
        let max = *entries.first()? as usize;
        (1..=max.min(entries.len().saturating_sub(1)))
            .rev()
            .find(|&n| entries[n] as u64 <= block)
            .map(|n| n as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_lookup() {
        let dir = TempDir::new().unwrap();
        let locator = Locator::new(dir.path().join("blkn.sat"));

        locator.record(1, 0, false).unwrap();
        locator.record(2, 10, false).unwrap();
        locator.record(3, 25, false).unwrap();
        let entries = locator.read().unwrap();
        assert_eq!(entries, vec![3, 0, 10, 25]);

        assert_eq!(Locator::file_for(&entries, 0), Some(1));
        assert_eq!(Locator::file_for(&entries, 9), Some(1));
        assert_eq!(Locator::file_for(&entries, 10), Some(2));
        assert_eq!(Locator::file_for(&entries, 1000), Some(3));
        assert_eq!(Locator::file_for(&[], 0), None);
    }

    #[test]
    fn test_record_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let locator = Locator::new(dir.path().join("blkn.sat"));

        locator.record(1, 0, false).unwrap();
        locator.record(2, 4, false).unwrap();
        locator.record(2, 4, false).unwrap();
        locator.record(1, 0, false).unwrap();
        assert_eq!(locator.read().unwrap(), vec![2, 0, 4]);
    }

    #[test]
    fn test_record_fills_holes() {
        let dir = TempDir::new().unwrap();
        let locator = Locator::new(dir.path().join("blkn.sat"));

        locator.record(3, 30, false).unwrap();
        assert_eq!(locator.read().unwrap(), vec![3, 0, 0, 30]);
    }

    #[test]
    fn test_write_all() {
        let dir = TempDir::new().unwrap();
        let locator = Locator::new(dir.path().join("blkn.sat"));

        locator.write_all(&[0, 7], false).unwrap();
        assert_eq!(locator.read().unwrap(), vec![2, 0, 7]);
    }
}
