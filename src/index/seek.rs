//! Seek file (`...s.sat`).
//!
//! A dense big-endian u32 array: entry 0 is always 0 and entry i+1 is the end
//! of local block i, relative to the first record byte. A file with `n`
//! finalized blocks has `n + 1` entries.

use super::{decode_u32s, read_or_empty};
use crate::error::Result;
use crate::format::trailer::encode_seek_table;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Handle to a seek file.
#[derive(Debug, Clone)]
pub struct SeekFile {
    path: PathBuf,
}

impl SeekFile {
    /// Wraps `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        SeekFile { path: path.as_ref().to_path_buf() }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry. A missing file reads as empty.
    pub fn read(&self) -> Result<Vec<u32>> {
        Ok(decode_u32s(&read_or_empty(&self.path)?))
    }

    /// True when the file holds exactly the table of `blocks` blocks ending at
    /// relative offset `tail`.
    pub fn matches(entries: &[u32], blocks: u32, tail: u32) -> bool {
        entries.len() == blocks as usize + 1
            && entries.first() == Some(&0)
            && entries.last() == Some(&tail)
            && entries.windows(2).all(|w| w[0] < w[1])
    }

    /// Replaces the whole table.
    pub fn write_all(&self, entries: &[u32], sync: bool) -> Result<()> {
        let mut file = fs::File::create(&self.path)?;
        file.write_all(&encode_seek_table(entries))?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Writes `entry` at position `index`, truncating anything after it.
    pub fn put(&self, index: u32, entry: u32, sync: bool) -> Result<()> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(&self.path)?;
        let offset = index as u64 * 4;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&entry.to_be_bytes())?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }
}
