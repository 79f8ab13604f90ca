//! Folder-cell index (`streams.list`).
//!
//! Shared by every stream in a folder. The file is an array of 16-byte cells:
//!
//! ```text
//! cell 0:   "================"          filler
//! cell n:   [sid: 8][file: u32][write offset: u32]
//! ```
//!
//! A stream finds its slot with one linear scan and then only rewrites the
//! 8 bytes at `16 * slot + 8`. Cells are never moved or appended through a
//! shared cursor, so concurrent writers of different streams cannot clobber
//! each other.

use crate::error::{Error, Result};
use crate::format::StreamId;
use crate::pipeline::lock::LockedFile;
use bytes::{Buf, BufMut};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Cell size in bytes.
pub const CELL_SIZE: u64 = 16;

const FILLER: [u8; CELL_SIZE as usize] = [b'='; CELL_SIZE as usize];

/// One stream's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FolderCell {
    /// Slot number, 1-based.
    pub slot: u32,
    /// Owning stream.
    pub sid: StreamId,
    /// Current data file.
    pub file: u32,
    /// Write offset in that file.
    pub offset: u32,
}

/// Handle to a folder's `streams.list`.
#[derive(Debug, Clone)]
pub struct FolderIndex {
    path: PathBuf,
    capacity: usize,
}

impl FolderIndex {
    /// Opens (creating if needed) the index at `path` with `capacity` slots.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        if file.metadata()?.len() < CELL_SIZE {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&FILLER)?;
            file.sync_data()?;
        } else {
            let mut head = [0u8; CELL_SIZE as usize];
            file.read_exact(&mut head)?;
            if head != FILLER {
                return Err(Error::corruption(format!(
                    "{} does not start with a filler cell",
                    path.display()
                )));
            }
        }
        Ok(FolderIndex { path, capacity })
    }

    /// Index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stream slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lists every occupied slot.
    pub fn cells(&self) -> Result<Vec<FolderCell>> {
        let data = fs::read(&self.path)?;
        let mut cells = Vec::new();
        for (slot, chunk) in data.chunks_exact(CELL_SIZE as usize).enumerate().skip(1) {
            if slot > self.capacity {
                break;
            }
            if let Some(cell) = decode_cell(slot as u32, chunk) {
                cells.push(cell);
            }
        }
        Ok(cells)
    }

    /// Finds the slot of `sid` by linear scan.
    pub fn find(&self, sid: StreamId) -> Result<Option<u32>> {
        Ok(self.cells()?.into_iter().find(|c| c.sid == sid).map(|c| c.slot))
    }

    /// Finds the slot of `sid`, claiming the first free one if it has none.
    ///
    /// Claiming takes the index lock without blocking and returns
    /// [`Error::Busy`] when another stream is claiming at the same time.
    pub fn find_or_allocate(&self, sid: StreamId) -> Result<u32> {
        if sid.is_zero() {
            return Err(Error::invalid_argument("the all-zero stream id marks free slots"));
        }
        if let Some(slot) = self.find(sid)? {
            return Ok(slot);
        }

        let mut file = LockedFile::open(&self.path, false)?;
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let mut free = None;
        for slot in 1..=self.capacity {
            let start = slot * CELL_SIZE as usize;
            match data.get(start..start + CELL_SIZE as usize) {
                Some(chunk) => match decode_cell(slot as u32, chunk) {
                    Some(cell) if cell.sid == sid => return Ok(cell.slot),
                    Some(_) => {}
                    None if free.is_none() => free = Some(slot as u32),
                    None => {}
                },
                None => {
                    if free.is_none() {
                        free = Some(slot as u32);
                    }
                    break;
                }
            }
        }

        let slot = free.ok_or_else(|| {
            Error::invalid_state(format!(
                "folder index {} is full ({} streams)",
                self.path.display(),
                self.capacity
            ))
        })?;
        let mut cell = Vec::with_capacity(CELL_SIZE as usize);
        cell.put_slice(sid.as_bytes());
        cell.put_u32(0);
        cell.put_u32(0);
        file.seek(SeekFrom::Start(slot as u64 * CELL_SIZE))?;
        file.write_all(&cell)?;
        file.sync_data()?;

        log::debug!("Stream {} claimed folder slot {}", sid, slot);
        Ok(slot)
    }

    /// Reads one slot.
    pub fn read(&self, slot: u32) -> Result<Option<FolderCell>> {
        let mut file = fs::File::open(&self.path)?;
        let offset = slot as u64 * CELL_SIZE;
        if file.metadata()?.len() < offset + CELL_SIZE {
            return Ok(None);
        }
        let mut buf = [0u8; CELL_SIZE as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(decode_cell(slot, &buf))
    }

    /// Rewrites the position of an already claimed slot.
    pub fn write(&self, slot: u32, file_number: u32, offset: u32, sync: bool) -> Result<()> {
        if slot == 0 || slot as usize > self.capacity {
            return Err(Error::invalid_argument(format!("folder slot {} out of range", slot)));
        }
        let mut buf = Vec::with_capacity(8);
        buf.put_u32(file_number);
        buf.put_u32(offset);

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(slot as u64 * CELL_SIZE + 8))?;
        file.write_all(&buf)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

fn decode_cell(slot: u32, mut chunk: &[u8]) -> Option<FolderCell> {
    let mut sid = [0u8; 8];
    chunk.copy_to_slice(&mut sid);
    let sid = StreamId::new(sid);
    if sid.is_zero() {
        return None;
    }
    Some(FolderCell { slot, sid, file: chunk.get_u32(), offset: chunk.get_u32() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sid(n: u8) -> StreamId {
        StreamId::new([n; 8])
    }

    #[test]
    fn test_open_writes_filler() {
        let dir = TempDir::new().unwrap();
        let index = FolderIndex::open(dir.path().join("streams.list"), 4).unwrap();
        assert_eq!(fs::read(index.path()).unwrap(), FILLER.to_vec());
        assert!(index.cells().unwrap().is_empty());

        // reopening keeps the file
        FolderIndex::open(index.path(), 4).unwrap();
        assert_eq!(fs::read(index.path()).unwrap().len(), 16);
    }

    #[test]
    fn test_same_stream_one_slot() {
        let dir = TempDir::new().unwrap();
        let index = FolderIndex::open(dir.path().join("streams.list"), 4).unwrap();

        let a = index.find_or_allocate(sid(1)).unwrap();
        let again = index.find_or_allocate(sid(1)).unwrap();
        let b = index.find_or_allocate(sid(2)).unwrap();

        assert_eq!(a, 1);
        assert_eq!(again, 1);
        assert_eq!(b, 2);
        assert_eq!(index.cells().unwrap().len(), 2);
    }

    #[test]
    fn test_write_does_not_shift_neighbours() {
        let dir = TempDir::new().unwrap();
        let index = FolderIndex::open(dir.path().join("streams.list"), 4).unwrap();

        let a = index.find_or_allocate(sid(1)).unwrap();
        let b = index.find_or_allocate(sid(2)).unwrap();
        let c = index.find_or_allocate(sid(3)).unwrap();
        index.write(a, 1, 100, false).unwrap();
        index.write(c, 3, 300, false).unwrap();
        let before = fs::read(index.path()).unwrap();

        index.write(b, 7, 777, false).unwrap();
        index.write(b, 8, 888, false).unwrap();
        let after = fs::read(index.path()).unwrap();

        assert_eq!(before.len(), after.len());
        assert_eq!(before[..32], after[..32]);
        assert_eq!(before[48..], after[48..]);
        assert_eq!(
            index.read(b).unwrap(),
            Some(FolderCell { slot: b, sid: sid(2), file: 8, offset: 888 })
        );
        assert_eq!(index.read(a).unwrap().unwrap().offset, 100);
    }

    #[test]
    fn test_capacity() {
        let dir = TempDir::new().unwrap();
        let index = FolderIndex::open(dir.path().join("streams.list"), 2).unwrap();

        index.find_or_allocate(sid(1)).unwrap();
        index.find_or_allocate(sid(2)).unwrap();
        assert!(matches!(index.find_or_allocate(sid(3)), Err(Error::InvalidState(_))));
        assert!(index.write(3, 1, 36, false).is_err());
    }

    #[test]
    fn test_zero_sid_rejected() {
        let dir = TempDir::new().unwrap();
        let index = FolderIndex::open(dir.path().join("streams.list"), 2).unwrap();
        assert!(index.find_or_allocate(StreamId::default()).is_err());
    }

    #[test]
    fn test_bad_filler() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.list");
        fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(FolderIndex::open(&path, 2), Err(Error::Corruption(_))));
    }
}
