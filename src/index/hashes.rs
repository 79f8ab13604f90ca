//! Hash file (`...h.sat`) and hash candidate file (`...x.sat`).
//!
//! The hash file is a dense array of `hash_size`-byte entries. Entry 0 is the
//! chain entry hash of the data file; entry i+1 is the hash of local block i.
//!
//! The candidate file is an unordered append log of `(u32 block, hash)` pairs
//! posted by hash workers. Its exclusive lock also serializes every write to
//! the hash file.

use super::read_or_empty;
use crate::error::{Error, Result};
use crate::pipeline::lock::LockedFile;
use bytes::{Buf, BufMut};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Handle to a hash file.
#[derive(Debug, Clone)]
pub struct HashFile {
    path: PathBuf,
    hash_size: usize,
}

impl HashFile {
    /// Wraps `path` with entries of `hash_size` bytes.
    pub fn new(path: impl AsRef<Path>, hash_size: usize) -> Self {
        HashFile { path: path.as_ref().to_path_buf(), hash_size }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all complete entries. A missing file reads as empty.
    pub fn read(&self) -> Result<Vec<Vec<u8>>> {
        let data = read_or_empty(&self.path)?;
        Ok(data.chunks_exact(self.hash_size).map(|c| c.to_vec()).collect())
    }

    /// Size check: true when the file exists and holds whole entries only.
    pub fn is_well_formed(&self) -> Result<bool> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len() > 0 && meta.len() % self.hash_size as u64 == 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Reads entry `index` if present.
    pub fn entry(&self, index: u32) -> Result<Option<Vec<u8>>> {
        let mut file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let offset = index as u64 * self.hash_size as u64;
        if file.metadata()?.len() < offset + self.hash_size as u64 {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.hash_size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Writes `hashes` starting at entry `first`, dropping anything after.
    pub fn put_from(&self, first: u32, hashes: &[Vec<u8>], sync: bool) -> Result<()> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(&self.path)?;
        let offset = first as u64 * self.hash_size as u64;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(hashes.len() * self.hash_size);
        for hash in hashes {
            if hash.len() != self.hash_size {
                return Err(Error::internal(format!(
                    "Hash of {} bytes in a {}-byte hash file",
                    hash.len(),
                    self.hash_size
                )));
            }
            buf.put_slice(hash);
        }
        file.write_all(&buf)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Handle to a candidate file.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    path: PathBuf,
    hash_size: usize,
}

impl CandidateFile {
    /// Wraps `path` with hashes of `hash_size` bytes.
    pub fn new(path: impl AsRef<Path>, hash_size: usize) -> Self {
        CandidateFile { path: path.as_ref().to_path_buf(), hash_size }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads posted candidates without taking the lock.
    ///
    /// A trailing partial entry from a concurrent append is ignored.
    pub fn read_unlocked(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        Ok(decode_candidates(&read_or_empty(&self.path)?, self.hash_size))
    }

    /// Takes the candidate lock without blocking.
    pub fn lock(&self) -> Result<CandidateGuard> {
        Ok(CandidateGuard { file: LockedFile::open(&self.path, true)?, hash_size: self.hash_size })
    }
}

/// Exclusive access to the candidate file, and through it to the hash file.
#[derive(Debug)]
pub struct CandidateGuard {
    file: LockedFile,
    hash_size: usize,
}

impl CandidateGuard {
    /// Reads every complete candidate.
    pub fn read(&mut self) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut data = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut data)?;
        Ok(decode_candidates(&data, self.hash_size))
    }

    /// Appends candidates.
    pub fn append(&mut self, entries: &[(u32, Vec<u8>)], sync: bool) -> Result<()> {
        let mut buf = Vec::with_capacity(entries.len() * (4 + self.hash_size));
        for (block, hash) in entries {
            buf.put_u32(*block);
            buf.put_slice(hash);
        }
        // drop a partial entry left by a crashed worker
        let len = self.file.metadata()?.len();
        let whole = len - len % (4 + self.hash_size) as u64;
        if whole != len {
            self.file.set_len(whole)?;
        }
        self.file.seek(SeekFrom::Start(whole))?;
        self.file.write_all(&buf)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drops every candidate.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        Ok(())
    }
}

fn decode_candidates(data: &[u8], hash_size: usize) -> Vec<(u32, Vec<u8>)> {
    data.chunks_exact(4 + hash_size)
        .map(|mut chunk| {
            let block = chunk.get_u32();
            (block, chunk.to_vec())
        })
        .collect()
}
