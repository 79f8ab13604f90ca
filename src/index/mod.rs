//! Side indexes.
//!
//! - **Seek file**: block start offsets of an in-progress data file
//! - **Hash file / candidate file**: canonical and staged chain hashes
//! - **Folder index**: shared stream id -> (file, write offset) slots
//! - **Locator**: file number -> start block, for lookups by global block

pub mod folder;
pub mod hashes;
pub mod locator;
pub mod seek;

pub use folder::{FolderCell, FolderIndex};
pub use hashes::{CandidateFile, HashFile};
pub use locator::Locator;
pub use seek::SeekFile;

use crate::error::{Error, Result};
use crate::format::frame;
use crate::format::header::Header;
use crate::format::trailer::TrailerLayout;
use crate::format::{StreamPaths, HEADER_SIZE};
use crate::pipeline::datafile::DataFile;
use crate::Stream;
use bytes::Buf;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

/// Outcome of a repair request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RepairOutcome {
    /// The index was consistent and left alone.
    Intact,
    /// The index was rewritten from the data file.
    Rebuilt,
}

/// Reads a whole side file, treating a missing file as empty.
pub(crate) fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Removes a side file if present.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Decodes a u32 array, ignoring a trailing partial entry.
pub(crate) fn decode_u32s(data: &[u8]) -> Vec<u32> {
    let mut buf = &data[..data.len() - data.len() % 4];
    let mut out = Vec::with_capacity(buf.len() / 4);
    while buf.has_remaining() {
        out.push(buf.get_u32());
    }
    out
}

/// Lowest and highest data file numbers present in a stream directory.
pub fn scan_data_files(paths: &StreamPaths) -> Result<Option<(u32, u32)>> {
    let mut range: Option<(u32, u32)> = None;
    for entry in fs::read_dir(paths.dir())? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(n) = name.to_str().and_then(|s| paths.parse_data_name(s)) {
            range = Some(match range {
                Some((lo, hi)) => (lo.min(n), hi.max(n)),
                None => (n, n),
            });
        }
    }
    Ok(range)
}

impl Stream {
    /// Lowest and highest data file numbers of this stream.
    pub fn scan_files(&self) -> Result<Option<(u32, u32)>> {
        scan_data_files(&self.paths)
    }

    /// Block boundaries of `file`, relative to its first record byte.
    ///
    /// Finalized files answer from the trailer, in-progress files from the
    /// seek file, falling back to a read-only rescan when the seek file lags
    /// behind the header.
    pub fn seek_table(&self, file: u32) -> Result<Vec<u32>> {
        let header = self.read_header(file)?;
        self.seek_table_for(file, &header)
    }

    pub(crate) fn seek_table_for(&self, file: u32, header: &Header) -> Result<Vec<u32>> {
        if header.finalized {
            let layout = TrailerLayout::of(header);
            let mut f = File::open(self.paths.data(file))?;
            f.seek(SeekFrom::Start(layout.seek_table()))?;
            let mut buf = vec![0u8; (layout.blocks as usize + 1) * 4];
            f.read_exact(&mut buf)?;
            return Ok(decode_u32s(&buf));
        }

        let tail = header.tail_offset - HEADER_SIZE as u32;
        let entries = self.seek_file(file).read()?;
        if SeekFile::matches(&entries, header.block_count, tail) {
            return Ok(entries);
        }

        let reader = BufReader::new(File::open(self.paths.data(file))?);
        let scan = frame::scan(reader, header.tail_offset as u64)?;
        let table = scan.seek_table();
        if scan.damaged || !SeekFile::matches(&table, header.block_count, tail) {
            return Err(Error::corruption(format!(
                "frames of file {} disagree with its header ({} blocks up to offset {})",
                file, header.block_count, header.tail_offset
            )));
        }
        Ok(table)
    }

    /// Rewrites the seek file of an in-progress file from its raw frames when
    /// it is missing or inconsistent with the header.
    ///
    /// Takes the data file lock, so it returns [`Error::Busy`] while a writer
    /// is active.
    pub fn repair_seek_file(&self, file: u32) -> Result<RepairOutcome> {
        let mut df = DataFile::open(&self.paths.data(file), file, self.options.sync_writes)?;
        if df.header.finalized {
            return Err(Error::invalid_state(format!(
                "file {} is finalized; its seek table lives in the trailer",
                file
            )));
        }

        let header = df.header;
        let tail = header.tail_offset - HEADER_SIZE as u32;
        let seek = self.seek_file(file);
        if SeekFile::matches(&seek.read()?, header.block_count, tail) {
            return Ok(RepairOutcome::Intact);
        }

        let scan = frame::scan(BufReader::new(df.file_mut()), header.tail_offset as u64)?;
        let table = scan.seek_table();
        if scan.damaged || !SeekFile::matches(&table, header.block_count, tail) {
            return Err(Error::corruption(format!(
                "cannot rebuild the seek file of file {}: frames disagree with the header",
                file
            )));
        }
        seek.write_all(&table, self.options.sync_writes)?;

        log::info!("Rebuilt seek file of file {} ({} blocks)", file, header.block_count);
        Ok(RepairOutcome::Rebuilt)
    }

    /// Global number of the first block of `file`.
    pub fn file_start_block(&self, file: u32) -> Result<u32> {
        let entries = self.locator().read()?;
        let known = entries.first().map_or(false, |&max| file >= 1 && file <= max);
        match entries.get(file as usize) {
            Some(&start) if known => Ok(start),
            _ => Ok(self.read_header(file)?.start_block),
        }
    }

    /// Data file holding global block `block`.
    ///
    /// Returns [`Error::NotFound`] for blocks that are not finalized yet.
    pub fn locate_block(&self, block: u64) -> Result<u32> {
        match self.locate_with(&self.locator().read()?, block) {
            Ok(file) => Ok(file),
            Err(Error::NotFound(_)) => {
                self.rebuild_locator()?;
                self.locate_with(&self.locator().read()?, block)
            }
            Err(e) => Err(e),
        }
    }

    fn locate_with(&self, entries: &[u32], block: u64) -> Result<u32> {
        let missing = || Error::not_found(format!("block {}", block));
        let file = Locator::file_for(entries, block).ok_or_else(missing)?;
        let header = self.read_header(file)?;
        if block >= header.next_block() {
            return Err(missing());
        }
        Ok(file)
    }

    /// Rebuilds the locator by reading the header of every data file.
    /// Returns the number of files indexed.
    pub fn rebuild_locator(&self) -> Result<u32> {
        let Some((_, max)) = self.scan_files()? else {
            return Ok(0);
        };
        let mut starts = Vec::with_capacity(max as usize);
        for file in 1..=max {
            starts.push(self.read_header(file)?.start_block);
        }
        self.locator().write_all(&starts, self.options.sync_writes)?;
        log::info!("Rebuilt block locator of stream {} ({} files)", self.sid(), max);
        Ok(max)
    }

    /// This stream's cell in the shared folder index.
    pub fn folder_cell(&self) -> Result<Option<FolderCell>> {
        match self.folder.find(self.sid())? {
            Some(slot) => self.folder.read(slot),
            None => Ok(None),
        }
    }
}
