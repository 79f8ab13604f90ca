//! Write pipeline.
//!
//! Every mutation of a data file runs under that file's exclusive lock and
//! is a sequence of steps. Before a step's effects become visible its write
//! flag is committed to the header; after the step the next flag is
//! committed. A crash therefore leaves the name of the pending step in the
//! header, and [`Stream::run`] resumes it: the same entry point drives the
//! normal path and recovery.
//!
//! ## Steps
//!
//! - **append**: write the frame, advance the write offset, update the
//!   folder cell
//! - **block finalize**: write the block end frame, advance the tail and
//!   block count, update the seek file and folder cell
//! - **file finalize**: write the close marker, create the successor and
//!   redirect writers to it, then append the trailer (seek table, edge
//!   hashes, signature, reduced hashes, cover)

mod append;
mod block;
pub(crate) mod datafile;
mod file;
pub mod lock;
pub mod state;

pub use state::WriteFlag;

use crate::error::{Error, Result};
use crate::format::frame::{self, FrameKind, FrameReader};
use crate::format::{HEADER_SIZE, MAX_FILE_BLOCKS};
use crate::Stream;
use datafile::DataFile;
use serde::Serialize;
use std::io::BufReader;

/// Redirects followed by one operation before giving up.
const MAX_REDIRECTS: usize = 8;

/// Result of [`Stream::append`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendInfo {
    /// Data file the record went to.
    pub file: u32,
    /// Global number of the block the record belongs to.
    pub block: u64,
    /// Absolute offset of the record's frame.
    pub offset: u32,
    /// Position of the record inside its block.
    pub record_index: u32,
    /// The block reached a manifest limit; finalize it soon.
    pub block_full: bool,
    /// The file reached a manifest limit; finalize it soon.
    pub file_full: bool,
}

/// Result of [`Stream::finalize_block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Data file holding the block.
    pub file: u32,
    /// Global block number.
    pub block: u64,
    /// Absolute offset of the block's first byte.
    pub offset: u32,
    /// Block length including its end frame.
    pub length: u32,
    /// Records in the block.
    pub records: u32,
    /// The file reached a manifest limit; finalize it soon.
    pub file_full: bool,
}

/// Result of [`Stream::finalize_file`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// The finalized file.
    pub file: u32,
    /// Blocks in it.
    pub blocks: u32,
    /// Global number of its first block.
    pub start_block: u32,
    /// The successor that now receives writes.
    pub next_file: u32,
    /// A signature was written.
    pub signed: bool,
    /// Reduced intermediate hashes kept in the trailer.
    pub reduced_hashes: u32,
}

/// A step that was resumed after an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResumedStep {
    /// Data file.
    pub file: u32,
    /// Write flag found in its header.
    pub flag: WriteFlag,
}

/// Result of [`Stream::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Recovery {
    /// Steps that were completed.
    pub resumed: Vec<ResumedStep>,
    /// Headers repaired by rescanning their frames.
    pub repaired: Vec<u32>,
    /// File receiving writes afterwards.
    pub current_file: u32,
}

/// In-process writer state, guarded by the stream's mutex.
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    pub current_file: u32,
    pub slot: Option<u32>,
    pub open_block: Option<OpenBlock>,
}

/// Record count of the open block, valid while the file position matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenBlock {
    pub file: u32,
    pub tail: u32,
    pub write_offset: u32,
    pub records: u32,
}

impl Stream {
    /// Completes any interrupted step on the current file.
    ///
    /// Every write operation does the same on its own, so calling this is
    /// only needed to settle a stream eagerly after a crash.
    pub fn recover(&self) -> Result<Recovery> {
        let mut state = self.writer.lock();
        let mut recovery = Recovery::default();
        let df = self.acquire(&mut state, &mut recovery)?;
        recovery.current_file = df.number;
        if !recovery.resumed.is_empty() || !recovery.repaired.is_empty() {
            log::info!(
                "Recovered stream {}: {} steps resumed, {} headers repaired",
                self.sid(),
                recovery.resumed.len(),
                recovery.repaired.len()
            );
        }
        Ok(recovery)
    }

    /// Locks the file that receives writes.
    ///
    /// Resumes a pending write flag, repairs a damaged one and follows the
    /// redirect to the successor when the file turns out to be finalized.
    /// A file another writer is finalizing is skipped without waiting for
    /// its lock once the folder cell points past it.
    pub(crate) fn acquire(
        &self,
        state: &mut WriterState,
        recovery: &mut Recovery,
    ) -> Result<DataFile> {
        for _ in 0..MAX_REDIRECTS {
            let number = state.current_file;
            if let Ok(peek) = self.read_header(number) {
                if peek.finalized && peek.write_flag == 0 {
                    let next = self.successor_of(state, number)?;
                    self.redirect(state, number, next);
                    continue;
                }
            }

            let mut df = match DataFile::open(&self.paths.data(number), number, self.options.sync_writes) {
                Ok(df) => df,
                Err(Error::Busy(msg)) => match self.redirect_while_busy(state, number)? {
                    Some(next) => {
                        self.redirect(state, number, next);
                        continue;
                    }
                    None => return Err(Error::Busy(msg)),
                },
                Err(e) => return Err(e),
            };

            if df.header.write_flag != 0 {
                match WriteFlag::from_u8(df.header.write_flag) {
                    Some(flag) => {
                        log::warn!("File {} was interrupted at {}; resuming", number, flag);
                        self.run(state, &mut df, flag, None)?;
                        recovery.resumed.push(ResumedStep { file: number, flag });
                    }
                    None if df.header.finalized => {
                        return Err(Error::corruption(format!(
                            "finalized file {} has invalid write flag {}",
                            number, df.header.write_flag
                        )));
                    }
                    None => {
                        self.repair_header(state, &mut df)?;
                        recovery.repaired.push(number);
                    }
                }
            }

            if df.header.finalized {
                let next = self.successor_of(state, number)?;
                self.redirect(state, number, next);
                continue;
            }
            return Ok(df);
        }
        Err(Error::internal("too many file redirects"))
    }

    /// Runs the pipeline from `flag` until it is idle again.
    ///
    /// `frame` is the encoded record of a fresh append; recovery passes None.
    pub(crate) fn run(
        &self,
        state: &mut WriterState,
        df: &mut DataFile,
        flag: WriteFlag,
        frame: Option<&[u8]>,
    ) -> Result<()> {
        let mut flag = flag;
        while flag != WriteFlag::Idle {
            flag = match flag {
                WriteFlag::Idle => WriteFlag::Idle,
                WriteFlag::AppendWrite => self.append_write(df, frame)?,
                WriteFlag::AppendIndex => self.append_index(state, df)?,
                WriteFlag::BlockWrite => self.block_write(df)?,
                WriteFlag::BlockIndex => self.block_index(state, df)?,
                WriteFlag::FileClose => self.file_close(df)?,
                WriteFlag::FileSuccessor => self.file_successor(state, df)?,
                WriteFlag::FileSeekTable => self.file_seek_table(df)?,
                WriteFlag::FileEdgeHashes => self.file_edge_hashes(df)?,
                WriteFlag::FileSignature => self.file_signature(df)?,
                WriteFlag::FileReducedHashes => self.file_reduced_hashes(df)?,
            };
        }
        Ok(())
    }

    /// Makes earlier writes durable, then persists the header with `flag`.
    pub(crate) fn commit(&self, df: &mut DataFile, flag: WriteFlag) -> Result<()> {
        df.sync()?;
        df.header.write_flag = flag.as_u8();
        df.write_header()?;
        if flag != WriteFlag::Idle && self.options.halt_after == Some(flag) {
            log::debug!("Halting file {} after {}", df.number, flag);
            return Err(Error::Interrupted { stage: flag.as_u8() });
        }
        Ok(())
    }

    /// Re-derives the header of an in-progress file from its raw frames.
    fn repair_header(&self, state: &mut WriterState, df: &mut DataFile) -> Result<()> {
        let len = df.len()?;
        let scan = frame::scan(BufReader::new(df.file_mut()), len)?;
        if scan.block_ends.len() > MAX_FILE_BLOCKS as usize || scan.valid_end > u32::MAX as u64 {
            return Err(Error::corruption(format!("file {} cannot be rescanned", df.number)));
        }

        log::warn!(
            "File {} has invalid write flag {}; rescanned {} blocks, dropping {} bytes",
            df.number,
            df.header.write_flag,
            scan.block_ends.len(),
            len - scan.valid_end
        );
        if len > scan.valid_end {
            df.truncate(scan.valid_end)?;
        }
        df.header.write_offset = scan.valid_end as u32;
        df.header.tail_offset = scan.tail() as u32;
        df.header.block_count = scan.block_ends.len() as u32;
        df.header.hash_pending = true;
        self.seek_file(df.number).write_all(&scan.seek_table(), self.options.sync_writes)?;
        self.commit(df, WriteFlag::Idle)?;
        self.update_cell(state, df.number, df.header.write_offset)
    }

    fn redirect(&self, state: &mut WriterState, from: u32, to: u32) {
        state.current_file = to;
        state.open_block = None;
        log::debug!("File {} is closed for writes; writes go to file {}", from, to);
    }

    /// Successor of a locked file whose holder is past creating it.
    ///
    /// Read without the lock: once the flag is at or beyond the successor
    /// step and the folder cell names a later existing file, appends and
    /// block finalizations belong there.
    fn redirect_while_busy(&self, state: &mut WriterState, number: u32) -> Result<Option<u32>> {
        let header = match self.read_header(number) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };
        let closing = header.finalized
            || WriteFlag::from_u8(header.write_flag).is_some_and(|flag| flag.redirects_writers());
        if !closing {
            return Ok(None);
        }
        let slot = self.slot(state)?;
        match self.folder.read(slot)? {
            Some(cell) if cell.file > number && self.paths.data(cell.file).exists() => {
                log::debug!("File {} is locked at write flag {}", number, header.write_flag);
                Ok(Some(cell.file))
            }
            _ => Ok(None),
        }
    }

    /// File that receives writes after `finished`.
    fn successor_of(&self, state: &mut WriterState, finished: u32) -> Result<u32> {
        let slot = self.slot(state)?;
        if let Some(cell) = self.folder.read(slot)? {
            if cell.file > finished && self.paths.data(cell.file).exists() {
                return Ok(cell.file);
            }
        }
        let next = finished + 1;
        if !self.paths.data(next).exists() {
            return Err(Error::corruption(format!(
                "file {} is finalized but its successor is missing",
                finished
            )));
        }
        log::warn!("Folder cell of stream {} is stale; using file {}", self.sid(), next);
        Ok(next)
    }

    fn slot(&self, state: &mut WriterState) -> Result<u32> {
        if let Some(slot) = state.slot {
            return Ok(slot);
        }
        let slot = self.folder.find_or_allocate(self.sid())?;
        state.slot = Some(slot);
        Ok(slot)
    }

    /// Points this stream's folder cell at `file` / `offset`.
    pub(crate) fn update_cell(&self, state: &mut WriterState, file: u32, offset: u32) -> Result<()> {
        let slot = self.slot(state)?;
        self.folder.write(slot, file, offset, self.options.sync_writes)
    }

    /// Records in the open block of `df`, rescanning when the cached count
    /// does not describe the file's current position.
    pub(crate) fn open_block_records(
        &self,
        state: &mut WriterState,
        df: &mut DataFile,
    ) -> Result<u32> {
        let h = df.header;
        if let Some(open) = state.open_block {
            if open.file == df.number
                && open.tail == h.tail_offset
                && open.write_offset == h.write_offset
            {
                return Ok(open.records);
            }
        }

        let mut records = 0;
        if h.has_open_block() {
            let reader = BufReader::new(df.file_mut());
            for frame in FrameReader::new(reader, h.tail_offset as u64, h.write_offset as u64)? {
                if frame?.kind == FrameKind::Record {
                    records += 1;
                }
            }
        }
        state.open_block = Some(OpenBlock {
            file: df.number,
            tail: h.tail_offset,
            write_offset: h.write_offset,
            records,
        });
        Ok(records)
    }

    /// True when the file reached a soft manifest limit.
    pub(crate) fn file_full(&self, df: &DataFile) -> bool {
        df.header.write_offset >= self.manifest.max_file_size
            || df.header.block_count >= self.manifest.max_file_blocks
    }
}

/// Checks that `len` more bytes fit behind `offset` in a data file.
pub(crate) fn check_room(file: u32, offset: u32, len: u64) -> Result<u32> {
    let end = offset as u64 + len;
    if end > crate::format::MAX_FILE_OFFSET {
        return Err(Error::invalid_state(format!(
            "file {} cannot grow past {} bytes; finalize it",
            file,
            crate::format::MAX_FILE_OFFSET
        )));
    }
    debug_assert!(end >= HEADER_SIZE);
    Ok(end as u32)
}
