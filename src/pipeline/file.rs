use super::datafile::DataFile;
use super::{check_room, FileInfo, Recovery, WriteFlag, WriterState};
use crate::error::{Error, Result};
use crate::format::frame::CLOSE_MARKER;
use crate::format::header::Header;
use crate::format::trailer::{self, Trailer, TrailerLayout};
use crate::format::{cover_text, SideFile, HEADER_SIZE};
use crate::hash::chain;
use crate::index::remove_if_exists;
use crate::Stream;
use bytes::Buf;
use std::io::BufReader;

impl Stream {
    /// Finalizes the current file and redirects writers to its successor.
    ///
    /// The last block must be finalized. Missing hashes are computed first,
    /// then the close marker and trailer are written. With a signer the last
    /// chain hash is signed.
    pub fn finalize_file(&self) -> Result<FileInfo> {
        let mut state = self.writer.lock();
        let mut df = self.acquire(&mut state, &mut Recovery::default())?;

        let h = df.header;
        if h.block_count == 0 || h.has_open_block() {
            return Err(Error::invalid_state(format!(
                "last block of file {} not finalized",
                df.number
            )));
        }
        if self.manifest.is_signed() && self.signer.is_none() {
            return Err(Error::invalid_state(format!(
                "stream {} is signed but no signer was supplied",
                self.sid()
            )));
        }
        check_room(df.number, h.write_offset, CLOSE_MARKER.len() as u64)?;

        self.catch_up_hashes(df.number, &h)?;
        self.commit(&mut df, WriteFlag::FileClose)?;
        self.run(&mut state, &mut df, WriteFlag::FileClose, None)?;
        state.current_file = df.number + 1;
        state.open_block = None;

        let header = df.header;
        let trailer = Trailer::read(df.file_mut(), &header)?;
        let info = FileInfo {
            file: df.number,
            blocks: header.block_count,
            start_block: header.start_block,
            next_file: df.number + 1,
            signed: !trailer.signature.is_empty(),
            reduced_hashes: trailer.reduced.len() as u32,
        };
        log::info!(
            "Finalized file {} of stream {} ({} blocks, {} reduced hashes)",
            info.file,
            self.sid(),
            info.blocks,
            info.reduced_hashes
        );
        Ok(info)
    }

    pub(super) fn file_close(&self, df: &mut DataFile) -> Result<WriteFlag> {
        let offset = df.header.write_offset;
        let end = check_room(df.number, offset, CLOSE_MARKER.len() as u64)?;
        df.write_at(offset as u64, &CLOSE_MARKER)?;
        df.header.write_offset = end;
        self.commit(df, WriteFlag::FileSuccessor)?;
        Ok(WriteFlag::FileSuccessor)
    }

    /// Creates the successor file and points writers at it.
    pub(super) fn file_successor(&self, state: &mut WriterState, df: &mut DataFile) -> Result<WriteFlag> {
        let h = df.header;
        let next = df.number.checked_add(1).ok_or_else(|| Error::invalid_state("file numbers exhausted"))?;
        let start_block = h
            .start_block
            .checked_add(h.block_count)
            .ok_or_else(|| Error::invalid_state("global block numbers exhausted"))?;
        let start_offset = h.start_offset + (h.write_offset as u64 - HEADER_SIZE);
        let sync = self.options.sync_writes;

        let existing = match self.read_header(next) {
            Ok(header) => Some(header),
            Err(Error::NotFound(_)) | Err(Error::Corruption(_)) => None,
            Err(e) => return Err(e),
        };
        let successor = match existing {
            Some(header)
                if header.sid == h.sid
                    && header.start_block == start_block
                    && header.start_offset == start_offset =>
            {
                header
            }
            _ => {
                let header = Header::new(h.sid, h.hash_size, start_block, start_offset);
                DataFile::create(&self.paths.data(next), next, header, sync)?;
                for kind in SideFile::ALL {
                    remove_if_exists(&self.paths.side(next, kind))?;
                }
                header
            }
        };

        let seek = self.seek_file(next);
        if seek.read()?.is_empty() {
            seek.write_all(&[0], sync)?;
        }
        let hash_file = self.hash_file(next);
        if hash_file.read()?.is_empty() {
            let (hashes, _) = self.catch_up_hashes(df.number, &h)?;
            let last = hashes.last().cloned().ok_or_else(|| Error::internal("empty hash chain"))?;
            hash_file.put_from(0, &[last], sync)?;
        }

        self.locator().record(next, start_block, sync)?;
        self.update_cell(state, next, successor.write_offset)?;
        log::debug!("File {} redirects writers to file {}", df.number, next);

        self.commit(df, WriteFlag::FileSeekTable)?;
        Ok(WriteFlag::FileSeekTable)
    }

    pub(super) fn file_seek_table(&self, df: &mut DataFile) -> Result<WriteFlag> {
        let h = df.header;
        let table = self.seek_table_for(df.number, &h)?;
        let layout = TrailerLayout::of(&h);
        df.write_at(layout.seek_table(), &trailer::encode_seek_table(&table))?;
        self.commit(df, WriteFlag::FileEdgeHashes)?;
        Ok(WriteFlag::FileEdgeHashes)
    }

    /// Writes the edge hashes and marks the file finalized.
    pub(super) fn file_edge_hashes(&self, df: &mut DataFile) -> Result<WriteFlag> {
        let h = df.header;
        let (hashes, _) = self.catch_up_hashes(df.number, &h)?;
        let (first, last) = match (hashes.first(), hashes.last()) {
            (Some(first), Some(last)) if hashes.len() == h.block_count as usize + 1 => (first, last),
            _ => return Err(Error::internal(format!("hash chain of file {} is incomplete", df.number))),
        };
        let layout = TrailerLayout::of(&h);
        df.write_at(layout.edge_hashes(), &trailer::encode_edge_hashes(first, last))?;

        df.header.finalized = true;
        df.header.hash_pending = false;
        self.commit(df, WriteFlag::FileSignature)?;
        self.remove_side_files(df.number)?;
        Ok(WriteFlag::FileSignature)
    }

    /// Signs the last hash and picks the reduced hashes.
    pub(super) fn file_signature(&self, df: &mut DataFile) -> Result<WriteFlag> {
        self.remove_side_files(df.number)?;
        let h = df.header;
        let layout = TrailerLayout::of(&h);
        let seek = self.seek_table_for(df.number, &h)?;
        let picks = trailer::select_reduced(&seek, self.manifest.reduced_hash_spacing as u64);

        let signature = match &self.signer {
            Some(signer) => {
                let last = df.read_at(layout.edge_hash(true), layout.hash_size)?;
                let signature = signer.sign(&last)?;
                if signature.len() < self.options.min_signature_len {
                    return Err(Error::corruption(format!(
                        "signature of {} bytes is shorter than the minimum of {}",
                        signature.len(),
                        self.options.min_signature_len
                    )));
                }
                signature
            }
            None if self.manifest.is_signed() => {
                return Err(Error::invalid_state(format!(
                    "file {} needs a signature but no signer was supplied",
                    df.number
                )));
            }
            None => Vec::new(),
        };
        df.write_at(layout.signature(), &trailer::encode_signature(&signature, picks.len() as u32)?)?;

        if picks.is_empty() {
            self.finish_trailer(df, layout.cover(signature.len(), 0))?;
            return Ok(WriteFlag::Idle);
        }
        self.commit(df, WriteFlag::FileReducedHashes)?;
        Ok(WriteFlag::FileReducedHashes)
    }

    pub(super) fn file_reduced_hashes(&self, df: &mut DataFile) -> Result<WriteFlag> {
        let h = df.header;
        let layout = TrailerLayout::of(&h);
        let sig_len = df.read_at(layout.signature(), 2)?.as_slice().get_u16() as usize;
        let count = df.read_at(layout.signature() + 2 + sig_len as u64, 4)?.as_slice().get_u32() as usize;

        let seek = self.seek_table_for(df.number, &h)?;
        let picks = trailer::select_reduced(&seek, self.manifest.reduced_hash_spacing as u64);
        if picks.len() != count {
            return Err(Error::corruption(format!(
                "file {} announces {} reduced hashes, spacing selects {}",
                df.number,
                count,
                picks.len()
            )));
        }

        let first = df.read_at(layout.edge_hash(false), layout.hash_size)?;
        let end = picks.last().map_or(0, |&last| last + 1);
        let mut reader = BufReader::new(df.file_mut());
        let hashes = chain::hash_blocks(self.digest.as_ref(), &mut reader, &seek, 0, end, first)?;
        let entries: Vec<(u32, Vec<u8>)> =
            picks.iter().map(|&block| (block, hashes[block as usize].clone())).collect();
        df.write_at(layout.reduced(sig_len), &trailer::encode_reduced(&entries))?;

        self.finish_trailer(df, layout.cover(sig_len, count))?;
        Ok(WriteFlag::Idle)
    }

    /// Writes the cover text, cuts the file after it and clears the flag.
    fn finish_trailer(&self, df: &mut DataFile, cover_offset: u64) -> Result<()> {
        let cover = cover_text(df.header.sid, df.number, df.header.block_count);
        df.write_at(cover_offset, cover.as_bytes())?;
        df.truncate(cover_offset + cover.len() as u64)?;
        df.header.tail_offset = u32::try_from(cover_offset)
            .map_err(|_| Error::invalid_state(format!("trailer of file {} passes 4 GiB", df.number)))?;
        self.commit(df, WriteFlag::Idle)
    }

    fn remove_side_files(&self, file: u32) -> Result<()> {
        for kind in SideFile::ALL {
            remove_if_exists(&self.paths.side(file, kind))?;
        }
        Ok(())
    }
}
