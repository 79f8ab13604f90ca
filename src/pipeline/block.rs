use super::datafile::DataFile;
use super::{check_room, BlockInfo, Recovery, WriteFlag, WriterState};
use crate::error::{Error, Result};
use crate::format::header::Header;
use crate::format::{frame, HEADER_SIZE, MAX_FILE_BLOCKS};
use crate::index::SeekFile;
use crate::Stream;
use bytes::BufMut;
use std::io::BufReader;
use std::time::{SystemTime, UNIX_EPOCH};

impl Stream {
    /// Closes the open block of the current file.
    ///
    /// The block's bytes are immutable afterwards. Its hash is not computed
    /// here; the header is flagged hash-pending instead.
    pub fn finalize_block(&self) -> Result<BlockInfo> {
        let mut state = self.writer.lock();
        let mut df = self.acquire(&mut state, &mut Recovery::default())?;

        let before = df.header;
        if !before.has_open_block() {
            return Err(Error::invalid_state(format!("file {} has no open block", df.number)));
        }
        if before.block_count >= MAX_FILE_BLOCKS {
            return Err(Error::invalid_state(format!(
                "file {} holds the maximum of {} blocks; finalize it",
                df.number, MAX_FILE_BLOCKS
            )));
        }
        let fields_len = self.manifest.block_fields_len() as u64;
        check_room(df.number, before.write_offset, 2 + fields_len)?;
        let records = self.open_block_records(&mut state, &mut df)?;

        self.commit(&mut df, WriteFlag::BlockWrite)?;
        self.run(&mut state, &mut df, WriteFlag::BlockWrite, None)?;
        state.open_block = None;

        let info = BlockInfo {
            file: df.number,
            block: before.next_block(),
            offset: before.tail_offset,
            length: df.header.tail_offset - before.tail_offset,
            records,
            file_full: self.file_full(&df),
        };
        log::debug!(
            "Finalized block {} of stream {} ({} records, {} bytes)",
            info.block,
            self.sid(),
            info.records,
            info.length
        );
        Ok(info)
    }

    /// Payload of the block end frame for the block being closed.
    fn block_fields(&self, header: &Header) -> Vec<u8> {
        let mut fields = Vec::with_capacity(self.manifest.block_fields_len());
        if self.manifest.timestamp_field {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
            fields.put_u32(now as u32);
        }
        if self.manifest.block_number_field {
            fields.put_u32(header.next_block() as u32);
        }
        fields
    }

    pub(super) fn block_write(&self, df: &mut DataFile) -> Result<WriteFlag> {
        let bytes = frame::encode_block_end(&self.block_fields(&df.header))?;
        let offset = df.header.write_offset;
        let end = check_room(df.number, offset, bytes.len() as u64)?;
        df.write_at(offset as u64, &bytes)?;

        df.header.write_offset = end;
        df.header.tail_offset = end;
        df.header.block_count += 1;
        df.header.hash_pending = true;
        self.commit(df, WriteFlag::BlockIndex)?;
        Ok(WriteFlag::BlockIndex)
    }

    /// Appends the new block boundary to the seek file, rebuilding it from
    /// the frames when it does not line up with the header.
    pub(super) fn block_index(&self, state: &mut WriterState, df: &mut DataFile) -> Result<WriteFlag> {
        let h = df.header;
        let count = h.block_count as usize;
        let tail = h.tail_offset - HEADER_SIZE as u32;
        let seek = self.seek_file(df.number);
        let entries = seek.read()?;
        let sync = self.options.sync_writes;

        let prefix_ok = entries.len() >= count
            && SeekFile::matches(&entries[..count], h.block_count - 1, entries[count - 1])
            && entries[count - 1] < tail;
        if SeekFile::matches(&entries, h.block_count, tail) {
            log::debug!("Seek file of file {} already has block {}", df.number, count - 1);
        } else if prefix_ok {
            seek.put(h.block_count, tail, sync)?;
        } else {
            log::warn!("Seek file of file {} is out of step; rebuilding it", df.number);
            let scan = frame::scan(BufReader::new(df.file_mut()), h.tail_offset as u64)?;
            let table = scan.seek_table();
            if scan.damaged || !SeekFile::matches(&table, h.block_count, tail) {
                return Err(Error::corruption(format!(
                    "frames of file {} disagree with its header ({} blocks)",
                    df.number, h.block_count
                )));
            }
            seek.write_all(&table, sync)?;
        }

        self.update_cell(state, df.number, h.write_offset)?;
        self.commit(df, WriteFlag::Idle)?;
        Ok(WriteFlag::Idle)
    }
}
