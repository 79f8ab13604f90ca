use super::datafile::DataFile;
use super::{check_room, AppendInfo, OpenBlock, Recovery, WriteFlag, WriterState};
use crate::error::{Error, Result};
use crate::format::{frame, MAX_RECORD_SIZE};
use crate::Stream;

impl Stream {
    /// Appends one record to the open block of the current file.
    ///
    /// The record is durable once this returns. `block_full` and
    /// `file_full` in the result tell the caller that a manifest limit was
    /// reached; finalizing is left to the caller.
    pub fn append(&self, record: &[u8]) -> Result<AppendInfo> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(Error::RecordTooLarge { size: record.len(), max: MAX_RECORD_SIZE });
        }
        let bytes = frame::encode_record(record)?;

        let mut state = self.writer.lock();
        let mut recovery = Recovery::default();
        let mut df = self.acquire(&mut state, &mut recovery)?;

        let before = df.header;
        check_room(df.number, before.write_offset, bytes.len() as u64)?;
        let record_index = self.open_block_records(&mut state, &mut df)?;

        self.commit(&mut df, WriteFlag::AppendWrite)?;
        self.run(&mut state, &mut df, WriteFlag::AppendWrite, Some(&bytes))?;

        let h = df.header;
        state.open_block = Some(OpenBlock {
            file: df.number,
            tail: h.tail_offset,
            write_offset: h.write_offset,
            records: record_index + 1,
        });

        let block_bytes = h.write_offset - h.tail_offset;
        Ok(AppendInfo {
            file: df.number,
            block: before.next_block(),
            offset: before.write_offset,
            record_index,
            block_full: record_index + 1 >= self.manifest.max_block_records
                || block_bytes >= self.manifest.max_block_size,
            file_full: self.file_full(&df),
        })
    }

    /// Writes an encoded record frame, or on recovery drops whatever a
    /// crashed append left behind the write offset.
    pub(super) fn append_write(&self, df: &mut DataFile, frame: Option<&[u8]>) -> Result<WriteFlag> {
        let offset = df.header.write_offset;
        match frame {
            Some(bytes) => {
                let end = check_room(df.number, offset, bytes.len() as u64)?;
                df.write_at(offset as u64, bytes)?;
                df.header.write_offset = end;
            }
            None => {
                let len = df.len()?;
                if len > offset as u64 {
                    log::warn!(
                        "Dropping {} bytes of an interrupted append in file {}",
                        len - offset as u64,
                        df.number
                    );
                    df.truncate(offset as u64)?;
                }
            }
        }
        self.commit(df, WriteFlag::AppendIndex)?;
        Ok(WriteFlag::AppendIndex)
    }

    pub(super) fn append_index(&self, state: &mut WriterState, df: &mut DataFile) -> Result<WriteFlag> {
        self.update_cell(state, df.number, df.header.write_offset)?;
        self.commit(df, WriteFlag::Idle)?;
        Ok(WriteFlag::Idle)
    }
}
