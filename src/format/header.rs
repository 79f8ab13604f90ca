//! Data file header.
//!
//! The header is a fixed-size (36 bytes) big-endian structure at the start of
//! every data file. It is rewritten in place by every durable pipeline step.
//!
//! Format:
//! ```text
//! [frame size: 1]      always 9 (header length / 4)
//! [magic: 1]           'H'
//! [hash size: 1]       high bit set while a hash update is pending
//! [write flag: 1]      pipeline state, see WriteFlag
//! [block count: 4]     finalized files: 0xFF followed by a 24-bit count
//! [start block: 4]     global number of the first block
//! [start offset: 8]    logical stream position of the first record byte
//! [stream id: 8]
//! [write offset: 4]    end of durable data; trailer start once finalizing
//! [tail offset: 4]     end of the last finalized block; cover offset once finalized
//! ```

use super::{StreamId, HEADER_SIZE, MAX_FILE_BLOCKS};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use std::io::{Read, Write};

/// Value of the first header byte.
pub const FRAME_SIZE_MARKER: u8 = (HEADER_SIZE / 4) as u8;

/// Header magic.
pub const MAGIC: u8 = b'H';

const HASH_PENDING: u8 = 0x80;
const FINALIZED: u32 = 0xFF00_0000;

/// Decoded data file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Header {
    /// Digest output size, 1..=127.
    pub hash_size: u8,
    /// Blocks were finalized since the hash table was last brought up to date.
    pub hash_pending: bool,
    /// Raw write flag. Decoding does not validate it so that damaged values
    /// can reach the repair path.
    pub write_flag: u8,
    /// Finalized blocks in this file.
    pub block_count: u32,
    /// The trailer's edge hashes have been written.
    pub finalized: bool,
    /// Global number of this file's first block.
    pub start_block: u32,
    /// Logical stream position of this file's first record byte.
    pub start_offset: u64,
    /// Owning stream.
    pub sid: StreamId,
    /// Absolute end of durable data.
    pub write_offset: u32,
    /// Absolute end of the last finalized block, or the cover offset.
    pub tail_offset: u32,
}

impl Header {
    /// Header of a fresh, empty data file.
    pub fn new(sid: StreamId, hash_size: u8, start_block: u32, start_offset: u64) -> Self {
        Header {
            hash_size,
            hash_pending: false,
            write_flag: 0,
            block_count: 0,
            finalized: false,
            start_block,
            start_offset,
            sid,
            write_offset: HEADER_SIZE as u32,
            tail_offset: HEADER_SIZE as u32,
        }
    }

    /// True while the last block is still open (records after the tail).
    pub fn has_open_block(&self) -> bool {
        self.write_offset > self.tail_offset
    }

    /// Global number the next finalized block will get.
    pub fn next_block(&self) -> u64 {
        self.start_block as u64 + self.block_count as u64
    }

    /// Encodes the header (36 bytes).
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        let mut buf = &mut out[..];

        buf.put_u8(FRAME_SIZE_MARKER);
        buf.put_u8(MAGIC);
        buf.put_u8(self.hash_size | if self.hash_pending { HASH_PENDING } else { 0 });
        buf.put_u8(self.write_flag);
        if self.finalized {
            buf.put_u32(FINALIZED | self.block_count);
        } else {
            buf.put_u32(self.block_count);
        }
        buf.put_u32(self.start_block);
        buf.put_u64(self.start_offset);
        buf.put_slice(self.sid.as_bytes());
        buf.put_u32(self.write_offset);
        buf.put_u32(self.tail_offset);

        out
    }

    /// Decodes a header.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE as usize {
            return Err(Error::corruption(format!(
                "Header too short: expected {}, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }

        let mut buf = &data[..HEADER_SIZE as usize];
        let marker = buf.get_u8();
        let magic = buf.get_u8();
        if marker != FRAME_SIZE_MARKER || magic != MAGIC {
            return Err(Error::corruption(format!(
                "Invalid header magic: {:#04x} {:#04x}",
                marker, magic
            )));
        }

        let hs = buf.get_u8();
        let hash_size = hs & !HASH_PENDING;
        if hash_size == 0 {
            return Err(Error::corruption("Header hash size is zero"));
        }
        let write_flag = buf.get_u8();

        let raw_count = buf.get_u32();
        let (finalized, block_count) = if raw_count & FINALIZED == FINALIZED {
            (true, raw_count & MAX_FILE_BLOCKS)
        } else if raw_count > MAX_FILE_BLOCKS {
            return Err(Error::corruption(format!("Invalid block count {:#x}", raw_count)));
        } else {
            (false, raw_count)
        };

        let start_block = buf.get_u32();
        let start_offset = buf.get_u64();
        let mut sid = [0u8; 8];
        buf.copy_to_slice(&mut sid);
        let write_offset = buf.get_u32();
        let tail_offset = buf.get_u32();

        if (write_offset as u64) < HEADER_SIZE || (tail_offset as u64) < HEADER_SIZE {
            return Err(Error::corruption(format!(
                "Header offsets point into the header: write {}, tail {}",
                write_offset, tail_offset
            )));
        }

        Ok(Header {
            hash_size,
            hash_pending: hs & HASH_PENDING != 0,
            write_flag,
            block_count,
            finalized,
            start_block,
            start_offset,
            sid: StreamId::new(sid),
            write_offset,
            tail_offset,
        })
    }

    /// Writes the header to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Reads a header from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::corruption("Data file shorter than its header")
            } else {
                Error::Io(e)
            }
        })?;
        Self::decode(&buf)
    }
}
