//! File-finalization trailer.
//!
//! The trailer starts at the frozen write offset `T`, right after the close
//! marker:
//!
//! ```text
//! [seek table: (n+1) x u32]        block starts relative to the first record byte
//! [first hash][last hash]          chain entry hash and hash of the last block
//! [0xFF]                           finalized marker
//! [sig len: u16][sig][count: u32]  optional signature over the last hash
//! [count x (u32 block, hash)]      reduced intermediate hashes
//! [cover text]                     offset stored in the header tail field
//! ```

use super::header::Header;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use std::io::{Read, Seek, SeekFrom};

/// Marker byte after the edge hashes.
pub const FINALIZED_MARKER: u8 = 0xFF;

/// Offsets of the trailer sections of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerLayout {
    /// Trailer start (frozen write offset).
    pub start: u64,
    /// Blocks in the file.
    pub blocks: u32,
    /// Digest output size.
    pub hash_size: usize,
}

impl TrailerLayout {
    /// Layout for a file whose header froze the trailer start.
    pub fn of(header: &Header) -> Self {
        TrailerLayout {
            start: header.write_offset as u64,
            blocks: header.block_count,
            hash_size: header.hash_size as usize,
        }
    }

    /// Offset of the seek table.
    pub fn seek_table(&self) -> u64 {
        self.start
    }

    /// Offset of the first edge hash.
    pub fn edge_hashes(&self) -> u64 {
        self.start + 4 * (self.blocks as u64 + 1)
    }

    /// Offset of an edge hash.
    pub fn edge_hash(&self, last: bool) -> u64 {
        self.edge_hashes() + if last { self.hash_size as u64 } else { 0 }
    }

    /// Offset of the finalized marker.
    pub fn marker(&self) -> u64 {
        self.edge_hashes() + 2 * self.hash_size as u64
    }

    /// Offset of the signature block.
    pub fn signature(&self) -> u64 {
        self.marker() + 1
    }

    /// Offset of the reduced hashes for a signature of `sig_len` bytes.
    pub fn reduced(&self, sig_len: usize) -> u64 {
        self.signature() + 2 + sig_len as u64 + 4
    }

    /// Offset of the cover text.
    pub fn cover(&self, sig_len: usize, reduced_count: usize) -> u64 {
        self.reduced(sig_len) + reduced_count as u64 * (4 + self.hash_size as u64)
    }
}

/// Encodes a seek table.
pub fn encode_seek_table(entries: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * 4);
    for entry in entries {
        buf.put_u32(*entry);
    }
    buf
}

/// Encodes the edge hashes followed by the finalized marker.
pub fn encode_edge_hashes(first: &[u8], last: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(first.len() + last.len() + 1);
    buf.put_slice(first);
    buf.put_slice(last);
    buf.put_u8(FINALIZED_MARKER);
    buf
}

/// Encodes the signature block.
pub fn encode_signature(signature: &[u8], reduced_count: u32) -> Result<Vec<u8>> {
    if signature.len() > u16::MAX as usize {
        return Err(Error::invalid_argument(format!(
            "Signature of {} bytes does not fit the length field",
            signature.len()
        )));
    }
    let mut buf = Vec::with_capacity(6 + signature.len());
    buf.put_u16(signature.len() as u16);
    buf.put_slice(signature);
    buf.put_u32(reduced_count);
    Ok(buf)
}

/// Encodes reduced hash entries.
pub fn encode_reduced(entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (block, hash) in entries {
        buf.put_u32(*block);
        buf.put_slice(hash);
    }
    buf
}

/// Picks the local blocks whose hashes are kept in the trailer.
///
/// Walks every block but the last, summing block lengths, and keeps a block
/// each time the running sum exceeds `spacing`.
pub fn select_reduced(seek_table: &[u32], spacing: u64) -> Vec<u32> {
    let mut picked = Vec::new();
    let mut acc = 0u64;
    let blocks = seek_table.len().saturating_sub(1);
    for i in 0..blocks.saturating_sub(1) {
        acc += (seek_table[i + 1] - seek_table[i]) as u64;
        if acc > spacing {
            picked.push(i as u32);
            acc = 0;
        }
    }
    picked
}

/// A parsed trailer of a finalized file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    /// Section offsets.
    pub layout: TrailerLayout,
    /// Block starts relative to the first record byte, plus the terminal offset.
    pub seek_table: Vec<u32>,
    /// Chain entry hash.
    pub first_hash: Vec<u8>,
    /// Hash of the last block.
    pub last_hash: Vec<u8>,
    /// Signature over the last hash; empty when unsigned.
    pub signature: Vec<u8>,
    /// Reduced intermediate hashes by local block index.
    pub reduced: Vec<(u32, Vec<u8>)>,
    /// Cover text.
    pub cover: String,
}

impl Trailer {
    /// Reads the trailer of a completely finalized file.
    pub fn read<R: Read + Seek>(reader: &mut R, header: &Header) -> Result<Self> {
        if !header.finalized || header.write_flag != 0 {
            return Err(Error::invalid_state("file is not completely finalized"));
        }
        let layout = TrailerLayout::of(header);
        let cover_offset = header.tail_offset as u64;
        if cover_offset < layout.signature() + 6 {
            return Err(Error::corruption(format!(
                "Cover offset {} lies inside the trailer",
                cover_offset
            )));
        }

        reader.seek(SeekFrom::Start(layout.start))?;
        let mut fixed = vec![0u8; (layout.signature() + 2 - layout.start) as usize];
        reader.read_exact(&mut fixed)?;
        let mut buf = &fixed[..];

        let seek_table: Vec<u32> = (0..=layout.blocks).map(|_| buf.get_u32()).collect();
        let first_hash = buf[..layout.hash_size].to_vec();
        buf.advance(layout.hash_size);
        let last_hash = buf[..layout.hash_size].to_vec();
        buf.advance(layout.hash_size);
        let marker = buf.get_u8();
        if marker != FINALIZED_MARKER {
            return Err(Error::corruption(format!("Invalid finalized marker {:#04x}", marker)));
        }
        let sig_len = buf.get_u16() as usize;

        let expected_min = layout.reduced(sig_len);
        if cover_offset < expected_min {
            return Err(Error::corruption("Signature block overlaps the cover"));
        }
        let mut rest = vec![0u8; (cover_offset - layout.signature() - 2) as usize];
        reader.read_exact(&mut rest)?;
        let mut buf = &rest[..];

        let signature = buf[..sig_len].to_vec();
        buf.advance(sig_len);
        let count = buf.get_u32() as usize;
        if buf.remaining() != count * (4 + layout.hash_size) {
            return Err(Error::corruption(format!(
                "Reduced hash count {} does not match the space before the cover",
                count
            )));
        }
        let mut reduced = Vec::with_capacity(count);
        for _ in 0..count {
            let block = buf.get_u32();
            reduced.push((block, buf[..layout.hash_size].to_vec()));
            buf.advance(layout.hash_size);
        }

        let mut cover_bytes = Vec::new();
        reader.read_to_end(&mut cover_bytes)?;
        let cover = String::from_utf8(cover_bytes)
            .map_err(|_| Error::corruption("Cover text is not UTF-8"))?;
        if !cover.starts_with("HSD:") {
            return Err(Error::corruption("Missing cover text"));
        }

        Ok(Trailer { layout, seek_table, first_hash, last_hash, signature, reduced, cover })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{cover_text, StreamId, HEADER_SIZE};
    use std::io::Cursor;

    #[test]
    fn test_layout_offsets() {
        let layout = TrailerLayout { start: 100, blocks: 2, hash_size: 32 };
        assert_eq!(layout.seek_table(), 100);
        assert_eq!(layout.edge_hashes(), 112);
        assert_eq!(layout.edge_hash(true), 144);
        assert_eq!(layout.marker(), 176);
        assert_eq!(layout.signature(), 177);
        assert_eq!(layout.reduced(64), 177 + 2 + 64 + 4);
        assert_eq!(layout.cover(64, 2), 177 + 2 + 64 + 4 + 72);
    }

    #[test]
    fn test_select_reduced() {
        // blocks of 40_000 bytes: running sum passes 65,535 on every second block
        let seek: Vec<u32> = (0..=6).map(|i| i * 40_000).collect();
        assert_eq!(select_reduced(&seek, 65_535), vec![1, 3]);

        // the last block is never picked
        assert!(select_reduced(&[0, 100_000], 65_535).is_empty());
        assert_eq!(select_reduced(&[0, 100_000, 200_000], 65_535), vec![0]);
        assert!(select_reduced(&[0], 65_535).is_empty());
    }

    #[test]
    fn test_read_trailer() {
        let sid = StreamId::new([9; 8]);
        let hs = 4;
        let mut header = Header::new(sid, hs as u8, 0, 0);
        header.block_count = 2;
        header.finalized = true;
        header.write_offset = 50;

        let mut data = vec![0u8; 50];
        data.extend(encode_seek_table(&[0, 5, 11]));
        data.extend(encode_edge_hashes(&[1; 4], &[2; 4]));
        data.extend(encode_signature(&[7; 3], 1).unwrap());
        data.extend(encode_reduced(&[(0, vec![3; 4])]));
        header.tail_offset = data.len() as u32;
        data.extend(cover_text(sid, 1, 2).as_bytes());
        data[..HEADER_SIZE as usize].copy_from_slice(&header.encode());

        let trailer = Trailer::read(&mut Cursor::new(data), &header).unwrap();
        assert_eq!(trailer.seek_table, vec![0, 5, 11]);
        assert_eq!(trailer.first_hash, vec![1; 4]);
        assert_eq!(trailer.last_hash, vec![2; 4]);
        assert_eq!(trailer.signature, vec![7; 3]);
        assert_eq!(trailer.reduced, vec![(0, vec![3; 4])]);
        assert_eq!(trailer.cover, "HSD:0909090909090909:00000001:2\n");
        assert_eq!(header.tail_offset as u64, trailer.layout.cover(3, 1));
    }

    #[test]
    fn test_read_rejects_unfinalized() {
        let header = Header::new(StreamId::new([1; 8]), 32, 0, 0);
        let result = Trailer::read(&mut Cursor::new(vec![0u8; 64]), &header);
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_signature_too_long() {
        assert!(encode_signature(&vec![0u8; 70_000], 0).is_err());
    }
}
