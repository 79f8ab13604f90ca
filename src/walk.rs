//! Readers over stored records and blocks.
//!
//! Reading never takes a lock. A reader stops at the write offset found in
//! the header when it starts, so it never sees a record whose append is
//! still in flight.

use crate::error::Result;
use crate::format::frame::{FrameKind, FrameReader, CLOSE_MARKER};
use crate::format::trailer::Trailer;
use crate::format::HEADER_SIZE;
use crate::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::ops::ControlFlow;

/// One record handed to a [`RecordVisitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    /// Data file holding the record.
    pub file: u32,
    /// Global number of the block the record belongs to.
    pub block: u64,
    /// Absolute offset of the record's frame.
    pub offset: u64,
    /// Record payload.
    pub payload: &'a [u8],
}

/// One finalized block handed to a [`BlockVisitor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRef {
    /// Data file holding the block.
    pub file: u32,
    /// Global block number.
    pub number: u64,
    /// Absolute offset of the block's first byte.
    pub start: u64,
    /// Absolute offset just past the block end frame.
    pub end: u64,
    /// Stored chain hash, if this block has one on disk.
    pub hash: Option<Vec<u8>>,
}

/// Receives records in stream order.
pub trait RecordVisitor {
    /// Called once per record. Return `ControlFlow::Break` to stop early.
    fn visit_record(&mut self, record: RecordRef<'_>) -> ControlFlow<()>;
}

/// Receives finalized blocks in stream order.
pub trait BlockVisitor {
    /// Called once per block. Return `ControlFlow::Break` to stop early.
    fn visit_block(&mut self, block: &BlockRef) -> ControlFlow<()>;
}

impl<F> RecordVisitor for F
where
    F: FnMut(RecordRef<'_>) -> ControlFlow<()>,
{
    fn visit_record(&mut self, record: RecordRef<'_>) -> ControlFlow<()> {
        self(record)
    }
}

impl<F> BlockVisitor for F
where
    F: FnMut(&BlockRef) -> ControlFlow<()>,
{
    fn visit_block(&mut self, block: &BlockRef) -> ControlFlow<()> {
        self(block)
    }
}

impl Stream {
    /// Lazy iterator over the frames of `file`, block ends included, up to
    /// the current write offset (finalized files: up to the close marker).
    pub fn records(&self, file: u32) -> Result<FrameReader<BufReader<File>>> {
        let header = self.read_header(file)?;
        let mut end = header.write_offset as u64;
        if header.finalized {
            end -= CLOSE_MARKER.len() as u64;
        }
        FrameReader::open(self.paths.data(file), HEADER_SIZE, end)
    }

    /// Feeds every record of `file` to `visitor`. Returns the number of
    /// records visited.
    pub fn walk_records<V: RecordVisitor>(&self, file: u32, visitor: &mut V) -> Result<u64> {
        let start_block = self.read_header(file)?.start_block as u64;
        let mut block = start_block;
        let mut visited = 0;
        for frame in self.records(file)? {
            let frame = frame?;
            match frame.kind {
                FrameKind::Record => {
                    visited += 1;
                    let record =
                        RecordRef { file, block, offset: frame.offset, payload: &frame.payload };
                    if visitor.visit_record(record).is_break() {
                        break;
                    }
                }
                FrameKind::BlockEnd => block += 1,
                FrameKind::FileClose => break,
            }
        }
        Ok(visited)
    }

    /// Feeds every finalized block of `file` to `visitor`. Returns the number
    /// of blocks visited.
    ///
    /// In-progress files report the hashes their hash file holds; finalized
    /// files only keep the last hash and the reduced hashes.
    pub fn walk_blocks<V: BlockVisitor>(&self, file: u32, visitor: &mut V) -> Result<u64> {
        let header = self.read_header(file)?;
        let seek = self.seek_table_for(file, &header)?;

        let mut stored: HashMap<u32, Vec<u8>> = HashMap::new();
        if header.finalized {
            let mut f = File::open(self.paths.data(file))?;
            let trailer = Trailer::read(&mut f, &header)?;
            stored.extend(trailer.reduced);
            if header.block_count > 0 {
                stored.insert(header.block_count - 1, trailer.last_hash);
            }
        } else {
            let hashes = self.hash_file(file).read()?;
            stored.extend(hashes.into_iter().skip(1).enumerate().map(|(i, h)| (i as u32, h)));
        }

        let mut visited = 0;
        for (i, range) in seek.windows(2).enumerate() {
            let local = i as u32;
            let block = BlockRef {
                file,
                number: header.start_block as u64 + i as u64,
                start: HEADER_SIZE + range[0] as u64,
                end: HEADER_SIZE + range[1] as u64,
                hash: stored.remove(&local),
            };
            visited += 1;
            if visitor.visit_block(&block).is_break() {
                break;
            }
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Manifest, Options, StreamId};
    use tempfile::TempDir;

    fn stream(dir: &TempDir) -> Stream {
        let options = Options::default().sync_writes(false);
        Stream::init(dir.path(), Manifest::new(StreamId::new([3; 8])), options).unwrap()
    }

    #[test]
    fn test_walk_records_assigns_blocks() {
        let dir = TempDir::new().unwrap();
        let stream = stream(&dir);
        stream.append(b"a").unwrap();
        stream.append(b"bb").unwrap();
        stream.finalize_block().unwrap();
        stream.append(b"ccc").unwrap();

        let mut seen = Vec::new();
        let visited = stream
            .walk_records(1, &mut |r: RecordRef<'_>| {
                seen.push((r.block, r.payload.to_vec()));
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(visited, 3);
        assert_eq!(seen, vec![(0, b"a".to_vec()), (0, b"bb".to_vec()), (1, b"ccc".to_vec())]);
    }

    #[test]
    fn test_walk_records_stops_on_break() {
        let dir = TempDir::new().unwrap();
        let stream = stream(&dir);
        for i in 0..5u8 {
            stream.append(&[i]).unwrap();
        }
        let visited = stream
            .walk_records(1, &mut |r: RecordRef<'_>| {
                if r.payload == [1] {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_walk_blocks_reports_ranges() {
        let dir = TempDir::new().unwrap();
        let stream = stream(&dir);
        stream.append(b"hello").unwrap();
        stream.finalize_block().unwrap();
        stream.append(b"x").unwrap();
        stream.finalize_block().unwrap();

        let mut blocks = Vec::new();
        stream
            .walk_blocks(1, &mut |b: &BlockRef| {
                blocks.push(b.clone());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].start, blocks[0].end), (36, 44));
        assert_eq!((blocks[1].start, blocks[1].end), (44, 48));
        assert_eq!(blocks[1].number, 1);
        // hashes are computed lazily, nothing is stored yet
        assert!(blocks.iter().all(|b| b.hash.is_none()));
    }

    #[test]
    fn test_records_of_finalized_file_skip_trailer() {
        let dir = TempDir::new().unwrap();
        let stream = stream(&dir);
        stream.append(b"abc").unwrap();
        stream.finalize_block().unwrap();
        stream.finalize_file().unwrap();

        let kinds: Vec<FrameKind> = stream.records(1).unwrap().map(|f| f.unwrap().kind).collect();
        assert_eq!(kinds, vec![FrameKind::Record, FrameKind::BlockEnd]);
    }
}
