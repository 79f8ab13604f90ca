//! Record framing.
//!
//! Every frame is an INS length prefix followed by its payload:
//!
//! ```text
//! +len  payload            plain record (0 ..= 4,194,303 bytes)
//! -len  block fields       block end; fields are the optional timestamp and
//!                          block number configured in the manifest
//! C0 00 00                 file close marker (no payload)
//! ```

use super::{HEADER_SIZE, MAX_RECORD_SIZE};
use crate::codec::ins;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Encoded file close marker.
pub const CLOSE_MARKER: [u8; 3] = [0xC0, 0x00, 0x00];

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FrameKind {
    /// An appended record.
    Record,
    /// The record that closes a block.
    BlockEnd,
    /// The marker that closes a file.
    FileClose,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Absolute offset of the frame's first byte in the data file.
    pub offset: u64,
    /// Length of the INS prefix.
    pub prefix_len: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

#[allow(clippy::len_without_is_empty)]
impl Frame {
    /// Total encoded length.
    pub fn len(&self) -> u64 {
        self.prefix_len as u64 + self.payload.len() as u64
    }

    /// Absolute offset just past this frame.
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }
}

/// Encodes a plain record frame.
pub fn encode_record(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_RECORD_SIZE {
        return Err(Error::RecordTooLarge { size: payload.len(), max: MAX_RECORD_SIZE });
    }
    let mut buf = Vec::with_capacity(ins::MAX_WIDTH + payload.len());
    ins::put_positive(payload.len() as u32, &mut buf)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encodes a block end frame carrying `fields`.
pub fn encode_block_end(fields: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(ins::MAX_WIDTH + fields.len());
    ins::put_negative(fields.len() as u32, &mut buf)?;
    buf.extend_from_slice(fields);
    Ok(buf)
}

/// Classifies a decoded prefix. Returns the frame kind and payload length.
pub fn classify(prefix: &ins::Ins) -> Result<(FrameKind, usize)> {
    if !prefix.negative {
        return Ok((FrameKind::Record, prefix.magnitude as usize));
    }
    if prefix.is_alternate() {
        if prefix.magnitude == 0 {
            return Ok((FrameKind::FileClose, 0));
        }
        return Err(Error::corruption(format!(
            "Reserved frame prefix with magnitude {}",
            prefix.magnitude
        )));
    }
    Ok((FrameKind::BlockEnd, prefix.magnitude as usize))
}

/// Lazy reader over the frames between two absolute offsets of a data file.
///
/// The reader is finite and never reads past `end`. A frame that would cross
/// `end` is reported as corruption. To restart, open a new reader at a known
/// frame boundary.
pub struct FrameReader<R> {
    reader: R,
    position: u64,
    end: u64,
    failed: bool,
}

impl FrameReader<BufReader<File>> {
    /// Opens `path` and reads frames in `[start, end)`.
    pub fn open<P: AsRef<Path>>(path: P, start: u64, end: u64) -> Result<Self> {
        let file = File::open(path)?;
        FrameReader::new(BufReader::new(file), start, end)
    }
}

impl<R: Read + Seek> FrameReader<R> {
    /// Reads frames in `[start, end)` from `reader`.
    pub fn new(mut reader: R, start: u64, end: u64) -> Result<Self> {
        if start < HEADER_SIZE {
            return Err(Error::invalid_argument(format!(
                "Frames start at {} or later, got {}",
                HEADER_SIZE, start
            )));
        }
        reader.seek(SeekFrom::Start(start))?;
        Ok(FrameReader { reader, position: start, end, failed: false })
    }

    /// Offset of the next frame.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let offset = self.position;
        let available = self.end - offset;

        let mut prefix = [0u8; ins::MAX_WIDTH];
        self.reader.read_exact(&mut prefix[..1])?;
        let width = ins::encoded_len(prefix[0]);
        if width as u64 > available {
            return Err(Error::corruption(format!("Truncated frame prefix at offset {}", offset)));
        }
        self.reader.read_exact(&mut prefix[1..width])?;

        let decoded = ins::decode(&prefix[..width])?;
        let (kind, len) = classify(&decoded)?;
        if (width + len) as u64 > available {
            return Err(Error::corruption(format!(
                "Frame at offset {} needs {} bytes, {} available",
                offset,
                width + len,
                available
            )));
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        self.position += (width + len) as u64;

        Ok(Frame { kind, offset, prefix_len: width as u8, payload })
    }
}

impl<R: Read + Seek> Iterator for FrameReader<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.end {
            return None;
        }
        match self.read_frame() {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Result of rescanning raw frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    /// Absolute end offset of every block end frame, in order.
    pub block_ends: Vec<u64>,
    /// Absolute end of the last complete frame before any damage or close marker.
    pub valid_end: u64,
    /// Records after the last block end.
    pub open_records: u32,
    /// Offset of the close marker, if one was found.
    pub close_marker: Option<u64>,
    /// The scan stopped at a damaged or truncated frame.
    pub damaged: bool,
}

impl Scan {
    /// Absolute end of the last finalized block.
    pub fn tail(&self) -> u64 {
        self.block_ends.last().copied().unwrap_or(HEADER_SIZE)
    }

    /// Seek table relative to the first record byte, with the leading zero.
    pub fn seek_table(&self) -> Vec<u32> {
        std::iter::once(0)
            .chain(self.block_ends.iter().map(|end| (end - HEADER_SIZE) as u32))
            .collect()
    }
}

/// Rescans frames in `[HEADER_SIZE, end)`, stopping at the first damaged
/// frame or at the close marker.
pub fn scan<R: Read + Seek>(reader: R, end: u64) -> Result<Scan> {
    let mut scan = Scan { valid_end: HEADER_SIZE, ..Scan::default() };
    for frame in FrameReader::new(reader, HEADER_SIZE, end)? {
        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::Io(e)) if e.kind() != std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Io(e))
            }
            Err(_) => {
                scan.damaged = true;
                break;
            }
        };
        match frame.kind {
            FrameKind::Record => scan.open_records += 1,
            FrameKind::BlockEnd => {
                scan.block_ends.push(frame.end());
                scan.open_records = 0;
            }
            FrameKind::FileClose => {
                scan.close_marker = Some(frame.offset);
                break;
            }
        }
        scan.valid_end = frame.end();
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn file_with(frames: &[Vec<u8>]) -> Cursor<Vec<u8>> {
        let mut data = vec![0u8; HEADER_SIZE as usize];
        for f in frames {
            data.extend_from_slice(f);
        }
        Cursor::new(data)
    }

    #[test]
    fn test_encode_frames() {
        assert_eq!(encode_record(b"a").unwrap(), vec![0x01, b'a']);
        assert_eq!(encode_block_end(&[]).unwrap(), vec![0x80, 0x00]);
        assert_eq!(encode_block_end(&[1, 2, 3, 4]).unwrap(), vec![0x80, 0x04, 1, 2, 3, 4]);
    }

    #[test]
    fn test_record_too_large() {
        let big = vec![0u8; MAX_RECORD_SIZE + 1];
        assert!(matches!(encode_record(&big), Err(Error::RecordTooLarge { .. })));

        let max = vec![0u8; MAX_RECORD_SIZE];
        assert_eq!(encode_record(&max).unwrap().len(), MAX_RECORD_SIZE + 3);
    }

    #[test]
    fn test_reader_yields_frames() {
        let cursor = file_with(&[
            encode_record(b"a").unwrap(),
            encode_record(b"bb").unwrap(),
            encode_block_end(&[]).unwrap(),
            CLOSE_MARKER.to_vec(),
        ]);
        let end = cursor.get_ref().len() as u64;
        let frames: Vec<Frame> =
            FrameReader::new(cursor, HEADER_SIZE, end).unwrap().collect::<Result<_>>().unwrap();

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].kind, FrameKind::Record);
        assert_eq!(frames[0].offset, 36);
        assert_eq!(frames[1].payload, b"bb");
        assert_eq!(frames[1].len(), 3);
        assert_eq!(frames[2].kind, FrameKind::BlockEnd);
        assert_eq!(frames[2].end(), 36 + 2 + 3 + 2);
        assert_eq!(frames[3].kind, FrameKind::FileClose);
    }

    #[test]
    fn test_reader_stops_at_end() {
        let cursor = file_with(&[encode_record(b"abc").unwrap(), encode_record(b"de").unwrap()]);
        let frames: Vec<Frame> =
            FrameReader::new(cursor, HEADER_SIZE, 40).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_reader_reports_truncated_frame() {
        let cursor = file_with(&[encode_record(b"abcdef").unwrap()]);
        let mut reader = FrameReader::new(cursor, HEADER_SIZE, 40).unwrap();
        assert!(matches!(reader.next(), Some(Err(Error::Corruption(_)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_reserved_prefix_is_corruption() {
        let cursor = file_with(&[vec![0xC0, 0x00, 0x05]]);
        let end = cursor.get_ref().len() as u64;
        let mut reader = FrameReader::new(cursor, HEADER_SIZE, end).unwrap();
        assert!(matches!(reader.next(), Some(Err(Error::Corruption(_)))));
    }

    #[test]
    fn test_scan_blocks_and_garbage() {
        let mut cursor = file_with(&[
            encode_record(b"a").unwrap(),
            encode_block_end(&[]).unwrap(),
            encode_record(b"b").unwrap(),
            encode_record(b"c").unwrap(),
        ]);
        // half-written record
        cursor.get_mut().extend_from_slice(&[0x05, b'x']);
        let end = cursor.get_ref().len() as u64;

        let scan = scan(cursor, end).unwrap();
        assert_eq!(scan.block_ends, vec![36 + 4]);
        assert_eq!(scan.tail(), 40);
        assert_eq!(scan.valid_end, 44);
        assert_eq!(scan.open_records, 2);
        assert!(scan.damaged);
        assert_eq!(scan.seek_table(), vec![0, 4]);
    }

    #[test]
    fn test_scan_stops_at_close_marker() {
        let cursor = file_with(&[
            encode_record(b"a").unwrap(),
            encode_block_end(&[]).unwrap(),
            CLOSE_MARKER.to_vec(),
            vec![0xAA; 10],
        ]);
        let end = cursor.get_ref().len() as u64;

        let scan = scan(cursor, end).unwrap();
        assert_eq!(scan.close_marker, Some(40));
        assert_eq!(scan.valid_end, 40);
        assert!(!scan.damaged);
    }
}
