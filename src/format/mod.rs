//! On-disk layout of a stream: ids, file names, the data file header, record
//! framing and the file-finalization trailer.
//!
//! A stream directory looks like this:
//!
//! ```text
//! <folder>/
//!   streams.list                      shared folder-cell index
//!   0102030405060708/
//!     man.bin                         manifest (III)
//!     0102030405060708-blkn.sat       file -> start block locator
//!     0102030405060708-00000001.hsd   finalized data file
//!     0102030405060708-00000002.hsd   current data file
//!     0102030405060708-00000002s.sat  seek table
//!     0102030405060708-00000002h.sat  hash table
//!     0102030405060708-00000002x.sat  hash candidates
//! ```

pub mod frame;
pub mod header;
pub mod trailer;

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Size of the data file header in bytes. Records start here.
pub const HEADER_SIZE: u64 = 36;

/// Largest record payload in bytes.
pub const MAX_RECORD_SIZE: usize = crate::codec::ins::MAX_POSITIVE as usize;

/// Largest number of blocks a single file can hold.
pub const MAX_FILE_BLOCKS: u32 = 0x00FF_FFFF;

/// Largest absolute offset inside a data file.
pub const MAX_FILE_OFFSET: u64 = u32::MAX as u64;

/// Manifest file name.
pub const MANIFEST_FILE: &str = "man.bin";

/// Shared folder-cell index file name, one level above stream directories.
pub const FOLDER_INDEX_FILE: &str = "streams.list";

/// An 8-byte stream identifier, written as 16 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId([u8; 8]);

impl StreamId {
    /// Creates an id from raw bytes.
    pub const fn new(bytes: [u8; 8]) -> Self {
        StreamId(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// True for the all-zero id, which marks an empty folder slot.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 16 {
            return Err(Error::invalid_argument(format!(
                "stream id must be 16 hex chars, got '{}'",
                s
            )));
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::invalid_argument(format!("stream id '{}': {}", s, e)))?;
        Ok(StreamId(bytes))
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Side files kept next to a data file until it is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideFile {
    /// Block start offsets.
    Seek,
    /// Canonical chain hashes.
    Hashes,
    /// Staged hash candidates.
    Candidates,
}

impl SideFile {
    fn suffix(self) -> char {
        match self {
            SideFile::Seek => 's',
            SideFile::Hashes => 'h',
            SideFile::Candidates => 'x',
        }
    }

    /// All side files.
    pub const ALL: [SideFile; 3] = [SideFile::Seek, SideFile::Hashes, SideFile::Candidates];
}

/// Path helper for one stream directory.
#[derive(Debug, Clone)]
pub struct StreamPaths {
    folder: PathBuf,
    dir: PathBuf,
    sid: StreamId,
}

impl StreamPaths {
    /// Paths for `sid` inside `folder`.
    pub fn new(folder: impl AsRef<Path>, sid: StreamId) -> Self {
        let folder = folder.as_ref().to_path_buf();
        let dir = folder.join(sid.to_string());
        StreamPaths { folder, dir, sid }
    }

    /// Stream id.
    pub fn sid(&self) -> StreamId {
        self.sid
    }

    /// Parent folder shared with other streams.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Stream directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Data file `number`.
    pub fn data(&self, number: u32) -> PathBuf {
        self.dir.join(format!("{}-{:08x}.hsd", self.sid, number))
    }

    /// Side file of data file `number`.
    pub fn side(&self, number: u32, kind: SideFile) -> PathBuf {
        self.dir.join(format!("{}-{:08x}{}.sat", self.sid, number, kind.suffix()))
    }

    /// Manifest.
    pub fn manifest(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Global block locator.
    pub fn locator(&self) -> PathBuf {
        self.dir.join(format!("{}-blkn.sat", self.sid))
    }

    /// Shared folder-cell index.
    pub fn folder_index(&self) -> PathBuf {
        self.folder.join(FOLDER_INDEX_FILE)
    }

    /// Parses a data file name of this stream and returns its number.
    pub fn parse_data_name(&self, name: &str) -> Option<u32> {
        let rest = name.strip_prefix(&self.sid.to_string())?.strip_prefix('-')?;
        let hex_part = rest.strip_suffix(".hsd")?;
        if hex_part.len() != 8 {
            return None;
        }
        u32::from_str_radix(hex_part, 16).ok()
    }
}

/// Cover text terminating a finalized file.
pub fn cover_text(sid: StreamId, file: u32, blocks: u32) -> String {
    format!("HSD:{}:{:08x}:{}\n", sid, file, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_hex() {
        let sid: StreamId = "0102030405060708".parse().unwrap();
        assert_eq!(sid.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(sid.to_string(), "0102030405060708");

        assert!("0102".parse::<StreamId>().is_err());
        assert!("zz02030405060708".parse::<StreamId>().is_err());
        assert!(StreamId::default().is_zero());
    }

    #[test]
    fn test_file_names() {
        let sid: StreamId = "0102030405060708".parse().unwrap();
        let paths = StreamPaths::new("/data", sid);

        assert_eq!(paths.dir(), Path::new("/data/0102030405060708"));
        assert_eq!(
            paths.data(1),
            Path::new("/data/0102030405060708/0102030405060708-00000001.hsd")
        );
        assert_eq!(
            paths.side(26, SideFile::Hashes),
            Path::new("/data/0102030405060708/0102030405060708-0000001ah.sat")
        );
        assert_eq!(paths.folder_index(), Path::new("/data/streams.list"));
        assert_eq!(
            paths.locator(),
            Path::new("/data/0102030405060708/0102030405060708-blkn.sat")
        );
    }

    #[test]
    fn test_parse_data_name() {
        let sid: StreamId = "0102030405060708".parse().unwrap();
        let paths = StreamPaths::new("/data", sid);

        assert_eq!(paths.parse_data_name("0102030405060708-0000000a.hsd"), Some(10));
        assert_eq!(paths.parse_data_name("0102030405060708-0000000as.sat"), None);
        assert_eq!(paths.parse_data_name("ffffffffffffffff-00000001.hsd"), None);
        assert_eq!(paths.parse_data_name("man.bin"), None);
    }

    #[test]
    fn test_cover_text() {
        let sid: StreamId = "0102030405060708".parse().unwrap();
        assert_eq!(cover_text(sid, 3, 12), "HSD:0102030405060708:00000003:12\n");
    }
}
