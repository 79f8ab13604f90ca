//! # HSD - An Append-Only Hash-Chained Stream Store
//!
//! HSD stores streams of binary records in numbered data files. Records are
//! grouped into blocks and every finalized block is chained to its
//! predecessor by `H(prev_hash || block_bytes)`, so the history of a stream
//! can be verified from its first block to its last.
//!
//! ## Architecture
//!
//! - **Codec**: INS length prefixes and the III key/value encoding
//! - **Format**: the 36-byte file header, record framing, the trailer
//! - **Pipeline**: append, block finalize and file finalize, each driven by a
//!   persisted write flag so an interrupted step resumes where it stopped
//! - **Hash engine**: chain computation, verification, repair and
//!   out-of-band workers
//! - **Side indexes**: seek tables, hash tables, the folder index and the
//!   global block locator
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hsd::{Manifest, Options, Stream, StreamId};
//!
//! # fn main() -> Result<(), hsd::Error> {
//! let sid = StreamId::new([1, 2, 3, 4, 5, 6, 7, 8]);
//! let stream = Stream::init("./streams", Manifest::new(sid), Options::default())?;
//!
//! stream.append(b"first record")?;
//! stream.append(b"second record")?;
//! stream.finalize_block()?;
//!
//! let file = stream.finalize_file()?;
//! let report = stream.verify_hashes(file.file)?;
//! assert_eq!(report.verified, report.blocks);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod hash;
pub mod index;
pub mod manifest;
pub mod pipeline;
pub mod signer;
pub mod walk;

// Re-exports
pub use config::Options;
pub use error::{Error, Result};
pub use format::header::Header;
pub use format::StreamId;
pub use hash::{Digest, Edge, HashAlgorithm, HashUpdate, HashWorker, VerifyReport};
pub use index::RepairOutcome;
pub use manifest::Manifest;
pub use pipeline::{AppendInfo, BlockInfo, FileInfo, Recovery, WriteFlag};
pub use signer::Signer;
pub use walk::{BlockRef, BlockVisitor, RecordRef, RecordVisitor};

use format::{StreamPaths, HEADER_SIZE};
use index::{CandidateFile, FolderIndex, HashFile, Locator, SeekFile};
use parking_lot::Mutex;
use pipeline::datafile::DataFile;
use pipeline::WriterState;
use serde::Serialize;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

/// Handle to one stream.
///
/// All writes go through an in-process mutex and the exclusive lock of the
/// current data file, so a `Stream` can be shared across threads using
/// `Arc<Stream>` and several processes may open the same stream: only one of
/// them writes at a time, the others get [`Error::Busy`].
pub struct Stream {
    pub(crate) paths: StreamPaths,
    pub(crate) manifest: Manifest,
    pub(crate) options: Options,
    pub(crate) digest: Arc<dyn Digest>,
    pub(crate) signer: Option<Arc<dyn Signer>>,
    pub(crate) folder: FolderIndex,
    pub(crate) writer: Mutex<WriterState>,
}

/// Snapshot returned by [`Stream::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// Stream id.
    pub sid: StreamId,
    /// Digest name.
    pub hash_algorithm: String,
    /// File receiving writes.
    pub current_file: u32,
    /// Lowest data file number on disk.
    pub first_file: u32,
    /// Header of the current file.
    pub header: Header,
    /// Blocks of the current file covered by its hash file.
    pub hashed_blocks: u32,
    /// Staged candidate hashes waiting for a merge.
    pub staged_candidates: usize,
    /// A signer is attached to this handle.
    pub signed: bool,
}

impl Stream {
    /// Creates a new stream in `folder` and its first data file.
    ///
    /// The hash size is taken from the named digest. Fails with
    /// [`Error::AlreadyExists`] when the stream has a manifest already.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use hsd::{Manifest, Options, Stream, StreamId};
    ///
    /// # fn main() -> Result<(), hsd::Error> {
    /// let manifest = Manifest::new(StreamId::new([9; 8]))
    ///     .hash_algorithm("sha512")
    ///     .max_block_records(1000);
    /// let stream = Stream::init("./streams", manifest, Options::default())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn init<P: AsRef<Path>>(folder: P, manifest: Manifest, options: Options) -> Result<Self> {
        let digest = hash::resolve(&manifest.hash_algorithm)?;
        Self::create(folder.as_ref(), manifest, options, digest, None)
    }

    /// Creates a new signed stream. The signer's identity and algorithm are
    /// stored in the manifest and every finalized file carries a signature.
    pub fn init_with_signer<P: AsRef<Path>>(
        folder: P,
        manifest: Manifest,
        options: Options,
        signer: Arc<dyn Signer>,
    ) -> Result<Self> {
        let digest = hash::resolve(&manifest.hash_algorithm)?;
        Self::create(folder.as_ref(), manifest, options, digest, Some(signer))
    }

    fn create(
        folder: &Path,
        mut manifest: Manifest,
        options: Options,
        digest: Arc<dyn Digest>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Result<Self> {
        options.validate()?;
        if digest.output_size() == 0 || digest.output_size() > 127 {
            return Err(Error::invalid_argument(format!(
                "digest {} has unsupported output size {}",
                digest.name(),
                digest.output_size()
            )));
        }
        manifest.hash_size = digest.output_size() as u8;
        if let Some(signer) = &signer {
            manifest.signer_algorithm = signer.algorithm().to_string();
            manifest.signer_id = signer.identity();
        }
        manifest.validate()?;

        ensure_folder(folder, &options)?;
        let paths = StreamPaths::new(folder, manifest.sid);
        if paths.manifest().exists() {
            return Err(Error::AlreadyExists(format!("stream {}", manifest.sid)));
        }
        fs::create_dir_all(paths.dir())?;

        let folder_index = FolderIndex::open(paths.folder_index(), options.max_streams_per_folder)?;
        let slot = folder_index.find_or_allocate(manifest.sid)?;
        manifest.save(&paths.manifest())?;

        let sync = options.sync_writes;
        let header = Header::new(manifest.sid, manifest.hash_size, 0, 0);
        drop(DataFile::create(&paths.data(1), 1, header, sync)?);
        SeekFile::new(paths.side(1, format::SideFile::Seek)).write_all(&[0], sync)?;
        let genesis = hash::chain::genesis(digest.as_ref(), &manifest.signer_id);
        HashFile::new(paths.side(1, format::SideFile::Hashes), manifest.hash_size as usize)
            .put_from(0, &[genesis], sync)?;
        Locator::new(paths.locator()).record(1, 0, sync)?;
        folder_index.write(slot, 1, HEADER_SIZE as u32, sync)?;

        log::info!(
            "Initialized stream {} in {:?} ({}, slot {})",
            manifest.sid,
            folder,
            manifest.hash_algorithm,
            slot
        );

        Ok(Stream {
            paths,
            manifest,
            options,
            digest,
            signer,
            folder: folder_index,
            writer: Mutex::new(WriterState { current_file: 1, slot: Some(slot), open_block: None }),
        })
    }

    /// Opens an existing stream without a signer.
    pub fn open<P: AsRef<Path>>(folder: P, sid: StreamId, options: Options) -> Result<Self> {
        let paths = StreamPaths::new(folder.as_ref(), sid);
        let manifest = Manifest::load(&paths.manifest())?;
        let digest = hash::resolve(&manifest.hash_algorithm)?;
        Self::load(paths, manifest, options, digest, None)
    }

    /// Opens an existing stream with the signer whose identity is in its
    /// manifest.
    pub fn open_with_signer<P: AsRef<Path>>(
        folder: P,
        sid: StreamId,
        options: Options,
        signer: Arc<dyn Signer>,
    ) -> Result<Self> {
        let paths = StreamPaths::new(folder.as_ref(), sid);
        let manifest = Manifest::load(&paths.manifest())?;
        let digest = hash::resolve(&manifest.hash_algorithm)?;
        Self::load(paths, manifest, options, digest, Some(signer))
    }

    /// Opens an existing stream with a caller supplied digest. Its name and
    /// output size must match the manifest.
    pub fn open_with_digest<P: AsRef<Path>>(
        folder: P,
        sid: StreamId,
        options: Options,
        digest: Arc<dyn Digest>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Result<Self> {
        let paths = StreamPaths::new(folder.as_ref(), sid);
        let manifest = Manifest::load(&paths.manifest())?;
        Self::load(paths, manifest, options, digest, signer)
    }

    fn load(
        paths: StreamPaths,
        manifest: Manifest,
        options: Options,
        digest: Arc<dyn Digest>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Result<Self> {
        options.validate()?;
        if manifest.sid != paths.sid() {
            return Err(Error::corruption(format!(
                "manifest in {:?} belongs to stream {}",
                paths.dir(),
                manifest.sid
            )));
        }
        if digest.name() != manifest.hash_algorithm || digest.output_size() != manifest.hash_size as usize {
            return Err(Error::invalid_argument(format!(
                "digest {} ({} bytes) does not match the manifest's {} ({} bytes)",
                digest.name(),
                digest.output_size(),
                manifest.hash_algorithm,
                manifest.hash_size
            )));
        }
        if let Some(signer) = &signer {
            if signer.identity() != manifest.signer_id {
                return Err(Error::invalid_argument(format!(
                    "signer identity {} does not match the manifest's {}",
                    hex::encode(signer.identity()),
                    hex::encode(manifest.signer_id)
                )));
            }
        }

        let folder = FolderIndex::open(paths.folder_index(), options.max_streams_per_folder)?;
        let mut stream = Stream {
            paths,
            manifest,
            options,
            digest,
            signer,
            folder,
            writer: Mutex::new(WriterState::default()),
        };
        let current = stream.locate_current_file()?;
        stream.writer.get_mut().current_file = current;

        log::debug!("Opened stream {} at file {}", stream.sid(), current);
        Ok(stream)
    }

    /// Finds the file to resume writing at: the folder cell's file, or the
    /// newest data file, stepping back once if the predecessor was
    /// interrupted while redirecting writers.
    fn locate_current_file(&self) -> Result<u32> {
        let from_cell = self.folder_cell()?.map(|cell| cell.file).filter(|&f| self.paths.data(f).exists());
        let mut current = match from_cell {
            Some(file) => file,
            None => match self.scan_files()? {
                Some((_, max)) => max,
                None => return Err(Error::not_found(format!("data files of stream {}", self.sid()))),
            },
        };
        if current > 1 {
            match self.read_header(current - 1) {
                Ok(prev) if prev.write_flag != 0 && WriteFlag::from_u8(prev.write_flag).is_some() => {
                    log::warn!("File {} was interrupted while finalizing; resuming there", current - 1);
                    current -= 1;
                }
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(current)
    }

    /// Stream id.
    pub fn sid(&self) -> StreamId {
        self.paths.sid()
    }

    /// Directory holding the stream's files.
    pub fn dir(&self) -> &Path {
        self.paths.dir()
    }

    /// File name helper for this stream.
    pub fn paths(&self) -> &StreamPaths {
        &self.paths
    }

    /// The stream's manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Options of this handle.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Digest used by the chain.
    pub fn digest(&self) -> &dyn Digest {
        self.digest.as_ref()
    }

    /// File that received the last write of this handle. Another process
    /// may have moved on since.
    pub fn current_file(&self) -> u32 {
        self.writer.lock().current_file
    }

    /// Reads the header of data file `file` without locking it.
    pub fn read_header(&self, file: u32) -> Result<Header> {
        let mut f = match File::open(self.paths.data(file)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(format!("data file {} of stream {}", file, self.sid())))
            }
            Err(e) => return Err(Error::Io(e)),
        };
        Header::read_from(&mut f)
    }

    /// Point-in-time view of the current file.
    pub fn status(&self) -> Result<StreamStatus> {
        let current_file = self.current_file();
        let header = self.read_header(current_file)?;
        let hashed_blocks = if header.finalized {
            header.block_count
        } else {
            (self.hash_file(current_file).read()?.len() as u32).saturating_sub(1)
        };
        let staged_candidates = self.candidate_file(current_file).read_unlocked()?.len();
        let first_file = self.scan_files()?.map_or(current_file, |(lo, _)| lo);

        Ok(StreamStatus {
            sid: self.sid(),
            hash_algorithm: self.manifest.hash_algorithm.clone(),
            current_file,
            first_file,
            header,
            hashed_blocks,
            staged_candidates,
            signed: self.signer.is_some(),
        })
    }

    pub(crate) fn seek_file(&self, file: u32) -> SeekFile {
        SeekFile::new(self.paths.side(file, format::SideFile::Seek))
    }

    pub(crate) fn hash_file(&self, file: u32) -> HashFile {
        HashFile::new(self.paths.side(file, format::SideFile::Hashes), self.manifest.hash_size as usize)
    }

    pub(crate) fn candidate_file(&self, file: u32) -> CandidateFile {
        CandidateFile::new(
            self.paths.side(file, format::SideFile::Candidates),
            self.manifest.hash_size as usize,
        )
    }

    pub(crate) fn locator(&self) -> Locator {
        Locator::new(self.paths.locator())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("sid", &self.sid())
            .field("dir", &self.paths.dir())
            .field("hash_algorithm", &self.manifest.hash_algorithm)
            .field("signed", &self.signer.is_some())
            .finish()
    }
}

fn ensure_folder(folder: &Path, options: &Options) -> Result<()> {
    if folder.exists() {
        return Ok(());
    }
    if !options.create_if_missing {
        return Err(Error::not_found(format!("folder {:?}", folder)));
    }
    fs::create_dir_all(folder)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sid() -> StreamId {
        StreamId::new([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn test_init_creates_first_file() {
        let dir = TempDir::new().unwrap();
        let stream = Stream::init(dir.path(), Manifest::new(sid()), Options::default()).unwrap();

        let header = stream.read_header(1).unwrap();
        assert_eq!(header.write_offset, HEADER_SIZE as u32);
        assert_eq!(header.block_count, 0);
        assert_eq!(header.hash_size, 32);
        assert_eq!(stream.seek_file(1).read().unwrap(), vec![0]);
        assert_eq!(stream.hash_file(1).read().unwrap().len(), 1);
        assert_eq!(stream.current_file(), 1);

        let cell = stream.folder_cell().unwrap().unwrap();
        assert_eq!((cell.file, cell.offset), (1, 36));
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        Stream::init(dir.path(), Manifest::new(sid()), Options::default()).unwrap();
        let again = Stream::init(dir.path(), Manifest::new(sid()), Options::default());
        assert!(matches!(again, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_init_without_create_if_missing() {
        let dir = TempDir::new().unwrap();
        let options = Options::default().create_if_missing(false);
        let result = Stream::init(dir.path().join("absent"), Manifest::new(sid()), options);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_open_missing_stream() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(Stream::open(dir.path(), sid(), Options::default()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_open_rejects_foreign_digest() {
        let dir = TempDir::new().unwrap();
        Stream::init(dir.path(), Manifest::new(sid()), Options::default()).unwrap();

        let digest: Arc<dyn Digest> = Arc::new(HashAlgorithm::Sha512);
        let result = Stream::open_with_digest(dir.path(), sid(), Options::default(), digest, None);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_status_reports_current_file() {
        let dir = TempDir::new().unwrap();
        let stream = Stream::init(dir.path(), Manifest::new(sid()), Options::default()).unwrap();
        stream.append(b"abc").unwrap();

        let status = stream.status().unwrap();
        assert_eq!(status.current_file, 1);
        assert_eq!(status.first_file, 1);
        assert_eq!(status.header.write_offset, 40);
        assert_eq!(status.hashed_blocks, 0);
        assert!(!status.signed);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["sid"], "0102030405060708");
    }
}
