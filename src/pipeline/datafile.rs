//! A locked data file with its cached header.

use super::lock::LockedFile;
use crate::error::{Error, Result};
use crate::format::header::Header;
use crate::format::HEADER_SIZE;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A data file opened for writing. The exclusive lock is held for the
/// lifetime of the value.
#[derive(Debug)]
pub(crate) struct DataFile {
    pub number: u32,
    pub header: Header,
    file: LockedFile,
    sync: bool,
}

impl DataFile {
    /// Locks an existing data file and reads its header.
    pub fn open(path: &Path, number: u32, sync: bool) -> Result<Self> {
        let mut file = LockedFile::open(path, false)?;
        file.seek(SeekFrom::Start(0))?;
        let header = Header::read_from(&mut *file)?;
        Ok(DataFile { number, header, file, sync })
    }

    /// Creates (or overwrites) a data file holding only `header`.
    pub fn create(path: &Path, number: u32, header: Header, sync: bool) -> Result<Self> {
        let file = LockedFile::open(path, true)?;
        let mut df = DataFile { number, header, file, sync };
        df.file.set_len(0)?;
        df.write_header()?;
        Ok(df)
    }

    /// Persists the cached header.
    pub fn write_header(&mut self) -> Result<()> {
        let bytes = self.header.encode();
        self.write_at(0, &bytes)?;
        self.sync()
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::corruption(format!(
                    "Data file {} ends before offset {}",
                    self.number,
                    offset + len as u64
                ))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if len < HEADER_SIZE {
            return Err(Error::internal(format!("Refusing to truncate into the header ({})", len)));
        }
        self.file.set_len(len)?;
        self.sync()
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Underlying file, positioned arbitrarily.
    pub fn file_mut(&mut self) -> &mut std::fs::File {
        &mut self.file
    }
}
