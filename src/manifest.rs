//! Per-stream manifest (`man.bin`).
//!
//! The manifest fixes everything that shapes a stream's bytes: the digest,
//! the file and block limits, the optional block-end fields and the signer.
//! It is written once when the stream is initialized and loaded into an
//! immutable value that every operation borrows.
//!
//! Stored as an III mapping:
//!
//! ```text
//! sid  "0102030405060708"
//! hsz  32
//! fil  { maxl: 10485760, maxb: 1000, rhsp: 65535 }
//! blk  { maxt: 65535, maxs: 8388608, numb: false, time: false, hash: "sha256" }
//! sig  { alg: "", id: "0000000000000000000000000000000000000000" }
//! ```

use crate::codec::{iii, Map, Value};
use crate::error::{Error, Result};
use crate::format::{StreamId, HEADER_SIZE, MAX_FILE_BLOCKS};
use crate::signer::{IDENTITY_LEN, NO_IDENTITY};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Persistent stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    /// Stream id.
    pub sid: StreamId,
    /// Digest name, e.g. "sha256".
    pub hash_algorithm: String,
    /// Digest output size in bytes, derived from the algorithm.
    pub hash_size: u8,
    /// File size at which appends start reporting `file_full`.
    pub max_file_size: u32,
    /// Block count at which appends start reporting `file_full`.
    pub max_file_blocks: u32,
    /// Byte budget between two reduced intermediate hashes in a file trailer.
    pub reduced_hash_spacing: u32,
    /// Records per block at which appends start reporting `block_full`.
    pub max_block_records: u32,
    /// Block size at which appends start reporting `block_full`.
    pub max_block_size: u32,
    /// Block end frames carry the global block number.
    pub block_number_field: bool,
    /// Block end frames carry a unix timestamp.
    pub timestamp_field: bool,
    /// Signer algorithm tag; empty when unsigned.
    pub signer_algorithm: String,
    /// Signer identity; all zero when unsigned.
    #[serde(serialize_with = "serialize_hex")]
    pub signer_id: [u8; IDENTITY_LEN],
}

fn serialize_hex<S: serde::Serializer>(
    id: &[u8; IDENTITY_LEN],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(id))
}

impl Manifest {
    /// Manifest with default limits and the sha256 digest.
    pub fn new(sid: StreamId) -> Self {
        Manifest {
            sid,
            hash_algorithm: "sha256".to_string(),
            hash_size: 32,
            max_file_size: 10 * 1024 * 1024, // 10MB
            max_file_blocks: 1000,
            reduced_hash_spacing: 65_535,
            max_block_records: 65_535,
            max_block_size: 8 * 1024 * 1024, // 8MB
            block_number_field: false,
            timestamp_field: false,
            signer_algorithm: String::new(),
            signer_id: NO_IDENTITY,
        }
    }

    /// Sets the digest name. The hash size is derived when the stream is
    /// initialized.
    pub fn hash_algorithm(mut self, name: impl Into<String>) -> Self {
        self.hash_algorithm = name.into();
        self
    }

    /// Sets the soft file size limit.
    pub fn max_file_size(mut self, bytes: u32) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Sets the soft block count limit per file.
    pub fn max_file_blocks(mut self, blocks: u32) -> Self {
        self.max_file_blocks = blocks;
        self
    }

    /// Sets the byte budget between two reduced hashes.
    pub fn reduced_hash_spacing(mut self, bytes: u32) -> Self {
        self.reduced_hash_spacing = bytes;
        self
    }

    /// Sets the soft record count limit per block.
    pub fn max_block_records(mut self, records: u32) -> Self {
        self.max_block_records = records;
        self
    }

    /// Sets the soft block size limit.
    pub fn max_block_size(mut self, bytes: u32) -> Self {
        self.max_block_size = bytes;
        self
    }

    /// Enables the global block number in block end frames.
    pub fn block_number_field(mut self, value: bool) -> Self {
        self.block_number_field = value;
        self
    }

    /// Enables the timestamp in block end frames.
    pub fn timestamp_field(mut self, value: bool) -> Self {
        self.timestamp_field = value;
        self
    }

    /// True when a signer identity is configured.
    pub fn is_signed(&self) -> bool {
        self.signer_id != NO_IDENTITY
    }

    /// Payload length of a block end frame.
    pub fn block_fields_len(&self) -> usize {
        4 * self.timestamp_field as usize + 4 * self.block_number_field as usize
    }

    /// Validates the manifest and returns an error if any field is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sid.is_zero() {
            return Err(Error::invalid_argument("stream id must not be all zero"));
        }
        if self.hash_algorithm.is_empty() {
            return Err(Error::invalid_argument("hash algorithm must be set"));
        }
        if self.hash_size == 0 || self.hash_size > 127 {
            return Err(Error::invalid_argument(format!(
                "hash size {} outside 1..=127",
                self.hash_size
            )));
        }
        if (self.max_file_size as u64) <= HEADER_SIZE {
            return Err(Error::invalid_argument("max_file_size must exceed the header size"));
        }
        if self.max_file_blocks == 0 || self.max_file_blocks > MAX_FILE_BLOCKS {
            return Err(Error::invalid_argument(format!(
                "max_file_blocks must be in 1..={}",
                MAX_FILE_BLOCKS
            )));
        }
        if self.reduced_hash_spacing == 0 {
            return Err(Error::invalid_argument("reduced_hash_spacing must be > 0"));
        }
        if self.max_block_records == 0 {
            return Err(Error::invalid_argument("max_block_records must be > 0"));
        }
        if self.max_block_size == 0 {
            return Err(Error::invalid_argument("max_block_size must be > 0"));
        }
        Ok(())
    }

    /// Encodes the manifest as an III mapping.
    pub fn to_map(&self) -> Map {
        let mut fil = Map::new();
        fil.insert("maxl".into(), Value::from(self.max_file_size));
        fil.insert("maxb".into(), Value::from(self.max_file_blocks));
        fil.insert("rhsp".into(), Value::from(self.reduced_hash_spacing));

        let mut blk = Map::new();
        blk.insert("maxt".into(), Value::from(self.max_block_records));
        blk.insert("maxs".into(), Value::from(self.max_block_size));
        blk.insert("numb".into(), Value::from(self.block_number_field));
        blk.insert("time".into(), Value::from(self.timestamp_field));
        blk.insert("hash".into(), Value::from(self.hash_algorithm.as_str()));

        let mut sig = Map::new();
        sig.insert("alg".into(), Value::from(self.signer_algorithm.as_str()));
        sig.insert("id".into(), Value::from(hex::encode(self.signer_id)));

        let mut map = Map::new();
        map.insert("sid".into(), Value::from(self.sid.to_string()));
        map.insert("hsz".into(), Value::from(self.hash_size as u32));
        map.insert("fil".into(), Value::Map(fil));
        map.insert("blk".into(), Value::Map(blk));
        map.insert("sig".into(), Value::Map(sig));
        map
    }

    /// Decodes a manifest from an III mapping.
    pub fn from_map(map: &Map) -> Result<Self> {
        let fil = section(map, "fil")?;
        let blk = section(map, "blk")?;
        let sig = section(map, "sig")?;

        let sid: StreamId = text(map, "sid")?.parse()?;
        let hash_size = u8::try_from(int(map, "hsz")?)
            .map_err(|_| Error::Serialization("manifest: 'hsz' out of range".into()))?;

        let mut signer_id = NO_IDENTITY;
        hex::decode_to_slice(text(sig, "id")?, &mut signer_id)
            .map_err(|e| Error::Serialization(format!("manifest: signer id: {}", e)))?;

        let manifest = Manifest {
            sid,
            hash_algorithm: text(blk, "hash")?.to_string(),
            hash_size,
            max_file_size: uint(fil, "maxl")?,
            max_file_blocks: uint(fil, "maxb")?,
            reduced_hash_spacing: uint(fil, "rhsp")?,
            max_block_records: uint(blk, "maxt")?,
            max_block_size: uint(blk, "maxs")?,
            block_number_field: flag(blk, "numb")?,
            timestamp_field: flag(blk, "time")?,
            signer_algorithm: text(sig, "alg")?.to_string(),
            signer_id,
        };
        manifest.validate().map_err(|e| Error::Serialization(format!("manifest: {}", e)))?;
        Ok(manifest)
    }

    /// Writes the manifest to `path` atomically (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = iii::encode(&self.to_map())?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        log::debug!("Wrote manifest {:?}", path);
        Ok(())
    }

    /// Loads a manifest from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("manifest {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        Self::from_map(&iii::decode(&bytes)?)
    }
}

fn get<'a>(map: &'a Map, key: &str) -> Result<&'a Value> {
    map.get(key).ok_or_else(|| Error::Serialization(format!("manifest: missing '{}'", key)))
}

fn section<'a>(map: &'a Map, key: &str) -> Result<&'a Map> {
    get(map, key)?
        .as_map()
        .ok_or_else(|| Error::Serialization(format!("manifest: '{}' is not a mapping", key)))
}

fn text<'a>(map: &'a Map, key: &str) -> Result<&'a str> {
    get(map, key)?
        .as_str()
        .ok_or_else(|| Error::Serialization(format!("manifest: '{}' is not a string", key)))
}

fn int(map: &Map, key: &str) -> Result<i64> {
    get(map, key)?
        .as_int()
        .ok_or_else(|| Error::Serialization(format!("manifest: '{}' is not an integer", key)))
}

fn uint(map: &Map, key: &str) -> Result<u32> {
    u32::try_from(int(map, key)?)
        .map_err(|_| Error::Serialization(format!("manifest: '{}' out of range", key)))
}

fn flag(map: &Map, key: &str) -> Result<bool> {
    get(map, key)?
        .as_bool()
        .ok_or_else(|| Error::Serialization(format!("manifest: '{}' is not a boolean", key)))
}
