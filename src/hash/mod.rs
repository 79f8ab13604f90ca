//! Hash chain engine.
//!
//! Every finalized block gets `hash(b_i) = H(hash(b_i-1) || bytes(b_i))`. The
//! chain is seeded with `H(signer identity)` for a stream's first file and
//! with the previous file's last hash for every later file.
//!
//! Hashes of an in-progress file live in its hash file. Workers may compute
//! ranges without the writer lock and stage them in the candidate file; a
//! merge moves the sequential prefix into the hash file. Finalized files keep
//! only the edge hashes and a few reduced intermediate hashes in their trailer.

pub mod chain;
pub mod worker;

pub use worker::HashWorker;

use crate::error::{Error, Result};
use crate::format::trailer::{Trailer, TrailerLayout};
use crate::pipeline::datafile::DataFile;
use crate::Stream;
use serde::Serialize;
use sha2::digest::DynDigest;
use std::fmt::Debug;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::sync::Arc;

/// A named digest producing fixed-size output.
pub trait Digest: Send + Sync + Debug {
    /// Name stored in the manifest.
    fn name(&self) -> &str;

    /// Output size in bytes.
    fn output_size(&self) -> usize;

    /// A fresh streaming hasher.
    fn hasher(&self) -> Box<dyn DynDigest>;
}

/// Built-in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-224
    Sha224,
    /// SHA-256, the default.
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// SHA-512/256
    Sha512_256,
}

impl HashAlgorithm {
    /// Every built-in digest.
    pub const ALL: [HashAlgorithm; 5] = [
        HashAlgorithm::Sha224,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
        HashAlgorithm::Sha512_256,
    ];

    /// Looks a digest up by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

impl Digest for HashAlgorithm {
    fn name(&self) -> &str {
        match self {
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha512_256 => "sha512_256",
        }
    }

    fn output_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 | HashAlgorithm::Sha512_256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            HashAlgorithm::Sha224 => Box::new(sha2::Sha224::default()),
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
            HashAlgorithm::Sha512_256 => Box::new(sha2::Sha512_256::default()),
        }
    }
}

/// Resolves a built-in digest by name.
pub fn resolve(name: &str) -> Result<Arc<dyn Digest>> {
    HashAlgorithm::from_name(name)
        .map(|a| Arc::new(a) as Arc<dyn Digest>)
        .ok_or_else(|| Error::invalid_argument(format!("unknown hash algorithm '{}'", name)))
}

/// Which edge hash of a file to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The chain entry hash (seed of the file's first block).
    First,
    /// The hash of the file's last block.
    Last,
}

/// Result of [`Stream::verify_hashes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Data file number.
    pub file: u32,
    /// The file was finalized.
    pub finalized: bool,
    /// Blocks in the file.
    pub blocks: u32,
    /// Blocks whose stored hash was compared.
    pub verified: u32,
    /// Reduced hashes compared (finalized files only).
    pub reduced_checked: u32,
}

/// Result of [`Stream::update_hash_file`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashUpdate {
    /// Data file number.
    pub file: u32,
    /// Blocks in the file.
    pub blocks: u32,
    /// Blocks covered by the hash file afterwards.
    pub hashed: u32,
    /// Hashes taken over from the candidate file.
    pub merged: u32,
    /// The header's pending flag was cleared.
    pub pending_cleared: bool,
}

impl Stream {
    /// Entry hash of `file`: the genesis hash for file 1, otherwise the last
    /// hash of the previous file.
    pub(crate) fn entry_hash(&self, file: u32) -> Result<Vec<u8>> {
        if file <= 1 {
            return Ok(chain::genesis(self.digest.as_ref(), &self.manifest.signer_id));
        }
        self.read_edge_hash(file - 1, Edge::Last)
    }

    /// Reads the first or last chain hash of a file.
    ///
    /// Finalized files answer from their trailer. For an in-progress file the
    /// last hash is computed on the fly from the newest stored hash, without
    /// taking any lock.
    pub fn read_edge_hash(&self, file: u32, edge: Edge) -> Result<Vec<u8>> {
        let header = self.read_header(file)?;
        if header.finalized {
            let layout = TrailerLayout::of(&header);
            let mut f = File::open(self.paths.data(file))?;
            f.seek(SeekFrom::Start(layout.edge_hash(edge == Edge::Last)))?;
            let mut hash = vec![0u8; layout.hash_size];
            f.read_exact(&mut hash)?;
            return Ok(hash);
        }

        match edge {
            Edge::First => self.entry_hash(file),
            Edge::Last => {
                let hashes = self.chain_hashes(file)?;
                hashes.last().cloned().ok_or_else(|| Error::internal("empty hash chain"))
            }
        }
    }

    /// Entry hash plus the hash of every finalized block of an in-progress
    /// file, computing whatever the hash file does not hold yet.
    pub(crate) fn chain_hashes(&self, file: u32) -> Result<Vec<Vec<u8>>> {
        let header = self.read_header(file)?;
        let seek = self.seek_table_for(file, &header)?;
        let blocks = (seek.len() - 1) as u32;

        let mut hashes = self.hash_file(file).read()?;
        let entry = self.entry_hash(file)?;
        if hashes.first() != Some(&entry) || hashes.len() > blocks as usize + 1 {
            hashes = vec![entry];
        }
        let frontier = (hashes.len() - 1) as u32;
        if frontier < blocks {
            let mut reader = BufReader::new(File::open(self.paths.data(file))?);
            let seed = hashes[frontier as usize].clone();
            let computed =
                chain::hash_blocks(self.digest.as_ref(), &mut reader, &seek, frontier, blocks, seed)?;
            hashes.extend(computed);
        }
        Ok(hashes)
    }

    /// Recomputes every stored hash of a file from its raw bytes.
    ///
    /// The first mismatch is returned as [`Error::HashMismatch`] carrying both
    /// hashes. In-progress files are checked against their hash file, finalized
    /// files against the trailer's last hash and reduced hashes.
    pub fn verify_hashes(&self, file: u32) -> Result<VerifyReport> {
        let header = self.read_header(file)?;
        if header.finalized {
            return self.verify_finalized(file);
        }

        let seek = self.seek_table_for(file, &header)?;
        let blocks = (seek.len() - 1) as u32;
        let stored = self.hash_file(file).read()?;
        let entry = self.entry_hash(file)?;
        match stored.first() {
            None => return Err(Error::not_found(format!("hash file of file {}", file))),
            Some(first) if *first != entry => {
                return Err(Error::corruption(format!(
                    "entry hash of file {} is {}, expected {}",
                    file,
                    hex::encode(first),
                    hex::encode(&entry)
                )))
            }
            Some(_) => {}
        }

        let covered = ((stored.len() - 1) as u32).min(blocks);
        let mut reader = BufReader::new(File::open(self.paths.data(file))?);
        let computed = chain::hash_blocks(self.digest.as_ref(), &mut reader, &seek, 0, covered, entry)?;
        for (i, (actual, expected)) in computed.iter().zip(&stored[1..]).enumerate() {
            if actual != expected {
                return Err(Error::HashMismatch {
                    block: header.start_block as u64 + i as u64,
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }

        log::debug!("Verified {} of {} blocks in file {}", covered, blocks, file);
        Ok(VerifyReport { file, finalized: false, blocks, verified: covered, reduced_checked: 0 })
    }

    fn verify_finalized(&self, file: u32) -> Result<VerifyReport> {
        let header = self.read_header(file)?;
        if header.write_flag != 0 {
            return Err(Error::invalid_state(format!("file {} is still being finalized", file)));
        }
        let mut f = File::open(self.paths.data(file))?;
        let trailer = Trailer::read(&mut f, &header)?;

        let entry = self.entry_hash(file)?;
        if trailer.first_hash != entry {
            return Err(Error::corruption(format!(
                "entry hash of file {} is {}, expected {}",
                file,
                hex::encode(&trailer.first_hash),
                hex::encode(&entry)
            )));
        }

        let blocks = header.block_count;
        let mut reader = BufReader::new(f);
        let computed = chain::hash_blocks(
            self.digest.as_ref(),
            &mut reader,
            &trailer.seek_table,
            0,
            blocks,
            trailer.first_hash.clone(),
        )?;

        let mismatch = |local: u32, expected: &[u8], actual: &[u8]| Error::HashMismatch {
            block: header.start_block as u64 + local as u64,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        };
        for (local, expected) in &trailer.reduced {
            let actual = computed.get(*local as usize).ok_or_else(|| {
                Error::corruption(format!("reduced hash for missing block {}", local))
            })?;
            if actual != expected {
                return Err(mismatch(*local, expected, actual));
            }
        }
        let last = computed.last().ok_or_else(|| Error::corruption("finalized file without blocks"))?;
        if *last != trailer.last_hash {
            return Err(mismatch(blocks - 1, &trailer.last_hash, last));
        }

        Ok(VerifyReport {
            file,
            finalized: true,
            blocks,
            verified: blocks,
            reduced_checked: trailer.reduced.len() as u32,
        })
    }

    /// Rewrites the hash file of an in-progress file when it is missing,
    /// size-inconsistent, starts with the wrong entry hash, or does not cover
    /// every block.
    pub fn repair_hash_file(&self, file: u32) -> Result<crate::index::RepairOutcome> {
        let header = self.read_header(file)?;
        if header.finalized {
            return Err(Error::invalid_state(format!(
                "file {} is finalized; its hashes live in the trailer",
                file
            )));
        }
        let seek = self.seek_table_for(file, &header)?;
        let blocks = (seek.len() - 1) as u32;

        let mut guard = self.candidate_file(file).lock()?;
        let hash_file = self.hash_file(file);
        let stored = hash_file.read()?;
        let entry = self.entry_hash(file)?;

        let intact = hash_file.is_well_formed()?
            && stored.len() == blocks as usize + 1
            && stored[0] == entry;
        if intact {
            return Ok(crate::index::RepairOutcome::Intact);
        }

        let mut reader = BufReader::new(File::open(self.paths.data(file))?);
        let mut hashes = vec![entry.clone()];
        hashes.extend(chain::hash_blocks(self.digest.as_ref(), &mut reader, &seek, 0, blocks, entry)?);
        hash_file.put_from(0, &hashes, self.options.sync_writes)?;
        guard.clear()?;

        log::info!("Rebuilt hash file of file {} ({} blocks)", file, blocks);
        Ok(crate::index::RepairOutcome::Rebuilt)
    }

    /// Brings the hash file of an in-progress file up to date: merges staged
    /// candidates, then hashes the remaining blocks sequentially.
    ///
    /// Clears the header's pending flag when every block is covered and the
    /// data file is not locked by a writer.
    pub fn update_hash_file(&self, file: u32) -> Result<HashUpdate> {
        let header = self.read_header(file)?;
        if header.finalized {
            return Ok(HashUpdate {
                file,
                blocks: header.block_count,
                hashed: header.block_count,
                merged: 0,
                pending_cleared: false,
            });
        }

        let (hashes, merged) = self.catch_up_hashes(file, &header)?;
        let hashed = (hashes.len() - 1) as u32;

        let mut pending_cleared = false;
        if header.hash_pending && hashed >= header.block_count {
            match DataFile::open(&self.paths.data(file), file, self.options.sync_writes) {
                Ok(mut df) => {
                    let h = &df.header;
                    if h.hash_pending && !h.finalized && h.write_flag == 0 && h.block_count <= hashed {
                        df.header.hash_pending = false;
                        df.write_header()?;
                        pending_cleared = true;
                    }
                }
                Err(Error::Busy(_)) => {
                    log::debug!("File {} is locked; leaving its hash pending flag", file);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(HashUpdate { file, blocks: header.block_count, hashed, merged, pending_cleared })
    }

    /// Merges candidates and hashes every remaining block of `file` under the
    /// candidate lock. Returns the full hash list and the number merged.
    pub(crate) fn catch_up_hashes(
        &self,
        file: u32,
        header: &crate::format::header::Header,
    ) -> Result<(Vec<Vec<u8>>, u32)> {
        let seek = self.seek_table_for(file, header)?;
        let blocks = (seek.len() - 1) as u32;
        let sync = self.options.sync_writes;

        let mut guard = self.candidate_file(file).lock()?;
        let hash_file = self.hash_file(file);
        let mut hashes = hash_file.read()?;
        if !hash_file.is_well_formed()? || hashes.is_empty() || hashes.len() > blocks as usize + 1 {
            log::warn!("Hash file of file {} is unusable; restarting it from the entry hash", file);
            hashes = vec![self.entry_hash(file)?];
            hash_file.put_from(0, &hashes, sync)?;
        }

        let merged = worker::merge_locked(&mut guard, &hash_file, &mut hashes, blocks, sync)?;

        let frontier = (hashes.len() - 1) as u32;
        if frontier < blocks {
            let mut reader = BufReader::new(File::open(self.paths.data(file))?);
            let seed = hashes[frontier as usize].clone();
            let computed =
                chain::hash_blocks(self.digest.as_ref(), &mut reader, &seek, frontier, blocks, seed)?;
            hash_file.put_from(frontier + 1, &computed, sync)?;
            hashes.extend(computed);
            guard.clear()?;
        }

        Ok((hashes, merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_names() {
        for algo in HashAlgorithm::ALL {
            let digest = resolve(algo.name()).unwrap();
            assert_eq!(digest.name(), algo.name());
            let mut hasher = digest.hasher();
            hasher.update(b"abc");
            assert_eq!(hasher.finalize().len(), digest.output_size());
        }
        assert!(resolve("md5").is_err());
    }

    #[test]
    fn test_sha256_known_vector() {
        let digest = HashAlgorithm::Sha256;
        let mut hasher = digest.hasher();
        hasher.update(b"abc");
        assert_eq!(
            hex::encode(hasher.finalize()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_from_name() {
        assert_eq!(HashAlgorithm::from_name("sha512_256"), Some(HashAlgorithm::Sha512_256));
        assert_eq!(HashAlgorithm::from_name("SHA256"), None);
    }
}
