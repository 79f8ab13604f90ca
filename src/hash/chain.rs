//! Chain hash computation over raw block bytes.

use super::Digest;
use crate::error::{Error, Result};
use crate::format::HEADER_SIZE;
use std::io::{Read, Seek, SeekFrom};

const READ_CHUNK: usize = 64 * 1024;

/// Hash of the signer identity; the entry hash of a stream's first file.
pub fn genesis(digest: &dyn Digest, identity: &[u8]) -> Vec<u8> {
    let mut hasher = digest.hasher();
    hasher.update(identity);
    hasher.finalize().to_vec()
}

/// `H(prev || data)`.
pub fn chain_hash(digest: &dyn Digest, prev: &[u8], data: &[u8]) -> Vec<u8> {
    let mut hasher = digest.hasher();
    hasher.update(prev);
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Hashes local blocks `[first, end)` of a data file.
///
/// `seek_table` holds block boundaries relative to the first record byte and
/// `seed` is the hash preceding block `first`. Returns one hash per block.
pub fn hash_blocks<R: Read + Seek>(
    digest: &dyn Digest,
    reader: &mut R,
    seek_table: &[u32],
    first: u32,
    end: u32,
    seed: Vec<u8>,
) -> Result<Vec<Vec<u8>>> {
    if end as usize >= seek_table.len() || first > end {
        return Err(Error::invalid_argument(format!(
            "block range {}..{} outside a seek table of {} blocks",
            first,
            end,
            seek_table.len().saturating_sub(1)
        )));
    }

    let mut out = Vec::with_capacity((end - first) as usize);
    let mut prev = seed;
    let mut chunk = vec![0u8; READ_CHUNK];

    for i in first as usize..end as usize {
        let start = seek_table[i] as u64;
        let stop = seek_table[i + 1] as u64;
        if stop < start {
            return Err(Error::corruption(format!("seek table goes backwards at block {}", i)));
        }

        let mut hasher = digest.hasher();
        hasher.update(&prev);
        reader.seek(SeekFrom::Start(HEADER_SIZE + start))?;
        let mut remaining = (stop - start) as usize;
        while remaining > 0 {
            let n = remaining.min(READ_CHUNK);
            reader.read_exact(&mut chunk[..n]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::corruption(format!("data ends inside block {}", i))
                } else {
                    Error::Io(e)
                }
            })?;
            hasher.update(&chunk[..n]);
            remaining -= n;
        }
        prev = hasher.finalize().to_vec();
        out.push(prev.clone());
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use std::io::Cursor;

    #[test]
    fn test_genesis_is_digest_of_identity() {
        let digest = HashAlgorithm::Sha256;
        let g = genesis(&digest, &[0u8; 20]);
        assert_eq!(g.len(), 32);
        assert_eq!(g, chain_hash(&digest, &[], &[0u8; 20]));
        assert_ne!(g, genesis(&digest, &[1u8; 20]));
    }

    #[test]
    fn test_hash_blocks_follows_chain_rule() {
        let digest = HashAlgorithm::Sha256;
        let mut data = vec![0u8; HEADER_SIZE as usize];
        data.extend_from_slice(b"aaaabbbbbbcc");
        let seek = [0u32, 4, 10, 12];
        let seed = genesis(&digest, &[0u8; 20]);

        let hashes =
            hash_blocks(&digest, &mut Cursor::new(&data), &seek, 0, 3, seed.clone()).unwrap();
        assert_eq!(hashes.len(), 3);

        let h0 = chain_hash(&digest, &seed, b"aaaa");
        let h1 = chain_hash(&digest, &h0, b"bbbbbb");
        let h2 = chain_hash(&digest, &h1, b"cc");
        assert_eq!(hashes, vec![h0.clone(), h1.clone(), h2.clone()]);

        // a sub-range seeded from its predecessor gives the same hashes
        let tail = hash_blocks(&digest, &mut Cursor::new(&data), &seek, 1, 3, h0).unwrap();
        assert_eq!(tail, vec![h1, h2]);
    }

    #[test]
    fn test_hash_blocks_range_checks() {
        let digest = HashAlgorithm::Sha256;
        let data = vec![0u8; 40];
        let seek = [0u32, 4];
        assert!(hash_blocks(&digest, &mut Cursor::new(&data), &seek, 0, 2, vec![]).is_err());
        assert!(hash_blocks(&digest, &mut Cursor::new(&data), &seek, 0, 1, vec![]).is_ok());
        assert!(hash_blocks(&digest, &mut Cursor::new(&data), &[0, 10], 0, 1, vec![]).is_err());
    }
}
