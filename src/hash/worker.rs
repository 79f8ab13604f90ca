//! Out-of-band hash workers and the candidate merge.
//!
//! A worker hashes a block range of an in-progress file without the writer
//! lock and posts `(block, hash)` pairs to the candidate file. Only the merge
//! writes the canonical hash file, and only the part that continues the
//! chain without a gap.

use super::chain;
use crate::error::{Error, Result};
use crate::index::hashes::CandidateGuard;
use crate::index::HashFile;
use crate::Stream;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long a parallel worker keeps retrying a busy lock or a missing seed.
const WORKER_PATIENCE: Duration = Duration::from_secs(60);

/// Computes chain hashes for one data file outside the write path.
#[derive(Debug, Clone, Copy)]
pub struct HashWorker<'a> {
    stream: &'a Stream,
    file: u32,
}

impl<'a> HashWorker<'a> {
    /// Worker for `file` of `stream`.
    pub fn new(stream: &'a Stream, file: u32) -> Self {
        HashWorker { stream, file }
    }

    /// Hashes local blocks `[first, end)` and posts them as candidates.
    ///
    /// The seed (hash before `first`) comes from the hash file or from an
    /// already posted candidate. When neither has it yet the worker returns
    /// [`Error::Busy`] so the caller can retry after the preceding range is
    /// done. Returns the number of hashes posted.
    pub fn compute_range(&self, first: u32, end: u32) -> Result<u32> {
        let stream = self.stream;
        let header = stream.read_header(self.file)?;
        if header.finalized {
            return Err(Error::invalid_state(format!("file {} is finalized", self.file)));
        }
        let seek = stream.seek_table_for(self.file, &header)?;
        let blocks = (seek.len() - 1) as u32;
        if first >= end || end > blocks {
            return Err(Error::invalid_argument(format!(
                "block range {}..{} outside file {} with {} blocks",
                first, end, self.file, blocks
            )));
        }

        let seed = self.seed(first)?;
        let mut reader = BufReader::new(File::open(stream.paths.data(self.file))?);
        let hashes =
            chain::hash_blocks(stream.digest.as_ref(), &mut reader, &seek, first, end, seed)?;

        let entries: Vec<(u32, Vec<u8>)> = (first..end).zip(hashes).collect();
        let mut guard = stream.candidate_file(self.file).lock()?;
        guard.append(&entries, stream.options.sync_writes)?;

        log::debug!("Posted hashes for blocks {}..{} of file {}", first, end, self.file);
        Ok(end - first)
    }

    fn seed(&self, first: u32) -> Result<Vec<u8>> {
        if let Some(seed) = self.stream.hash_file(self.file).entry(first)? {
            return Ok(seed);
        }
        if first > 0 {
            let candidates = self.stream.candidate_file(self.file).read_unlocked()?;
            if let Some((_, hash)) = candidates.into_iter().rev().find(|(b, _)| *b == first - 1) {
                return Ok(hash);
            }
        }
        Err(Error::busy(format!("seed for block {} of file {} is unavailable", first, self.file)))
    }
}

/// Moves the gap-free run of candidates after the current frontier into the
/// hash file. The caller holds the candidate lock.
///
/// The candidate file is truncated once nothing in it is still ahead of the
/// frontier. Returns the number of hashes merged.
pub(crate) fn merge_locked(
    guard: &mut CandidateGuard,
    hash_file: &HashFile,
    hashes: &mut Vec<Vec<u8>>,
    blocks: u32,
    sync: bool,
) -> Result<u32> {
    let start = (hashes.len() - 1) as u32;
    let hash_size = hashes[0].len();

    let mut ahead: BTreeMap<u32, Vec<u8>> = guard
        .read()?
        .into_iter()
        .filter(|(block, hash)| *block >= start && *block < blocks && hash.len() == hash_size)
        .collect();

    let mut merged = Vec::new();
    let mut frontier = start;
    while let Some(hash) = ahead.remove(&frontier) {
        merged.push(hash);
        frontier += 1;
    }

    if !merged.is_empty() {
        hash_file.put_from(start + 1, &merged, sync)?;
        hashes.extend(merged);
    }
    if ahead.is_empty() {
        guard.clear()?;
    }
    Ok(frontier - start)
}

impl Stream {
    /// Merges staged hash candidates of `file` into its hash file.
    ///
    /// Returns [`Error::Busy`] while a worker holds the candidate lock.
    pub fn merge_hash_candidates(&self, file: u32) -> Result<u32> {
        let header = self.read_header(file)?;
        if header.finalized {
            return Ok(0);
        }
        let seek = self.seek_table_for(file, &header)?;
        let blocks = (seek.len() - 1) as u32;

        let mut guard = self.candidate_file(file).lock()?;
        let hash_file = self.hash_file(file);
        let mut hashes = hash_file.read()?;
        if hashes.is_empty() {
            return Err(Error::not_found(format!("hash file of file {}", file)));
        }
        let merged = merge_locked(&mut guard, &hash_file, &mut hashes, blocks, self.options.sync_writes)?;
        if merged > 0 {
            log::debug!("Merged {} candidate hashes into file {}", merged, file);
        }
        Ok(merged)
    }

    /// Hashes the unhashed blocks of `file` with `workers` scoped threads
    /// over disjoint ranges, then merges their candidates.
    ///
    /// Each worker retries while its seed is missing or the candidate lock is
    /// taken. Returns the number of blocks the hash file covers afterwards.
    pub fn parallel_hash(&self, file: u32, workers: usize) -> Result<u32> {
        let header = self.read_header(file)?;
        if header.finalized {
            return Ok(header.block_count);
        }
        let seek = self.seek_table_for(file, &header)?;
        let blocks = (seek.len() - 1) as u32;

        // make sure the hash file exists and absorbs earlier candidates
        let frontier = loop {
            match self.merge_hash_candidates(file) {
                Ok(_) => break (self.hash_file(file).read()?.len() - 1) as u32,
                Err(Error::NotFound(_)) => {
                    self.repair_hash_file(file)?;
                    return Ok(blocks);
                }
                Err(e) if e.is_busy() => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        };
        if frontier >= blocks {
            return Ok(frontier);
        }

        let workers = workers.max(1).min((blocks - frontier) as usize) as u32;
        let span = (blocks - frontier).div_ceil(workers);
        let ranges: Vec<(u32, u32)> = (0..workers)
            .map(|w| (frontier + w * span, (frontier + (w + 1) * span).min(blocks)))
            .filter(|(a, b)| a < b)
            .collect();

        let failed = AtomicBool::new(false);
        let results: Vec<Result<u32>> = crossbeam::scope(|s| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|&(first, end)| {
                    let failed = &failed;
                    s.spawn(move |_| self.run_worker(file, first, end, failed))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(Error::internal("hash worker panicked"))))
                .collect()
        })
        .map_err(|_| Error::internal("hash worker scope panicked"))?;

        for result in results {
            result?;
        }

        let deadline = Instant::now() + WORKER_PATIENCE;
        loop {
            match self.merge_hash_candidates(file) {
                Ok(_) => break,
                Err(e) if e.is_busy() && Instant::now() < deadline => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }

        let hashed = (self.hash_file(file).read()?.len() - 1) as u32;
        log::info!("Hashed file {} with {} workers: {} of {} blocks", file, workers, hashed, blocks);
        Ok(hashed)
    }

    fn run_worker(&self, file: u32, first: u32, end: u32, failed: &AtomicBool) -> Result<u32> {
        let worker = HashWorker::new(self, file);
        let deadline = Instant::now() + WORKER_PATIENCE;
        loop {
            match worker.compute_range(first, end) {
                Ok(n) => return Ok(n),
                Err(e) if e.is_busy() => {
                    if failed.load(Ordering::Acquire) || Instant::now() >= deadline {
                        return Err(e);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    failed.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CandidateFile;
    use tempfile::TempDir;

    #[test]
    fn test_merge_takes_sequential_prefix_only() {
        let dir = TempDir::new().unwrap();
        let hash_file = HashFile::new(dir.path().join("h.sat"), 2);
        let candidates = CandidateFile::new(dir.path().join("x.sat"), 2);
        hash_file.put_from(0, &[vec![0, 0]], false).unwrap();

        let mut guard = candidates.lock().unwrap();
        guard.append(&[(1, vec![1, 1]), (0, vec![0, 1]), (3, vec![3, 3])], false).unwrap();

        let mut hashes = hash_file.read().unwrap();
        let merged = merge_locked(&mut guard, &hash_file, &mut hashes, 5, false).unwrap();
        assert_eq!(merged, 2);
        assert_eq!(hash_file.read().unwrap(), vec![vec![0, 0], vec![0, 1], vec![1, 1]]);
        assert_eq!(hashes.len(), 3);

        // block 3 is still ahead of the frontier, so nothing is dropped
        assert_eq!(guard.read().unwrap().len(), 3);

        guard.append(&[(2, vec![2, 2])], false).unwrap();
        let merged = merge_locked(&mut guard, &hash_file, &mut hashes, 5, false).unwrap();
        assert_eq!(merged, 2);
        assert_eq!(hash_file.read().unwrap().len(), 5);
        assert!(guard.read().unwrap().is_empty());
    }

    #[test]
    fn test_merge_ignores_stale_and_out_of_range() {
        let dir = TempDir::new().unwrap();
        let hash_file = HashFile::new(dir.path().join("h.sat"), 2);
        let candidates = CandidateFile::new(dir.path().join("x.sat"), 2);
        hash_file.put_from(0, &[vec![0, 0], vec![1, 1]], false).unwrap();

        let mut guard = candidates.lock().unwrap();
        guard.append(&[(0, vec![9, 9]), (7, vec![7, 7])], false).unwrap();

        let mut hashes = hash_file.read().unwrap();
        let merged = merge_locked(&mut guard, &hash_file, &mut hashes, 3, false).unwrap();
        assert_eq!(merged, 0);
        assert_eq!(hash_file.read().unwrap(), vec![vec![0, 0], vec![1, 1]]);
        assert!(guard.read().unwrap().is_empty());
    }
}
