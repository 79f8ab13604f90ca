// Shared helpers for the integration tests
#![allow(dead_code)]

use hsd::{Manifest, Options, Signer, Stream, StreamId};
use sha2::{Digest as _, Sha512};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const SID: StreamId = StreamId::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Options for tests: no fsync, everything else default.
pub fn fast_options() -> Options {
    Options::default().sync_writes(false)
}

pub fn new_stream(folder: &Path) -> Stream {
    init_logger();
    Stream::init(folder, Manifest::new(SID), fast_options()).unwrap()
}

/// Deterministic signer: SHA-512 over a fixed key and the message.
#[derive(Debug)]
pub struct DigestSigner {
    key: [u8; 20],
}

impl DigestSigner {
    pub fn new(key: [u8; 20]) -> Arc<Self> {
        Arc::new(DigestSigner { key })
    }
}

impl Signer for DigestSigner {
    fn sign(&self, message: &[u8]) -> hsd::Result<Vec<u8>> {
        let mut hasher = Sha512::new();
        hasher.update(self.key);
        hasher.update(message);
        Ok(hasher.finalize().to_vec())
    }

    fn identity(&self) -> [u8; 20] {
        self.key
    }

    fn algorithm(&self) -> &str {
        "sha512-mac"
    }
}

/// Signer that returns a signature too short to be plausible.
#[derive(Debug)]
pub struct ShortSigner;

impl Signer for ShortSigner {
    fn sign(&self, _message: &[u8]) -> hsd::Result<Vec<u8>> {
        Ok(vec![0x55; 16])
    }

    fn identity(&self) -> [u8; 20] {
        [0x42; 20]
    }

    fn algorithm(&self) -> &str {
        "short"
    }
}

/// Writes `blocks` blocks of `per_block` records each.
pub fn write_blocks(stream: &Stream, blocks: usize, per_block: usize) {
    for b in 0..blocks {
        for r in 0..per_block {
            stream.append(format!("block{}-record{}", b, r).as_bytes()).unwrap();
        }
        stream.finalize_block().unwrap();
    }
}

/// Every file below `folder`, keyed by relative path.
pub fn snapshot(folder: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    collect(folder, folder, &mut files);
    files
}

fn collect(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(root, &path, out);
        } else {
            let name = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            out.insert(name, fs::read(&path).unwrap());
        }
    }
}
