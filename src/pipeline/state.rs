//! Write-flag state machine.
//!
//! The write flag persisted in the header names the step that is pending.
//! Everything before it is durable. Recovery resumes at the persisted flag
//! and runs forward; nothing is ever rolled back.
//!
//! ```text
//! append:         Idle -> AppendWrite -> AppendIndex -> Idle
//! block finalize: Idle -> BlockWrite -> BlockIndex -> Idle
//! file finalize:  Idle -> FileClose -> FileSuccessor -> FileSeekTable
//!                      -> FileEdgeHashes -> FileSignature
//!                      [-> FileReducedHashes] -> Idle
//! ```

use serde::Serialize;
use std::fmt;

/// Persisted pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum WriteFlag {
    /// Consistent; no operation in progress.
    Idle = 0,
    /// Record frame pending.
    AppendWrite = 1,
    /// Folder cell update pending after an append.
    AppendIndex = 2,
    /// Block end frame pending.
    BlockWrite = 3,
    /// Seek table and folder cell update pending after a block end.
    BlockIndex = 4,
    /// Close marker pending.
    FileClose = 5,
    /// Successor file and folder redirect pending.
    FileSuccessor = 6,
    /// Seek table pending in the trailer.
    FileSeekTable = 7,
    /// Edge hashes pending in the trailer.
    FileEdgeHashes = 8,
    /// Signature block pending.
    FileSignature = 9,
    /// Reduced hashes and cover pending.
    FileReducedHashes = 10,
}

impl WriteFlag {
    /// Parses a raw header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        let flag = match value {
            0 => WriteFlag::Idle,
            1 => WriteFlag::AppendWrite,
            2 => WriteFlag::AppendIndex,
            3 => WriteFlag::BlockWrite,
            4 => WriteFlag::BlockIndex,
            5 => WriteFlag::FileClose,
            6 => WriteFlag::FileSuccessor,
            7 => WriteFlag::FileSeekTable,
            8 => WriteFlag::FileEdgeHashes,
            9 => WriteFlag::FileSignature,
            10 => WriteFlag::FileReducedHashes,
            _ => return None,
        };
        Some(flag)
    }

    /// Raw header byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The flag persisted once this flag's step is done.
    ///
    /// `FileSignature` leads to `FileReducedHashes`; the pipeline finishes
    /// directly from `FileSignature` when the file has no reduced hashes.
    pub fn next(self) -> WriteFlag {
        match self {
            WriteFlag::Idle => WriteFlag::Idle,
            WriteFlag::AppendWrite => WriteFlag::AppendIndex,
            WriteFlag::AppendIndex => WriteFlag::Idle,
            WriteFlag::BlockWrite => WriteFlag::BlockIndex,
            WriteFlag::BlockIndex => WriteFlag::Idle,
            WriteFlag::FileClose => WriteFlag::FileSuccessor,
            WriteFlag::FileSuccessor => WriteFlag::FileSeekTable,
            WriteFlag::FileSeekTable => WriteFlag::FileEdgeHashes,
            WriteFlag::FileEdgeHashes => WriteFlag::FileSignature,
            WriteFlag::FileSignature => WriteFlag::FileReducedHashes,
            WriteFlag::FileReducedHashes => WriteFlag::Idle,
        }
    }

    /// True for the file-finalization stages.
    pub fn is_file_finalize(self) -> bool {
        self >= WriteFlag::FileClose
    }

    /// True for stages that run after the successor file exists. Writers
    /// finding these are redirected to the successor.
    pub fn redirects_writers(self) -> bool {
        self >= WriteFlag::FileSuccessor
    }

    /// Short stage name.
    pub fn name(self) -> &'static str {
        match self {
            WriteFlag::Idle => "idle",
            WriteFlag::AppendWrite => "append-write",
            WriteFlag::AppendIndex => "append-index",
            WriteFlag::BlockWrite => "block-write",
            WriteFlag::BlockIndex => "block-index",
            WriteFlag::FileClose => "file-close",
            WriteFlag::FileSuccessor => "file-successor",
            WriteFlag::FileSeekTable => "file-seek-table",
            WriteFlag::FileEdgeHashes => "file-edge-hashes",
            WriteFlag::FileSignature => "file-signature",
            WriteFlag::FileReducedHashes => "file-reduced-hashes",
        }
    }
}

impl fmt::Display for WriteFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_roundtrip() {
        for raw in 0..=10u8 {
            let flag = WriteFlag::from_u8(raw).unwrap();
            assert_eq!(flag.as_u8(), raw);
        }
        assert!(WriteFlag::from_u8(11).is_none());
        assert!(WriteFlag::from_u8(0xFF).is_none());
    }

    #[test]
    fn test_every_path_returns_to_idle() {
        for start in [WriteFlag::AppendWrite, WriteFlag::BlockWrite, WriteFlag::FileClose] {
            let mut flag = start;
            let mut steps = 0;
            while flag != WriteFlag::Idle {
                let next = flag.next();
                assert!(next == WriteFlag::Idle || next > flag, "{} goes backwards", flag);
                flag = next;
                steps += 1;
            }
            assert!(steps <= 6);
        }
        assert_eq!(WriteFlag::Idle.next(), WriteFlag::Idle);
    }

    #[test]
    fn test_stage_classes() {
        assert!(!WriteFlag::BlockIndex.is_file_finalize());
        assert!(WriteFlag::FileClose.is_file_finalize());
        assert!(!WriteFlag::FileClose.redirects_writers());
        assert!(WriteFlag::FileSuccessor.redirects_writers());
        assert!(WriteFlag::FileReducedHashes.redirects_writers());
    }

    #[test]
    fn test_display() {
        assert_eq!(WriteFlag::FileSignature.to_string(), "file-signature (9)");
    }
}
