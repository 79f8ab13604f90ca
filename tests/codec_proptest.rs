// Property Tests for the HSD codecs and framing
// These tests check INS, III and the frame scanner against generated input

use hsd::codec::{iii, ins, Map, Value};
use hsd::format::frame::{self, FrameKind, FrameReader};
use hsd::format::HEADER_SIZE;
use proptest::prelude::*;
use std::io::Cursor;

enum Piece {
    Record(Vec<u8>),
    BlockEnd(Vec<u8>),
}

fn piece() -> impl Strategy<Value = Piece> {
    prop_oneof![
        4 => prop_oneof![
            prop::collection::vec(any::<u8>(), 0..200),
            prop::collection::vec(any::<u8>(), 16_380..16_400),
        ]
        .prop_map(Piece::Record),
        1 => prop::collection::vec(any::<u8>(), 0..9).prop_map(Piece::BlockEnd),
    ]
}

impl std::fmt::Debug for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Piece::Record(p) => write!(f, "Record({} bytes)", p.len()),
            Piece::BlockEnd(p) => write!(f, "BlockEnd({} bytes)", p.len()),
        }
    }
}

/// Header placeholder followed by the encoded pieces, plus every block end offset.
fn layout(pieces: &[Piece]) -> (Vec<u8>, Vec<u64>) {
    let mut data = vec![0u8; HEADER_SIZE as usize];
    let mut block_ends = Vec::new();
    for piece in pieces {
        match piece {
            Piece::Record(p) => data.extend(frame::encode_record(p).unwrap()),
            Piece::BlockEnd(p) => {
                data.extend(frame::encode_block_end(p).unwrap());
                block_ends.push(data.len() as u64);
            }
        }
    }
    (data, block_ends)
}

fn key() -> impl Strategy<Value = String> {
    "[a-z]{1,32}"
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (0i64..70_000).prop_map(Value::Int),
        "[ -~]{0,300}".prop_map(Value::Str),
    ]
}

fn mapping() -> impl Strategy<Value = Map> {
    let leaf = prop::collection::btree_map(key(), scalar(), 0..6);
    prop::collection::btree_map(
        key(),
        prop_oneof![3 => scalar(), 1 => leaf.prop_map(Value::Map)],
        0..8,
    )
}

proptest! {
    /// Every representable value decodes back to itself with the expected width
    #[test]
    fn prop_ins_roundtrip(n in -16_383i32..=4_194_303) {
        let bytes = ins::encode(n).unwrap();
        let decoded = ins::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.value(), n);
        prop_assert_eq!(decoded.width as usize, bytes.len());
        prop_assert_eq!(ins::encoded_len(bytes[0]), bytes.len());
        prop_assert!(!decoded.is_alternate());

        let expected_width = match n {
            0..=127 => 1,
            128..=16_383 => 2,
            n if n > 0 => 3,
            -127..=-1 => 2,
            _ => 3,
        };
        prop_assert_eq!(bytes.len(), expected_width);
    }

    /// Values outside the encodable range are rejected, not truncated
    #[test]
    fn prop_ins_out_of_range(n in prop_oneof![4_194_304i32..=i32::MAX, i32::MIN..=-16_384]) {
        prop_assert!(ins::encode(n).is_err());
    }

    /// Arbitrary bytes never make the INS decoder panic
    #[test]
    fn prop_ins_decode_total(bytes in prop::collection::vec(any::<u8>(), 0..4)) {
        if let Ok(decoded) = ins::decode(&bytes) {
            prop_assert!(decoded.width as usize <= bytes.len());
        }
    }

    /// Mappings of strings, integers, booleans and one nesting level survive encoding
    #[test]
    fn prop_iii_roundtrip(map in mapping()) {
        let bytes = iii::encode(&map).unwrap();
        prop_assert_eq!(iii::decode(&bytes).unwrap(), map);
    }

    /// A truncated mapping either fails or decodes, but never panics
    #[test]
    fn prop_iii_truncated(map in mapping(), cut in any::<prop::sample::Index>()) {
        let bytes = iii::encode(&map).unwrap();
        if !bytes.is_empty() {
            let _ = iii::decode(&bytes[..cut.index(bytes.len())]);
        }
    }

    /// The frame reader returns every payload in order
    #[test]
    fn prop_frames_read_back(pieces in prop::collection::vec(piece(), 0..24)) {
        let (data, _) = layout(&pieces);
        let end = data.len() as u64;
        let frames: Vec<_> = FrameReader::new(Cursor::new(data), HEADER_SIZE, end)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        prop_assert_eq!(frames.len(), pieces.len());
        for (frame, piece) in frames.iter().zip(&pieces) {
            match piece {
                Piece::Record(p) => {
                    prop_assert_eq!(frame.kind, FrameKind::Record);
                    prop_assert_eq!(&frame.payload, p);
                }
                Piece::BlockEnd(p) => {
                    prop_assert_eq!(frame.kind, FrameKind::BlockEnd);
                    prop_assert_eq!(&frame.payload, p);
                }
            }
        }
    }

    /// Scanning a file cut at any point finds a prefix of the block ends and
    /// never reports valid bytes past the cut
    #[test]
    fn prop_scan_of_torn_file(
        pieces in prop::collection::vec(piece(), 1..24),
        cut in any::<prop::sample::Index>(),
    ) {
        let (data, block_ends) = layout(&pieces);
        let cut = HEADER_SIZE as usize + cut.index(data.len() - HEADER_SIZE as usize + 1);
        let torn = data[..cut].to_vec();

        let scan = frame::scan(Cursor::new(torn), cut as u64).unwrap();
        prop_assert!(scan.valid_end <= cut as u64);
        prop_assert!(scan.tail() <= scan.valid_end);
        prop_assert_eq!(&scan.block_ends[..], &block_ends[..scan.block_ends.len()]);
        let complete = block_ends.iter().filter(|end| **end <= cut as u64).count();
        prop_assert_eq!(scan.block_ends.len(), complete);
    }
}
