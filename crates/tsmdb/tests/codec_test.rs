//! Property-based tests for block codecs and file decoding.
//!
//! Uses proptest to verify lossless round-trips for every value kind, and that
//! decoders reject arbitrary bytes without panicking.

use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;
use tsmdb::tsm::block::{decode_block, encode_block, verify_block};
use tsmdb::tsm::{BlockType, CompressedBlock, FieldValue, SeriesKey, TimeRange, TsmReader, TsmWriter, Value};

/// Sorted, distinct timestamps anywhere in the i64 range.
fn timestamp_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::btree_set(any::<i64>(), 1..200).prop_map(|s| s.into_iter().collect())
}

/// Strategy for generating typical time series data.
/// Regular intervals with slowly varying values.
fn typical_timeseries_strategy() -> impl Strategy<Value = Vec<(i64, f64)>> {
    (1i64..1000, 1..100usize).prop_flat_map(|(interval, count)| {
        let start_ts = 1_000_000_000_000i64;
        prop::collection::vec(-1000.0f64..1000.0, count).prop_map(move |values| {
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (start_ts + (i as i64) * interval, v))
                .collect()
        })
    })
}

fn values_of(block_type: BlockType, timestamps: &[i64], seed: &[u64]) -> Vec<Value> {
    timestamps
        .iter()
        .zip(seed.iter().cycle())
        .map(|(&ts, &s)| match block_type {
            BlockType::Float => Value::float(ts, f64::from_bits(s)),
            BlockType::Integer => Value::integer(ts, s as i64),
            BlockType::Unsigned => Value::unsigned(ts, s),
            BlockType::Boolean => Value::boolean(ts, s & 1 == 1),
            BlockType::String => Value::string(ts, format!("{s:x}")),
        })
        .collect()
}

fn same(a: &[Value], b: &[Value]) -> bool {
    // NaN payloads compare by bit pattern.
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (&x.field, &y.field) {
            (FieldValue::Float(fx), FieldValue::Float(fy)) => {
                x.timestamp == y.timestamp && fx.to_bits() == fy.to_bits()
            }
            _ => x == y,
        })
}

proptest! {
    /// Gorilla streams round-trip any sorted timestamps and any float bits.
    #[test]
    fn test_gorilla_roundtrip_full_range(
        timestamps in timestamp_strategy(),
        bits in prop::collection::vec(any::<u64>(), 1..8),
    ) {
        let points: Vec<(i64, f64)> = timestamps
            .iter()
            .zip(bits.iter().cycle())
            .map(|(&ts, &b)| (ts, f64::from_bits(b)))
            .collect();

        let block = CompressedBlock::compress(&points);
        let decompressed = block.decompress().unwrap();

        prop_assert_eq!(points.len(), decompressed.len());
        for (original, decoded) in points.iter().zip(decompressed.iter()) {
            prop_assert_eq!(original.0, decoded.0);
            prop_assert_eq!(original.1.to_bits(), decoded.1.to_bits());
        }
    }

    /// Test compression ratio for regular interval data.
    #[test]
    fn test_typical_timeseries_compresses(points in typical_timeseries_strategy()) {
        let block = CompressedBlock::compress(&points);
        prop_assert_eq!(block.decompress().unwrap(), points.clone());

        if points.len() >= 50 {
            let raw_size = points.len() * std::mem::size_of::<(i64, f64)>();
            let compressed_size = (block.timestamps.len() + block.values.len()).div_ceil(8);
            prop_assert!(raw_size as f64 / compressed_size as f64 > 1.5);
        }
    }

    /// Blocks of every kind decode to exactly what was encoded.
    #[test]
    fn test_block_roundtrip_every_kind(
        kind in 0u8..5,
        timestamps in timestamp_strategy(),
        seed in prop::collection::vec(any::<u64>(), 1..16),
    ) {
        let block_type = BlockType::from_u8(kind).unwrap();
        let values = values_of(block_type, &timestamps, &seed);

        let bytes = encode_block(block_type, &values).unwrap();
        let header = verify_block(&bytes, 0).unwrap();
        prop_assert_eq!(header.point_count as usize, values.len());
        prop_assert_eq!(header.block_type, block_type);

        let decoded = decode_block(&bytes, 0).unwrap();
        prop_assert!(same(&decoded, &values));
    }

    /// Arbitrary bytes never panic the block decoder.
    #[test]
    fn test_block_decoder_rejects_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_block(&bytes, 0);
    }

    /// Flipping any byte of a valid block is caught.
    #[test]
    fn test_block_bit_flip_detected(
        timestamps in timestamp_strategy(),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let values = values_of(BlockType::Integer, &timestamps, &[7, 11, 13]);
        let mut bytes = encode_block(BlockType::Integer, &values).unwrap();
        let i = position.index(bytes.len());
        bytes[i] ^= mask;
        prop_assert!(decode_block(&bytes, 0).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Opening and reading a damaged TSM file returns errors, never panics.
    #[test]
    fn test_reader_never_panics_on_damaged_file(
        edits in prop::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 1..8),
        truncate in prop::option::of(any::<prop::sample::Index>()),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("f.tsm");
        let mut writer = TsmWriter::create(&path, 4).unwrap();
        for key in ["a", "b", "c"] {
            let values: Vec<Value> = (0..10).map(|t| Value::integer(t, t)).collect();
            writer.write_series(&SeriesKey::from(key), &values).unwrap();
        }
        writer.finish().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        for (index, byte) in edits {
            let i = index.index(bytes.len());
            bytes[i] = byte;
        }
        if let Some(index) = truncate {
            bytes.truncate(index.index(bytes.len()));
        }
        fs::write(&path, &bytes).unwrap();

        if let Ok(reader) = TsmReader::open(&path) {
            for key in ["a", "b", "c", "zz"] {
                let _ = reader.read_all(key.as_bytes());
                let _ = reader.read_range(key.as_bytes(), TimeRange::new(3, 7));
            }
            for block in reader.block_iter() {
                let _ = block.and_then(|b| b.decode());
            }
        }
    }

    /// Arbitrary bytes never panic the reader.
    #[test]
    fn test_reader_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("g.tsm");
        fs::write(&path, &bytes).unwrap();
        prop_assert!(TsmReader::open(&path).is_err() || bytes.len() >= 44);
    }
}
