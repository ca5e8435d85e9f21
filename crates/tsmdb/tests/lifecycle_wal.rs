//! Integration tests for WAL rotation, segment removal and replay.

use proptest::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::TempDir;
use tsmdb::cache::{Cache, CacheLoader};
use tsmdb::config::CacheConfig;
use tsmdb::wal::{list_segments, SyncMode, Wal, WalConfig, WalEntry};
use tsmdb::{SeriesKey, TsmError, Value};

fn entry(i: i64) -> WalEntry {
    WalEntry::write(SeriesKey::from("cpu"), vec![Value::float(i, i as f64)])
}

#[test]
fn test_remove_segments_keeps_entries_after_rotation() {
    let temp_dir = TempDir::new().unwrap();
    let mut wal = Wal::new(temp_dir.path(), WalConfig::new(200, SyncMode::Fsync), 0).unwrap();

    let mut boundary_seq = None;
    let mut previous_segment_id = wal.current_segment_id();
    for i in 0..200 {
        let seq = wal.append(&entry(i)).unwrap();
        let current_segment_id = wal.current_segment_id();
        if current_segment_id != previous_segment_id && boundary_seq.is_none() {
            boundary_seq = Some(seq);
        }
        previous_segment_id = current_segment_id;
        if boundary_seq.is_some() && i > 50 {
            break;
        }
    }
    let boundary_seq = boundary_seq.expect("WAL segment should rotate during test setup");

    let closed = wal.rotate().unwrap();
    let tail_seq = wal.append(&entry(1000)).unwrap();
    assert!(wal.list_segments().unwrap().len() > 2);

    let removed = wal.remove_segments(closed).unwrap();
    assert!(removed >= 2);
    let remaining = wal.list_segments().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, wal.current_segment_id());
    assert!(boundary_seq < tail_seq);
    wal.close().unwrap();

    let cache = Cache::new(&CacheConfig::default());
    let summary = CacheLoader::new(list_segments(temp_dir.path()).unwrap())
        .load(&cache)
        .unwrap();
    assert_eq!(summary.entries, 1);
    assert_eq!(summary.max_sequence, tail_seq);
    assert_eq!(cache.values(b"cpu"), vec![Value::float(1000, 1000.0)]);
}

#[test]
fn test_reopen_continues_segments_and_sequences() {
    let temp_dir = TempDir::new().unwrap();
    {
        let mut wal = Wal::new(temp_dir.path(), WalConfig::default(), 0).unwrap();
        for i in 0..10 {
            wal.append(&entry(i)).unwrap();
        }
        assert_eq!(wal.last_sequence(), 10);
    }

    let wal = Wal::new(temp_dir.path(), WalConfig::default(), 10).unwrap();
    assert_eq!(wal.current_segment_id(), 1);
    assert_eq!(wal.next_sequence(), 11);
}

#[test]
fn test_appends_after_close_fail() {
    let temp_dir = TempDir::new().unwrap();
    let mut wal = Wal::new(temp_dir.path(), WalConfig::default(), 0).unwrap();
    wal.close().unwrap();
    assert!(matches!(wal.append(&entry(1)), Err(TsmError::EngineClosed)));
}

#[test]
fn test_garbage_tail_is_cut_and_log_stays_appendable() {
    let temp_dir = TempDir::new().unwrap();
    {
        let mut wal = Wal::new(temp_dir.path(), WalConfig::default(), 0).unwrap();
        wal.append(&entry(1)).unwrap();
    }
    let path = list_segments(temp_dir.path()).unwrap()[0].path.clone();
    let good_len = fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(&[0xAB; 37])
        .unwrap();

    let cache = Cache::new(&CacheConfig::default());
    let summary = CacheLoader::new(list_segments(temp_dir.path()).unwrap())
        .load(&cache)
        .unwrap();
    assert_eq!(summary.truncated, Some(good_len));
    assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

    let mut wal = Wal::new(temp_dir.path(), WalConfig::default(), summary.max_sequence).unwrap();
    assert_eq!(wal.append(&entry(2)).unwrap(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever follows a valid record, replay returns instead of panicking,
    /// and it either keeps that record or refuses the segment outright.
    #[test]
    fn test_loader_never_panics_on_arbitrary_bytes(
        tail in prop::collection::vec(any::<u8>(), 0..512),
        interior in any::<bool>(),
    ) {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::new(temp_dir.path(), WalConfig::new(1024, SyncMode::None), 0).unwrap();
            wal.append(&entry(1)).unwrap();
            if interior {
                wal.rotate().unwrap();
                wal.append(&entry(2)).unwrap();
            }
            wal.close().unwrap();
        }
        let first = list_segments(temp_dir.path()).unwrap()[0].path.clone();
        OpenOptions::new().append(true).open(&first).unwrap().write_all(&tail).unwrap();

        let cache = Cache::new(&CacheConfig::default());
        let result = CacheLoader::new(list_segments(temp_dir.path()).unwrap()).load(&cache);
        if !interior {
            match result {
                Ok(_) => prop_assert!(!cache.values(b"cpu").is_empty()),
                Err(e) => prop_assert!(matches!(e, TsmError::CorruptSegment { .. }), "unexpected error: {:?}", e),
            }
        }
    }

    /// A segment made entirely of garbage never panics replay.
    #[test]
    fn test_loader_never_panics_on_garbage_segment(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("segment_0000000000000000.wal"), &bytes).unwrap();
        let cache = Cache::new(&CacheConfig::default());
        let _ = CacheLoader::new(list_segments(temp_dir.path()).unwrap()).load(&cache);
    }
}
