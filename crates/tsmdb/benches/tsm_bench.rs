//! Benchmarks for tsmdb storage components.
//!
//! Run with: cargo bench --package tsmdb
//!
//! ## Benchmark Categories
//!
//! - **Gorilla Compression**: Encode/decode performance
//! - **Blocks**: Encode/decode of typed blocks
//! - **Cache**: Sharded write and read
//! - **WAL**: Append and replay
//! - **TSM File I/O**: Write, read, scan
//! - **End-to-End**: Engine write path with flush

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tsmdb::cache::{Cache, CacheLoader};
use tsmdb::config::CacheConfig;
use tsmdb::tsm::block::{decode_block, encode_block};
use tsmdb::tsm::{BlockType, CompressedBlock, SeriesKey, TimeRange, TsmReader, TsmWriter, Value};
use tsmdb::wal::{list_segments, SyncMode, Wal, WalConfig, WalEntry};
use tsmdb::{Engine, EngineConfig};

/// Generate typical time series data (regular intervals, slowly varying values).
fn generate_typical_timeseries(count: usize) -> Vec<(i64, f64)> {
    let start_ts = 1_000_000_000_i64;
    let interval = 1_000_000_000_i64;

    let mut value = 50.0;
    (0..count)
        .map(|i| {
            value += (i as f64 * 0.1).sin() * 0.1;
            (start_ts + (i as i64) * interval, value)
        })
        .collect()
}

fn float_values(count: usize) -> Vec<Value> {
    generate_typical_timeseries(count)
        .into_iter()
        .map(|(ts, v)| Value::float(ts, v))
        .collect()
}

fn host_key(i: usize) -> SeriesKey {
    let host = format!("server{i}");
    SeriesKey::from_parts("cpu", &[("host", host.as_str())], "usage")
}

// ============================================================================
// Gorilla Compression
// ============================================================================

fn bench_gorilla_compress_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("gorilla_compress");

    for size in [100, 1_000, 10_000].iter() {
        let points = generate_typical_timeseries(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &points, |b, points| {
            b.iter(|| CompressedBlock::compress(black_box(points)))
        });
    }

    group.finish();
}

fn bench_gorilla_decompress_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("gorilla_decompress");

    for size in [100, 1_000, 10_000].iter() {
        let block = CompressedBlock::compress(&generate_typical_timeseries(*size));
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &block, |b, block| {
            b.iter(|| block.decompress())
        });
    }

    group.finish();
}

// ============================================================================
// Blocks
// ============================================================================

fn bench_block_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("block");
    group.throughput(Throughput::Elements(1000));

    let inputs = [
        (BlockType::Float, float_values(1000)),
        (
            BlockType::Integer,
            (0..1000).map(|t| Value::integer(t * 10, t % 97)).collect(),
        ),
        (
            BlockType::String,
            (0..1000).map(|t| Value::string(t * 10, format!("state-{}", t % 4))).collect(),
        ),
    ];

    for (block_type, values) in &inputs {
        let name = format!("{block_type:?}").to_lowercase();
        group.bench_with_input(BenchmarkId::new("encode", &name), values, |b, values| {
            b.iter(|| encode_block(*block_type, black_box(values)).unwrap())
        });

        let bytes = encode_block(*block_type, values).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", &name), &bytes, |b, bytes| {
            b.iter(|| decode_block(black_box(bytes), 0).unwrap())
        });
    }

    group.finish();
}

// ============================================================================
// Cache
// ============================================================================

fn bench_cache_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_write");

    for series in [1usize, 100].iter() {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(BenchmarkId::new("10k_points", series), series, |b, &series| {
            let keys: Vec<SeriesKey> = (0..series).map(host_key).collect();
            let values = float_values(10_000 / series);
            b.iter_batched(
                || Cache::new(&CacheConfig::default()),
                |cache| {
                    for (seq, key) in keys.iter().enumerate() {
                        cache.write(key, &values, seq as u64 + 1).unwrap();
                    }
                    cache
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_cache_read(c: &mut Criterion) {
    let cache = Cache::new(&CacheConfig::default());
    let key = host_key(0);
    // Out-of-order batches leave the entry unsorted until first read.
    for (seq, chunk) in float_values(10_000).chunks(1000).rev().enumerate() {
        cache.write(&key, chunk, seq as u64 + 1).unwrap();
    }

    c.bench_function("cache_values_10k", |b| {
        b.iter(|| black_box(cache.values(black_box(key.as_bytes()))))
    });
}

// ============================================================================
// WAL
// ============================================================================

fn bench_wal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");

    for sync_mode in [SyncMode::None, SyncMode::Fdatasync].iter() {
        let mode_name = match sync_mode {
            SyncMode::None => "nosync",
            SyncMode::Fsync => "fsync",
            SyncMode::Fdatasync => "fdatasync",
        };

        group.throughput(Throughput::Elements(100));
        group.bench_function(BenchmarkId::new("100_entries", mode_name), |b| {
            let entries: Vec<WalEntry> = (0..100)
                .map(|i| WalEntry::write(host_key(i), float_values(10)))
                .collect();
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let config = WalConfig::new(10 * 1024 * 1024, *sync_mode);
                    let wal = Wal::new(temp_dir.path(), config, 0).unwrap();
                    (temp_dir, wal)
                },
                |(_temp_dir, mut wal)| {
                    for entry in &entries {
                        wal.append(entry).unwrap();
                    }
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_wal_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_replay");

    for size in [100usize, 1_000].iter() {
        let temp_dir = TempDir::new().unwrap();
        {
            let config = WalConfig::new(1024 * 1024, SyncMode::None);
            let mut wal = Wal::new(temp_dir.path(), config, 0).unwrap();
            for i in 0..*size {
                wal.append(&WalEntry::write(host_key(i % 10), float_values(10)))
                    .unwrap();
            }
            wal.close().unwrap();
        }

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &temp_dir, |b, temp_dir| {
            b.iter(|| {
                let cache = Cache::new(&CacheConfig::default());
                let segments = list_segments(temp_dir.path()).unwrap();
                black_box(CacheLoader::new(segments).load(&cache).unwrap())
            })
        });
    }

    group.finish();
}

// ============================================================================
// TSM File I/O
// ============================================================================

fn bench_tsm_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("tsm_write");

    for series in [10usize, 100].iter() {
        let values = float_values(1000);
        let mut keys: Vec<SeriesKey> = (0..*series).map(host_key).collect();
        keys.sort();

        group.throughput(Throughput::Elements((*series * 1000) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(series), &keys, |b, keys| {
            b.iter_batched(
                || TempDir::new().unwrap(),
                |temp_dir| {
                    let path = temp_dir.path().join("000000001-000000001.tsm");
                    let mut writer = TsmWriter::create(&path, 1000).unwrap();
                    for key in keys {
                        writer.write_series(key, &values).unwrap();
                    }
                    writer.finish().unwrap()
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_tsm_read(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000000001-000000001.tsm");
    let mut keys: Vec<SeriesKey> = (0..100).map(host_key).collect();
    keys.sort();
    {
        let values = float_values(10_000);
        let mut writer = TsmWriter::create(&path, 1000).unwrap();
        for key in &keys {
            writer.write_series(key, &values).unwrap();
        }
        writer.finish().unwrap();
    }
    let reader = TsmReader::open(&path).unwrap();
    let key = keys[50].clone();

    let mut group = c.benchmark_group("tsm_read");
    group.bench_function("series_10k", |b| {
        b.iter(|| reader.read_all(black_box(key.as_bytes())).unwrap())
    });

    let (start, _) = generate_typical_timeseries(5_001)[4_000];
    let range = TimeRange::new(start, start + 1_000 * 1_000_000_000);
    group.bench_function("range_1k", |b| {
        b.iter(|| reader.read_range(key.as_bytes(), black_box(range)).unwrap())
    });

    group.bench_function("missing_key", |b| {
        b.iter(|| reader.read_all(black_box(b"absent#!~#usage")).unwrap())
    });

    group.finish();
}

// ============================================================================
// End-to-End
// ============================================================================

fn bench_engine_write_path(c: &mut Criterion) {
    c.bench_function("engine_write_flush_10k", |b| {
        let batches: Vec<(SeriesKey, Vec<Value>)> =
            (0..10).map(|i| (host_key(i), float_values(1000))).collect();
        b.iter_batched(
            || {
                let temp_dir = TempDir::new().unwrap();
                let config = EngineConfig::default()
                    .with_wal(WalConfig::new(10 * 1024 * 1024, SyncMode::None));
                let engine = Engine::open(temp_dir.path(), config).unwrap();
                (temp_dir, engine, batches.clone())
            },
            |(_temp_dir, engine, batches)| {
                engine.write_batch(batches).unwrap();
                engine.flush().unwrap();
                engine.close().unwrap();
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    // Gorilla compression
    bench_gorilla_compress_sizes,
    bench_gorilla_decompress_sizes,
    // Blocks
    bench_block_codec,
    // Cache
    bench_cache_write,
    bench_cache_read,
    // WAL
    bench_wal_append,
    bench_wal_replay,
    // TSM File I/O
    bench_tsm_write,
    bench_tsm_read,
    // End-to-End
    bench_engine_write_path,
);
criterion_main!(benches);
