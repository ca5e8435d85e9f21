//! Sharded in-memory cache of recent writes.
//!
//! The cache holds every value that has been made durable in the WAL but not
//! yet written to a TSM file. It is organised in generations:
//!
//! ```text
//! active store  ──snapshot()──►  Snapshot (frozen, being flushed)
//!     ▲                              │
//!     │ restore_snapshot() on        │ release_snapshot() once the
//!     └───── flush failure ──────────┘ flushed file is installed
//! ```
//!
//! Reads merge snapshots (oldest first) with the active store. Memory is
//! charged through [`Cache::reserve`] before a write and only given back when a
//! snapshot is released, so the total never exceeds the configured ceiling.

pub(crate) mod entry;
mod loader;

pub use entry::Entry;
pub use loader::{CacheLoader, LoadSummary};

use crate::config::CacheConfig;
use crate::error::{Result, TsmError};
use crate::tsm::{BlockType, SeriesKey, TimeRange, Timestamp, Value};
use entry::merge_tagged;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

/// Number of independently locked shards per generation.
pub const SHARD_COUNT: usize = 16;

/// What a write does when the cache is at its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Fail immediately with `CapacityExceeded`.
    #[default]
    Reject,
    /// Block until a snapshot release frees memory, failing with
    /// `CapacityExceeded` after `timeout`.
    Wait {
        /// Longest time a write may block.
        timeout: Duration,
    },
}

/// A delete applied to the cache, kept so it can be carried to TSM files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecord {
    /// Affected series.
    pub keys: Vec<SeriesKey>,
    /// First deleted timestamp (inclusive).
    pub min: Timestamp,
    /// Last deleted timestamp (inclusive).
    pub max: Timestamp,
}

/// One generation of cache entries.
#[derive(Debug)]
struct Store {
    shards: Vec<RwLock<HashMap<SeriesKey, Entry>>>,
    /// Bytes charged to this generation.
    size: AtomicU64,
    max_sequence: AtomicU64,
}

impl Store {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            size: AtomicU64::new(0),
            max_sequence: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<SeriesKey, Entry>> {
        &self.shards[(xxh64(key, 0) % SHARD_COUNT as u64) as usize]
    }

    fn key_type(&self, key: &[u8]) -> Option<BlockType> {
        read(self.shard(key)).get(key).map(Entry::block_type)
    }

    fn tagged(&self, key: &[u8], range: Option<TimeRange>) -> Vec<(Value, u64)> {
        let shard = read(self.shard(key));
        match (shard.get(key), range) {
            (Some(e), Some(range)) => e.tagged_in_range(range).to_vec(),
            (Some(e), None) => e.tagged().to_vec(),
            (None, _) => Vec::new(),
        }
    }

    fn remove_range(&self, keys: &[SeriesKey], min: Timestamp, max: Timestamp) -> usize {
        let mut removed = 0;
        for key in keys {
            let mut shard = write(self.shard(key.as_bytes()));
            if let Some(entry) = shard.get_mut(key.as_bytes()) {
                removed += entry.remove_range(min, max);
                if entry.is_empty() {
                    shard.remove(key.as_bytes());
                }
            }
        }
        removed
    }

    fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self
            .shards
            .iter()
            .flat_map(|s| read(s).keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys
    }

    fn value_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| read(s).values().map(Entry::len).sum::<usize>())
            .sum()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A frozen cache generation handed to the flush path.
#[derive(Debug)]
pub struct Snapshot {
    id: u64,
    store: Arc<Store>,
    deletes: Mutex<Vec<DeleteRecord>>,
}

impl Snapshot {
    /// Monotonic snapshot id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<SeriesKey> {
        self.store.keys()
    }

    /// Values of `key`, sorted and deduplicated.
    pub fn values(&self, key: &[u8]) -> Vec<Value> {
        read(self.store.shard(key))
            .get(key)
            .map(Entry::values)
            .unwrap_or_default()
    }

    /// Payload kind of `key`.
    pub fn key_type(&self, key: &[u8]) -> Option<BlockType> {
        self.store.key_type(key)
    }

    /// Bytes charged to this snapshot.
    pub fn size(&self) -> u64 {
        self.store.size.load(Ordering::Acquire)
    }

    /// Highest WAL sequence written into this generation.
    pub fn max_sequence(&self) -> u64 {
        self.store.max_sequence.load(Ordering::Acquire)
    }

    /// Number of values held.
    pub fn value_count(&self) -> usize {
        self.store.value_count()
    }

    /// Returns true if the snapshot holds no values.
    pub fn is_empty(&self) -> bool {
        self.value_count() == 0
    }

    /// Locks the delete log.
    ///
    /// Deletes arriving while the guard is held wait for it, so a flush that
    /// holds the guard across installing its file cannot miss one.
    pub fn delete_log(&self) -> MutexGuard<'_, Vec<DeleteRecord>> {
        lock(&self.deletes)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Bytes charged across all generations.
    pub size: u64,
    /// Configured ceiling (0 = unlimited).
    pub max_size: u64,
    /// Bytes charged to the active generation.
    pub active_size: u64,
    /// Number of unreleased snapshots.
    pub snapshots: usize,
}

/// Sharded concurrent cache.
pub struct Cache {
    store: RwLock<Arc<Store>>,
    snapshots: RwLock<Vec<Arc<Snapshot>>>,
    size: AtomicU64,
    max_size: u64,
    policy: BackpressurePolicy,
    freed: Mutex<()>,
    freed_cond: Condvar,
    last_snapshot: Mutex<Instant>,
    next_snapshot_id: AtomicU64,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("size", &self.size())
            .field("max_size", &self.max_size)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Cache {
    /// Creates an empty cache.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            store: RwLock::new(Arc::new(Store::new())),
            snapshots: RwLock::new(Vec::new()),
            size: AtomicU64::new(0),
            max_size: config.max_size,
            policy: config.backpressure,
            freed: Mutex::new(()),
            freed_cond: Condvar::new(),
            last_snapshot: Mutex::new(Instant::now()),
            next_snapshot_id: AtomicU64::new(1),
        }
    }

    fn try_reserve(&self, bytes: u64) -> std::result::Result<(), u64> {
        let mut used = self.size.load(Ordering::Acquire);
        loop {
            if self.max_size != 0 && used.saturating_add(bytes) > self.max_size {
                return Err(used);
            }
            match self.size.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => used = current,
            }
        }
    }

    /// Charges `bytes` against the ceiling before a write.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CapacityExceeded` if the bytes do not fit, after
    /// waiting up to the policy timeout with [`BackpressurePolicy::Wait`].
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        let exceeded = |used| TsmError::CapacityExceeded {
            requested: bytes,
            used,
            limit: self.max_size,
        };

        match self.policy {
            BackpressurePolicy::Reject => self.try_reserve(bytes).map_err(exceeded),
            BackpressurePolicy::Wait { timeout } => {
                let deadline = Instant::now() + timeout;
                let mut guard = lock(&self.freed);
                loop {
                    let used = match self.try_reserve(bytes) {
                        Ok(()) => return Ok(()),
                        Err(used) => used,
                    };
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(exceeded(used));
                    }
                    guard = self
                        .freed_cond
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    /// Charges `bytes` without checking the ceiling. Used during WAL replay.
    pub(crate) fn force_reserve(&self, bytes: u64) {
        self.size.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Gives back a reservation whose write did not happen.
    pub fn release(&self, bytes: u64) {
        self.sub_size(bytes);
    }

    fn sub_size(&self, bytes: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(s.saturating_sub(bytes)));
        let _guard = lock(&self.freed);
        self.freed_cond.notify_all();
    }

    /// Bytes a write of `values` is charged.
    pub fn charge_for(values: &[Value]) -> u64 {
        values.iter().map(|v| v.size() as u64).sum()
    }

    /// Checks that `values` share one payload kind that agrees with the series.
    pub fn check_type(&self, key: &SeriesKey, values: &[Value]) -> Result<()> {
        let Some(first) = values.first() else {
            return Ok(());
        };
        let expected = self.key_type(key.as_bytes()).unwrap_or(first.block_type());
        match values.iter().find(|v| v.block_type() != expected) {
            Some(bad) => Err(TsmError::TypeMismatch {
                key: key.to_string_lossy(),
                expected,
                actual: bad.block_type(),
            }),
            None => Ok(()),
        }
    }

    /// Merges `values` written at WAL `sequence` into the active generation.
    ///
    /// The bytes must already be reserved; they are attributed to the active
    /// generation and freed when its snapshot is released.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::TypeMismatch` if the values disagree with each other
    /// or with the series' existing kind.
    pub fn write(&self, key: &SeriesKey, values: &[Value], sequence: u64) -> Result<()> {
        let Some(first) = values.first() else {
            return Ok(());
        };
        let store = read(&self.store);

        let expected = self.snapshot_key_type(key.as_bytes());
        let mut shard = write(store.shard(key.as_bytes()));
        let expected = shard
            .get(key.as_bytes())
            .map(Entry::block_type)
            .or(expected)
            .unwrap_or(first.block_type());
        if let Some(bad) = values.iter().find(|v| v.block_type() != expected) {
            return Err(TsmError::TypeMismatch {
                key: key.to_string_lossy(),
                expected,
                actual: bad.block_type(),
            });
        }

        shard
            .entry(key.clone())
            .or_insert_with(|| Entry::new(expected))
            .add(values, sequence);
        store
            .size
            .fetch_add(Self::charge_for(values), Ordering::AcqRel);
        store.max_sequence.fetch_max(sequence, Ordering::AcqRel);
        Ok(())
    }

    fn snapshot_key_type(&self, key: &[u8]) -> Option<BlockType> {
        read(&self.snapshots)
            .iter()
            .rev()
            .find_map(|s| s.store.key_type(key))
    }

    /// Removes values of `keys` with `min <= t <= max` from every generation.
    ///
    /// Unreleased snapshots record the delete in their log. Returns the number
    /// of values removed.
    pub fn delete_range(&self, keys: &[SeriesKey], min: Timestamp, max: Timestamp) -> usize {
        if min > max || keys.is_empty() {
            return 0;
        }
        let store = read(&self.store);
        let mut removed = store.remove_range(keys, min, max);

        for snapshot in read(&self.snapshots).iter() {
            let mut log = snapshot.delete_log();
            removed += snapshot.store.remove_range(keys, min, max);
            log.push(DeleteRecord {
                keys: keys.to_vec(),
                min,
                max,
            });
        }
        removed
    }

    /// Freezes the active generation and starts an empty one.
    ///
    /// Writers are blocked only for the pointer swap.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let mut store = write(&self.store);
        let frozen = std::mem::replace(&mut *store, Arc::new(Store::new()));

        let snapshot = Arc::new(Snapshot {
            id: self.next_snapshot_id.fetch_add(1, Ordering::AcqRel),
            store: frozen,
            deletes: Mutex::new(Vec::new()),
        });
        write(&self.snapshots).push(snapshot.clone());
        *lock(&self.last_snapshot) = Instant::now();

        debug!(
            snapshot = snapshot.id,
            size = snapshot.size(),
            max_sequence = snapshot.max_sequence(),
            "cache snapshot taken"
        );
        snapshot
    }

    fn detach(&self, snapshot: &Snapshot) -> bool {
        let mut snapshots = write(&self.snapshots);
        let before = snapshots.len();
        snapshots.retain(|s| s.id != snapshot.id);
        snapshots.len() != before
    }

    /// Drops a flushed snapshot and frees its memory.
    pub fn release_snapshot(&self, snapshot: &Snapshot) {
        if self.detach(snapshot) {
            self.sub_size(snapshot.size());
            debug!(snapshot = snapshot.id, size = snapshot.size(), "cache snapshot released");
        }
    }

    /// Merges a snapshot whose flush failed back into the active generation.
    ///
    /// Collisions with newer writes resolve by WAL sequence. The snapshot's
    /// memory stays charged, now to the active generation.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) {
        let store = read(&self.store);
        if !self.detach(snapshot) {
            return;
        }
        for (src, dst) in snapshot.store.shards.iter().zip(&store.shards) {
            let src = read(src);
            let mut dst = write(dst);
            for (key, entry) in src.iter() {
                dst.entry(key.clone())
                    .or_insert_with(|| Entry::new(entry.block_type()))
                    .merge(entry.tagged().iter().cloned());
            }
        }
        store.size.fetch_add(snapshot.size(), Ordering::AcqRel);
        store
            .max_sequence
            .fetch_max(snapshot.max_sequence(), Ordering::AcqRel);
        debug!(snapshot = snapshot.id, "cache snapshot restored");
    }

    fn collect(&self, key: &[u8], range: Option<TimeRange>) -> Vec<Value> {
        let store = read(&self.store);
        let mut runs: Vec<Vec<(Value, u64)>> = read(&self.snapshots)
            .iter()
            .map(|s| s.store.tagged(key, range))
            .collect();
        runs.push(store.tagged(key, range));
        merge_tagged(runs)
    }

    /// All cached values of `key` across generations.
    pub fn values(&self, key: &[u8]) -> Vec<Value> {
        self.collect(key, None)
    }

    /// Cached values of `key` within `range`.
    pub fn values_in_range(&self, key: &[u8], range: TimeRange) -> Vec<Value> {
        if range.is_empty() {
            return Vec::new();
        }
        self.collect(key, Some(range))
    }

    /// Payload kind of `key` if any generation holds it.
    pub fn key_type(&self, key: &[u8]) -> Option<BlockType> {
        let store = read(&self.store);
        store.key_type(key).or_else(|| self.snapshot_key_type(key))
    }

    /// Sorted keys present in any generation.
    pub fn keys(&self) -> Vec<SeriesKey> {
        let store = read(&self.store);
        let mut keys = store.keys();
        for s in read(&self.snapshots).iter() {
            keys.extend(s.store.keys());
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Bytes charged across all generations.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Configured ceiling (0 = unlimited).
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes charged to the active generation.
    pub fn active_size(&self) -> u64 {
        read(&self.store).size.load(Ordering::Acquire)
    }

    /// Returns true if the active generation holds no values.
    pub fn is_active_empty(&self) -> bool {
        read(&self.store).value_count() == 0
    }

    /// Time since the last snapshot (or since creation).
    pub fn last_snapshot_age(&self) -> Duration {
        lock(&self.last_snapshot).elapsed()
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.size(),
            max_size: self.max_size,
            active_size: self.active_size(),
            snapshots: read(&self.snapshots).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cache(max_size: u64) -> Cache {
        Cache::new(&CacheConfig::default().with_max_size(max_size))
    }

    fn put(cache: &Cache, key: &str, values: &[Value], seq: u64) -> Result<()> {
        cache.reserve(Cache::charge_for(values))?;
        cache.write(&SeriesKey::from(key), values, seq)
    }

    #[test]
    fn test_write_and_read_back() {
        let c = cache(0);
        put(&c, "cpu", &[Value::float(1, 1.0)], 1).unwrap();
        put(&c, "cpu", &[Value::float(1, 2.0)], 2).unwrap();
        assert_eq!(c.values(b"cpu"), vec![Value::float(1, 2.0)]);
        assert_eq!(c.key_type(b"cpu"), Some(BlockType::Float));
        assert_eq!(c.keys(), vec![SeriesKey::from("cpu")]);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let c = cache(0);
        put(&c, "k", &[Value::integer(1, 1)], 1).unwrap();
        assert!(matches!(
            c.write(&SeriesKey::from("k"), &[Value::float(2, 1.0)], 2),
            Err(TsmError::TypeMismatch { .. })
        ));
        assert!(matches!(
            c.write(&SeriesKey::from("j"), &[Value::float(1, 1.0), Value::boolean(2, true)], 3),
            Err(TsmError::TypeMismatch { .. })
        ));

        // The kind outlives a snapshot.
        c.snapshot();
        assert!(c.write(&SeriesKey::from("k"), &[Value::float(3, 1.0)], 4).is_err());
    }

    #[test]
    fn test_capacity_exceeded_then_freed_by_release() {
        let one = Value::integer(0, 0).size() as u64;
        let c = cache(one * 2);
        put(&c, "a", &[Value::integer(1, 1)], 1).unwrap();
        put(&c, "a", &[Value::integer(2, 2)], 2).unwrap();
        assert!(matches!(
            put(&c, "a", &[Value::integer(3, 3)], 3),
            Err(TsmError::CapacityExceeded { .. })
        ));
        assert_eq!(c.size(), one * 2);

        let snap = c.snapshot();
        assert_eq!(c.size(), one * 2);
        c.release_snapshot(&snap);
        assert_eq!(c.size(), 0);
        put(&c, "a", &[Value::integer(3, 3)], 3).unwrap();
    }

    #[test]
    fn test_wait_policy_unblocks_on_release() {
        let one = Value::integer(0, 0).size() as u64;
        let c = Arc::new(Cache::new(
            &CacheConfig::default()
                .with_max_size(one)
                .with_backpressure(BackpressurePolicy::Wait {
                    timeout: Duration::from_secs(5),
                }),
        ));
        put(&c, "a", &[Value::integer(1, 1)], 1).unwrap();
        let snap = c.snapshot();

        let writer = {
            let c = c.clone();
            thread::spawn(move || put(&c, "a", &[Value::integer(2, 2)], 2))
        };
        thread::sleep(Duration::from_millis(50));
        c.release_snapshot(&snap);
        writer.join().unwrap().unwrap();
    }

    #[test]
    fn test_wait_policy_times_out() {
        let c = Cache::new(
            &CacheConfig::default()
                .with_max_size(1)
                .with_backpressure(BackpressurePolicy::Wait {
                    timeout: Duration::from_millis(20),
                }),
        );
        assert!(matches!(c.reserve(2), Err(TsmError::CapacityExceeded { .. })));
    }

    #[test]
    fn test_snapshot_then_reads_merge_generations() {
        let c = cache(0);
        put(&c, "k", &[Value::float(1, 1.0), Value::float(2, 2.0)], 1).unwrap();
        let snap = c.snapshot();
        put(&c, "k", &[Value::float(2, 9.0), Value::float(3, 3.0)], 2).unwrap();

        assert_eq!(snap.values(b"k"), vec![Value::float(1, 1.0), Value::float(2, 2.0)]);
        assert_eq!(
            c.values(b"k"),
            vec![Value::float(1, 1.0), Value::float(2, 9.0), Value::float(3, 3.0)]
        );
        assert_eq!(
            c.values_in_range(b"k", TimeRange::new(2, 3)),
            vec![Value::float(2, 9.0)]
        );
    }

    #[test]
    fn test_restore_snapshot_is_sequence_aware() {
        let c = cache(0);
        put(&c, "k", &[Value::float(1, 1.0)], 1).unwrap();
        let snap = c.snapshot();
        put(&c, "k", &[Value::float(1, 5.0)], 2).unwrap();
        c.restore_snapshot(&snap);

        assert_eq!(c.stats().snapshots, 0);
        assert_eq!(c.values(b"k"), vec![Value::float(1, 5.0)]);
        assert_eq!(c.active_size(), c.size());
    }

    #[test]
    fn test_delete_reaches_snapshots_and_logs() {
        let c = cache(0);
        put(&c, "k", &(0..10).map(|i| Value::integer(i, i)).collect::<Vec<_>>(), 1).unwrap();
        let snap = c.snapshot();
        put(&c, "k", &[Value::integer(20, 20)], 2).unwrap();

        let removed = c.delete_range(&[SeriesKey::from("k")], 5, 20);
        assert_eq!(removed, 6);
        assert_eq!(snap.values(b"k").len(), 5);
        assert_eq!(
            *snap.delete_log(),
            vec![DeleteRecord {
                keys: vec![SeriesKey::from("k")],
                min: 5,
                max: 20
            }]
        );
        assert_eq!(c.values(b"k").len(), 5);
    }

    #[test]
    fn test_concurrent_writers_to_disjoint_keys() {
        let c = Arc::new(cache(0));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let c = c.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        put(&c, &format!("series-{t}"), &[Value::integer(i, i)], 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8 {
            assert_eq!(c.values(format!("series-{t}").as_bytes()).len(), 500);
        }
    }
}
