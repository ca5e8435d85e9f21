//! The storage engine facade.
//!
//! # Write path
//!
//! ```text
//! write ──► type check ──► reserve ──► [gate: shared] WAL append ──► cache apply ──► seq
//!
//! flush ──► [gate: exclusive] WAL rotate + cache snapshot
//!       ──► write TSM file ──► apply snapshot delete log ──► install
//!       ──► release snapshot ──► remove closed WAL segments
//! ```
//!
//! Reads capture the cache first and the file set second, then merge with the
//! cache winning, so a concurrent flush can never hide a value.

use crate::cache::entry::merge_tagged;
use crate::cache::{Cache, CacheLoader, CacheStats, Snapshot};
use crate::config::EngineConfig;
use crate::error::{Result, TsmError};
use crate::filestore::{discard_file, FileId, FileStore, FileStoreStats, TsmFile};
use crate::lifecycle::compaction::{compact_all, CompactionPlanner, CompactionSummary, Compactor};
use crate::lifecycle::scheduler::{CompactionTask, FlushTask, Scheduler};
use crate::tsm::{BlockType, SeriesKey, TimeRange, Timestamp, TsmFileMeta, TsmWriter, Value};
use crate::wal::{list_segments, Wal, WalEntry};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Subdirectory holding WAL segments.
pub const WAL_DIR: &str = "wal";

/// Subdirectory holding TSM files.
pub const TSM_DIR: &str = "tsm";

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Replaying the WAL; not yet accepting requests.
    Loading,
    /// Accepting reads and writes.
    Serving,
    /// `close` is draining in-flight work.
    Closing,
    /// Closed; every request fails with `EngineClosed`.
    Closed,
}

/// Engine-wide statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Current state.
    pub state: EngineState,
    /// Last assigned WAL sequence number.
    pub last_sequence: u64,
    /// WAL segments on disk, the active one included.
    pub wal_segments: usize,
    /// Cache usage.
    pub cache: CacheStats,
    /// Live TSM files.
    pub files: FileStoreStats,
}

/// A single-node time-series storage engine.
///
/// All methods take `&self`; share the engine across threads with `Arc`.
pub struct Engine {
    dir: PathBuf,
    config: EngineConfig,
    state: RwLock<EngineState>,
    wal: Mutex<Wal>,
    cache: Cache,
    store: Arc<FileStore>,
    planner: CompactionPlanner,
    compactor: Compactor,
    /// Shared by writers across WAL append and cache apply; exclusive while
    /// rotating the WAL and snapshotting the cache.
    write_gate: RwLock<()>,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    cancel: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.dir)
            .field("state", &self.state())
            .field("cache", &self.cache)
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Engine {
    /// Opens the engine rooted at `dir`, replaying any WAL left behind.
    ///
    /// # Errors
    ///
    /// Fails if a TSM file is corrupt, if a WAL segment is corrupt anywhere
    /// but its tail, or on I/O errors.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let started = Instant::now();
        fs::create_dir_all(&dir)?;
        let wal_dir = dir.join(WAL_DIR);

        let store = Arc::new(FileStore::open(dir.join(TSM_DIR))?);
        let cache = Cache::new(&config.cache);
        let summary = CacheLoader::new(list_segments(&wal_dir)?).load(&cache)?;

        // A crash may have landed between a delete's WAL append and its
        // tombstone writes.
        for delete in &summary.deletes {
            store.delete_range(&delete.keys, delete.min, delete.max)?;
        }

        let wal = Wal::new(&wal_dir, config.wal.clone(), summary.max_sequence)?;
        let planner = CompactionPlanner::new(config.compaction.clone());
        let compactor = Compactor::new(
            store.clone(),
            config.compaction.clone(),
            config.tsm.max_points_per_block,
        );

        let engine = Self {
            dir,
            state: RwLock::new(EngineState::Loading),
            wal: Mutex::new(wal),
            cache,
            store,
            planner,
            compactor,
            write_gate: RwLock::new(()),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            cancel: AtomicBool::new(false),
            config,
        };
        *write(&engine.state) = EngineState::Serving;

        info!(
            dir = %engine.dir.display(),
            files = engine.store.files().len(),
            replayed = summary.entries,
            last_sequence = summary.max_sequence,
            cache_size = engine.cache.size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine opened"
        );
        Ok(engine)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *read(&self.state)
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_serving(&self) -> Result<()> {
        match self.state() {
            EngineState::Serving => Ok(()),
            EngineState::Loading => Err(TsmError::EngineNotReady),
            EngineState::Closing | EngineState::Closed => Err(TsmError::EngineClosed),
        }
    }

    /// Writes `values` to one series. See [`Engine::write_batch`].
    pub fn write(&self, key: impl Into<SeriesKey>, values: Vec<Value>) -> Result<u64> {
        self.write_batch(vec![(key.into(), values)])
    }

    /// Durably writes a batch and makes it visible to reads.
    ///
    /// The batch is one WAL entry: after a crash either all of it or none of
    /// it is recovered. Returns the entry's sequence number, or the last
    /// assigned one if the batch holds no values.
    ///
    /// # Errors
    ///
    /// - `TypeMismatch` if a series' values disagree with each other or with
    ///   data already stored for it
    /// - `CapacityExceeded` if the cache cannot admit the batch
    /// - `DurabilityFailure` if the WAL append failed; nothing was written
    /// - `KeyTooLong` or `EntryTooLarge` if the batch could not be logged;
    ///   nothing was written
    pub fn write_batch(&self, batch: Vec<(SeriesKey, Vec<Value>)>) -> Result<u64> {
        let batch: Vec<_> = batch.into_iter().filter(|(_, v)| !v.is_empty()).collect();
        if batch.is_empty() {
            self.check_serving()?;
            return Ok(lock(&self.wal).last_sequence());
        }
        batch.iter().try_for_each(|(key, _)| key.check_len())?;
        self.check_types(&batch)?;

        let bytes: u64 = batch.iter().map(|(_, v)| Cache::charge_for(v)).sum();
        self.cache.reserve(bytes)?;

        let gate = read(&self.write_gate);
        if let Err(e) = self.check_serving() {
            self.cache.release(bytes);
            return Err(e);
        }

        let entry = WalEntry::Write { values: batch };
        let sequence = match lock(&self.wal).append(&entry) {
            Ok(sequence) => sequence,
            Err(e) => {
                self.cache.release(bytes);
                return Err(e);
            }
        };

        let mut applied = 0u64;
        for (key, values) in entry.series() {
            if let Err(e) = self.cache.write(key, values, sequence) {
                // A concurrent write claimed the series with another type
                // after the pre-check; replay skips the same values.
                self.cache.release(bytes - applied);
                warn!(key = %key, sequence, error = %e, "write lost a type race");
                return Err(e);
            }
            applied += Cache::charge_for(values);
        }
        drop(gate);
        Ok(sequence)
    }

    fn check_types(&self, batch: &[(SeriesKey, Vec<Value>)]) -> Result<()> {
        let mut seen: HashMap<&SeriesKey, BlockType> = HashMap::new();
        for (key, values) in batch {
            self.cache.check_type(key, values)?;
            let actual = values[0].block_type();
            let expected = seen
                .get(key)
                .copied()
                .or_else(|| self.cache.key_type(key.as_bytes()))
                .or_else(|| self.store.key_type(key.as_bytes()));
            if let Some(expected) = expected {
                if let Some(bad) = values.iter().find(|v| v.block_type() != expected) {
                    return Err(TsmError::TypeMismatch {
                        key: key.to_string_lossy(),
                        expected,
                        actual: bad.block_type(),
                    });
                }
            }
            seen.insert(key, expected.unwrap_or(actual));
        }
        Ok(())
    }

    /// Deletes values of `keys` with `min <= t <= max` from the cache and
    /// every file.
    ///
    /// Durable once this returns: the delete is logged first and re-applied
    /// on replay.
    pub fn delete_range(&self, keys: &[SeriesKey], min: Timestamp, max: Timestamp) -> Result<()> {
        if keys.is_empty() || min > max {
            self.check_serving()?;
            return Ok(());
        }
        keys.iter().try_for_each(SeriesKey::check_len)?;
        let _gate = read(&self.write_gate);
        self.check_serving()?;

        let sequence = lock(&self.wal).append(&WalEntry::delete_range(keys.to_vec(), min, max))?;
        let removed = self.cache.delete_range(keys, min, max);
        let files = self.store.delete_range(keys, min, max)?;
        debug!(sequence, keys = keys.len(), min, max, removed, files, "deleted range");
        Ok(())
    }

    /// Values of `key` with `min <= t < max`, sorted by timestamp.
    pub fn read_range(&self, key: &[u8], min: Timestamp, max: Timestamp) -> Result<Vec<Value>> {
        if self.state() == EngineState::Closed {
            return Err(TsmError::EngineClosed);
        }
        let range = TimeRange::new(min, max);
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let cached = self.cache.values_in_range(key, range);
        let stored = self.store.read_range(key, range)?;
        if cached.is_empty() {
            return Ok(stored);
        }
        if stored.is_empty() {
            return Ok(cached);
        }
        Ok(merge_tagged(vec![
            stored.into_iter().map(|v| (v, 0)).collect(),
            cached.into_iter().map(|v| (v, 1)).collect(),
        ]))
    }

    /// Payload kind of `key`, if stored anywhere.
    pub fn key_type(&self, key: &[u8]) -> Option<BlockType> {
        self.cache
            .key_type(key)
            .or_else(|| self.store.key_type(key))
    }

    /// Returns true when the active cache generation is due for a flush:
    /// it reached the snapshot size or half the memory ceiling, or it holds
    /// data older than the snapshot age.
    pub fn should_flush(&self) -> bool {
        let cache = &self.config.cache;
        let active = self.cache.active_size();
        if cache.snapshot_size > 0 && active >= cache.snapshot_size {
            return true;
        }
        if cache.max_size > 0 && active >= cache.max_size / 2 {
            return true;
        }
        self.cache.last_snapshot_age() >= cache.snapshot_age && !self.cache.is_active_empty()
    }

    /// Writes the active cache generation to a new TSM file.
    ///
    /// On failure the snapshot is merged back into the cache and its WAL
    /// segments are kept, so nothing is lost.
    pub fn flush(&self) -> Result<()> {
        let _flush = lock(&self.flush_lock);
        let started = Instant::now();

        let (snapshot, closed_segment) = {
            let _gate = write(&self.write_gate);
            self.check_serving()?;
            let closed = lock(&self.wal).rotate()?;
            (self.cache.snapshot(), closed)
        };

        if snapshot.is_empty() {
            self.cache.release_snapshot(&snapshot);
            lock(&self.wal).remove_segments(closed_segment)?;
            return Ok(());
        }

        let meta = match self.write_snapshot(&snapshot) {
            Ok(meta) => meta,
            Err(e) => {
                self.cache.restore_snapshot(&snapshot);
                warn!(snapshot = snapshot.id(), error = %e, "flush failed, snapshot restored");
                return Err(e);
            }
        };
        self.cache.release_snapshot(&snapshot);
        let removed = lock(&self.wal).remove_segments(closed_segment)?;

        info!(
            snapshot = snapshot.id(),
            file = ?meta.as_ref().map(|m| m.path.display().to_string()),
            keys = meta.as_ref().map_or(0, |m| m.key_count),
            points = meta.as_ref().map_or(0, |m| m.point_count),
            wal_segments_removed = removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flushed cache snapshot"
        );
        Ok(())
    }

    /// Writes and installs `snapshot`. Returns `None` if deletes emptied it.
    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<Option<TsmFileMeta>> {
        let id = FileId::new(self.store.next_generation(), 1);
        let path = self.store.file_path(id);
        let mut writer = TsmWriter::create(&path, self.config.tsm.max_points_per_block)?;
        writer.set_level(1);
        for key in snapshot.keys() {
            let values = snapshot.values(key.as_bytes());
            if !values.is_empty() {
                writer.write_series(&key, &values)?;
            }
        }
        if writer.key_count() == 0 {
            writer.abort();
            return Ok(None);
        }
        let meta = writer.finish()?;

        // Deletes racing this flush wait on the log while the file is
        // installed, then reach it through the file store.
        let log = snapshot.delete_log();
        let installed = TsmFile::open(&meta.path).and_then(|file| {
            for delete in log.iter() {
                file.reader().delete_range(&delete.keys, delete.min, delete.max)?;
            }
            self.store.install(Arc::new(file))
        });
        drop(log);
        if let Err(e) = installed {
            discard_file(&meta.path);
            return Err(e);
        }
        Ok(Some(meta))
    }

    /// Runs compactions until the planner finds nothing to do.
    ///
    /// Groups whose inputs gain tombstones while merging are abandoned and
    /// counted in [`CompactionSummary::aborted`]; a later pass retries them.
    pub fn compact(&self) -> Result<CompactionSummary> {
        let _compaction = lock(&self.compaction_lock);
        self.check_serving()?;
        compact_all(&self.planner, &self.compactor, &self.store, &self.cancel)
    }

    /// Stops the engine.
    ///
    /// New requests fail with `EngineClosed`. In-flight writes and any
    /// running flush complete; a running compaction is cancelled. Unflushed
    /// data stays in the WAL and is replayed by the next [`Engine::open`].
    pub fn close(&self) -> Result<()> {
        {
            let mut state = write(&self.state);
            match *state {
                EngineState::Closing | EngineState::Closed => return Ok(()),
                _ => *state = EngineState::Closing,
            }
        }
        drop(write(&self.write_gate));
        drop(lock(&self.flush_lock));
        self.cancel.store(true, Ordering::Release);
        drop(lock(&self.compaction_lock));

        let closed = lock(&self.wal).close();
        *write(&self.state) = EngineState::Closed;
        info!(dir = %self.dir.display(), "engine closed");
        closed
    }

    /// Current statistics.
    pub fn stats(&self) -> EngineStats {
        let wal = lock(&self.wal);
        EngineStats {
            state: self.state(),
            last_sequence: wal.last_sequence(),
            wal_segments: wal.list_segments().map(|s| s.len()).unwrap_or(0),
            cache: self.cache.stats(),
            files: self.store.stats(),
        }
    }

    /// Starts the periodic flush and compaction tasks.
    ///
    /// Must be called from within a tokio runtime. Shut the returned
    /// scheduler down before closing the engine.
    pub fn spawn_background(self: &Arc<Self>) -> Scheduler {
        let scheduler = Scheduler::new();
        let intervals = &self.config.scheduler;
        scheduler
            .register(Arc::new(FlushTask::new(self.clone(), intervals.flush_interval)))
            .register(Arc::new(CompactionTask::new(
                self.clone(),
                intervals.compaction_interval,
            )));
        scheduler
    }
}
