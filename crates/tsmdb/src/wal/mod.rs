//! Write-Ahead Log (WAL) for tsmdb.
//!
//! Every write and delete is appended here and synced before it is applied to
//! the cache, so an acknowledged operation survives a crash.
//!
//! # Architecture
//!
//! ```text
//! Client → WAL append (fsync) → Cache apply → Ack
//!                 │
//!          snapshot: rotate → flush cache → install TSM file → remove closed segments
//! ```
//!
//! # Features
//!
//! - **CRC32 Checksums**: each record is framed as `[len u32][crc32 u32][payload]`
//! - **Segment Rotation**: on size threshold and on every cache snapshot
//! - **Crash Recovery**: segments are replayed by [`crate::cache::CacheLoader`];
//!   a partial record at the tail of the last segment marks the replay boundary
//! - **Truncation**: closed segments are removed once their data is in a TSM file
//!
//! # Example
//!
//! ```rust,ignore
//! use tsmdb::wal::{Wal, WalConfig, WalEntry};
//!
//! let mut wal = Wal::new("/path/to/wal", WalConfig::default(), 0)?;
//! let seq = wal.append(&WalEntry::write(key, values))?;
//!
//! // Before flushing the cache
//! let closed = wal.rotate()?;
//! // After the flushed file is installed
//! wal.remove_segments(closed)?;
//! ```

mod entry;
mod segment;

pub use entry::WalEntry;
pub use segment::{list_segments, SegmentInfo, SegmentReader};

use crate::error::{Result, TsmError};
use segment::{segment_path, SegmentHeader, MAX_RECORD_SIZE, RECORD_HEADER_SIZE};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default maximum segment size (64 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Sync mode for WAL durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each append (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for WAL behavior.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Size at which the active segment is rotated before the next append.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl WalConfig {
    /// Creates a new WAL configuration with custom settings.
    pub fn new(segment_size: usize, sync_mode: SyncMode) -> Self {
        Self {
            segment_size,
            sync_mode,
        }
    }

    /// Sets the segment size.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

/// Write-Ahead Log.
///
/// Not internally synchronized; the engine serializes appends with a mutex.
pub struct Wal {
    /// Directory containing WAL segments.
    log_dir: PathBuf,
    /// Active segment file.
    current_segment: File,
    /// Active segment ID.
    current_segment_id: u64,
    /// Active segment size in bytes.
    current_segment_size: u64,
    /// Next sequence number to assign.
    next_sequence: u64,
    /// WAL configuration.
    config: WalConfig,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
    closed: bool,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("log_dir", &self.log_dir)
            .field("current_segment_id", &self.current_segment_id)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

impl Wal {
    /// Opens a WAL in `log_dir`, starting a fresh active segment after any
    /// existing ones.
    ///
    /// Existing segments are left untouched; replay them with
    /// [`crate::cache::CacheLoader`] before calling this. Sequence numbers
    /// continue from `last_sequence + 1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or accessed.
    pub fn new(log_dir: impl AsRef<Path>, config: WalConfig, last_sequence: u64) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;

        let next_segment_id = list_segments(&log_dir)?
            .last()
            .map_or(0, |s| s.id + 1);
        let current_segment = Self::create_segment(&log_dir, next_segment_id)?;

        debug!(
            dir = %log_dir.display(),
            segment = next_segment_id,
            next_sequence = last_sequence + 1,
            "opened WAL"
        );

        Ok(Self {
            log_dir,
            current_segment,
            current_segment_id: next_segment_id,
            current_segment_size: SegmentHeader::SIZE as u64,
            next_sequence: last_sequence + 1,
            config,
            poisoned: false,
            closed: false,
        })
    }

    fn create_segment(log_dir: &Path, segment_id: u64) -> Result<File> {
        let path = segment_path(log_dir, segment_id);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        SegmentHeader::new(segment_id).write_to(&mut file)?;
        file.sync_all()?;
        File::open(log_dir)?.sync_all()?;
        Ok(file)
    }

    /// Appends an entry and makes it durable per the configured [`SyncMode`].
    ///
    /// Returns the sequence number assigned to the entry.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::DurabilityFailure` if the write or sync fails; the
    /// entry is then not part of the log. Returns `TsmError::KeyTooLong` or
    /// `TsmError::EntryTooLarge` before writing anything if replay could not
    /// read the entry back.
    pub fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        if self.closed {
            return Err(TsmError::EngineClosed);
        }
        self.check_poisoned()?;
        entry.check_keys()?;

        let sequence = self.next_sequence;
        let payload = entry.encode(sequence);
        if payload.len() > MAX_RECORD_SIZE {
            return Err(TsmError::EntryTooLarge {
                size: payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        record.extend_from_slice(&payload);

        let header_only = self.current_segment_size == SegmentHeader::SIZE as u64;
        if !header_only
            && self.current_segment_size + record.len() as u64 > self.config.segment_size as u64
        {
            self.rotate().map_err(Self::durability)?;
        }

        if let Err(e) = self.write_record(&record) {
            self.rollback();
            return Err(TsmError::DurabilityFailure(e));
        }

        self.current_segment_size += record.len() as u64;
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// A segment with an unremovable partial record must stay the last one so
    /// replay treats the record as the tail.
    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(TsmError::DurabilityFailure(std::io::Error::other(
                "WAL is poisoned by an earlier failed append",
            )));
        }
        Ok(())
    }

    fn durability(err: TsmError) -> TsmError {
        match err {
            TsmError::IoError(e) => TsmError::DurabilityFailure(e),
            other => other,
        }
    }

    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.current_segment.write_all(record)?;
        match self.config.sync_mode {
            SyncMode::Fsync => self.current_segment.sync_all(),
            SyncMode::Fdatasync => self.current_segment.sync_data(),
            SyncMode::None => Ok(()),
        }
    }

    /// Cuts a partially written record off the active segment.
    fn rollback(&mut self) {
        let len = self.current_segment_size;
        let restored = self
            .current_segment
            .set_len(len)
            .and_then(|()| self.current_segment.seek(SeekFrom::Start(len)).map(|_| ()));
        if let Err(e) = restored {
            warn!(segment = self.current_segment_id, error = %e, "failed to roll back WAL append");
            self.poisoned = true;
        }
    }

    /// Closes the active segment and opens the next one.
    ///
    /// Returns the id of the closed segment. Every entry appended before this
    /// call lives in a segment with id <= the returned id.
    pub fn rotate(&mut self) -> Result<u64> {
        self.check_poisoned()?;
        self.current_segment.sync_all()?;
        let closed = self.current_segment_id;

        let next = closed + 1;
        self.current_segment = Self::create_segment(&self.log_dir, next)?;
        self.current_segment_id = next;
        self.current_segment_size = SegmentHeader::SIZE as u64;

        debug!(closed, segment = next, "rotated WAL segment");
        Ok(closed)
    }

    /// Lists the segments in the WAL directory, active one included.
    pub fn list_segments(&self) -> Result<Vec<SegmentInfo>> {
        list_segments(&self.log_dir)
    }

    /// Deletes closed segments whose id is <= `up_to_id`.
    ///
    /// The active segment is never removed. Returns the number of segments
    /// deleted.
    pub fn remove_segments(&mut self, up_to_id: u64) -> Result<usize> {
        let mut removed = 0;
        for segment in self.list_segments()? {
            if segment.id > up_to_id || segment.id >= self.current_segment_id {
                continue;
            }
            fs::remove_file(&segment.path)?;
            removed += 1;
            debug!(segment = segment.id, path = %segment.path.display(), "removed WAL segment");
        }
        if removed > 0 {
            File::open(&self.log_dir)?.sync_all()?;
        }
        Ok(removed)
    }

    /// Forces the active segment to disk regardless of [`SyncMode`].
    pub fn sync(&mut self) -> Result<()> {
        self.current_segment
            .sync_all()
            .map_err(TsmError::DurabilityFailure)
    }

    /// Syncs and closes the log; further appends fail with `EngineClosed`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.sync()?;
        self.closed = true;
        debug!(segment = self.current_segment_id, "closed WAL");
        Ok(())
    }

    /// Returns the next sequence number to be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Returns the last sequence number assigned.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Returns the active segment ID.
    pub fn current_segment_id(&self) -> u64 {
        self.current_segment_id
    }

    /// Returns the log directory path.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.current_segment.sync_all() {
                warn!("Failed to sync WAL on drop: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsm::{SeriesKey, Value};
    use tempfile::TempDir;

    fn create_test_wal() -> (TempDir, Wal) {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            segment_size: 1024,        // Small segments for testing
            sync_mode: SyncMode::None, // Fast for testing
        };
        let wal = Wal::new(temp_dir.path(), config, 0).unwrap();
        (temp_dir, wal)
    }

    fn write(key: &str, ts: i64, v: f64) -> WalEntry {
        WalEntry::write(SeriesKey::from(key), vec![Value::float(ts, v)])
    }

    fn read_all(path: &Path) -> Vec<(u64, WalEntry)> {
        let mut reader = SegmentReader::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(e) = reader.next_entry().unwrap() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_wal_append_assigns_sequences() {
        let (temp_dir, mut wal) = create_test_wal();

        assert_eq!(wal.append(&write("cpu", 1, 1.0)).unwrap(), 1);
        assert_eq!(wal.append(&write("cpu", 2, 2.0)).unwrap(), 2);
        assert_eq!(wal.next_sequence(), 3);

        let segments = list_segments(temp_dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        let entries = read_all(&segments[0].path);
        assert_eq!(entries, vec![(1, write("cpu", 1, 1.0)), (2, write("cpu", 2, 2.0))]);
    }

    #[test]
    fn test_wal_rotates_on_size() {
        let (temp_dir, mut wal) = create_test_wal();
        for i in 0..100 {
            wal.append(&write("some.long.series.key", i, i as f64)).unwrap();
        }

        let segments = list_segments(temp_dir.path()).unwrap();
        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.size <= 1024));

        let replayed: Vec<u64> = segments
            .iter()
            .flat_map(|s| read_all(&s.path))
            .map(|(seq, _)| seq)
            .collect();
        assert_eq!(replayed, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn test_oversized_record_goes_to_fresh_segment() {
        let (temp_dir, mut wal) = create_test_wal();
        let big: Vec<Value> = (0..200).map(|i| Value::integer(i, i)).collect();
        wal.append(&WalEntry::write(SeriesKey::from("k"), big)).unwrap();
        wal.append(&write("k", 500, 0.0)).unwrap();
        assert_eq!(list_segments(temp_dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_rotate_and_remove_segments() {
        let (temp_dir, mut wal) = create_test_wal();
        wal.append(&write("a", 1, 1.0)).unwrap();
        let closed = wal.rotate().unwrap();
        assert_eq!(closed, 0);
        wal.append(&write("a", 2, 2.0)).unwrap();

        assert_eq!(wal.remove_segments(closed).unwrap(), 1);
        let segments = list_segments(temp_dir.path()).unwrap();
        assert_eq!(segments.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);

        // The active segment survives any bound.
        assert_eq!(wal.remove_segments(u64::MAX).unwrap(), 0);
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::default().with_sync_mode(SyncMode::None);
        {
            let mut wal = Wal::new(temp_dir.path(), config.clone(), 0).unwrap();
            wal.append(&write("a", 1, 1.0)).unwrap();
            wal.close().unwrap();
        }
        let mut wal = Wal::new(temp_dir.path(), config, 1).unwrap();
        assert_eq!(wal.current_segment_id(), 1);
        assert_eq!(wal.append(&write("a", 2, 2.0)).unwrap(), 2);
    }

    #[test]
    fn test_unreadable_entries_are_refused_before_writing() {
        let (temp_dir, mut wal) = create_test_wal();
        let path = segment_path(temp_dir.path(), wal.current_segment_id());
        let before = fs::metadata(&path).unwrap().len();

        let long_key = SeriesKey::new(vec![b'k'; crate::tsm::MAX_KEY_LEN + 1]);
        let entry = WalEntry::write(long_key.clone(), vec![Value::float(1, 1.0)]);
        assert!(matches!(wal.append(&entry), Err(TsmError::KeyTooLong { .. })));
        let entry = WalEntry::delete_range(vec![long_key], 0, 1);
        assert!(matches!(wal.append(&entry), Err(TsmError::KeyTooLong { .. })));

        let huge = Value::string(1, "x".repeat(MAX_RECORD_SIZE));
        let entry = WalEntry::write(SeriesKey::from("s"), vec![huge]);
        assert!(matches!(wal.append(&entry), Err(TsmError::EntryTooLarge { .. })));

        assert_eq!(fs::metadata(&path).unwrap().len(), before);
        assert_eq!(wal.append(&write("a", 1, 1.0)).unwrap(), 1);

        // The longest frameable key replays intact.
        let max_key = SeriesKey::new(vec![b'm'; crate::tsm::MAX_KEY_LEN]);
        wal.append(&WalEntry::write(max_key.clone(), vec![Value::float(2, 2.0)]))
            .unwrap();
        wal.close().unwrap();
        let last = list_segments(temp_dir.path()).unwrap().pop().unwrap();
        let mut reader = SegmentReader::open(&last.path).unwrap();
        let (sequence, entry) = reader.next_entry().unwrap().unwrap();
        assert_eq!(sequence, 2);
        assert_eq!(entry.series()[0].0, max_key);
    }

    #[test]
    fn test_append_after_close_fails() {
        let (_temp_dir, mut wal) = create_test_wal();
        wal.close().unwrap();
        assert!(matches!(wal.append(&write("a", 1, 1.0)), Err(TsmError::EngineClosed)));
    }

    #[test]
    fn test_reader_distinguishes_truncation_from_corruption() {
        let (temp_dir, mut wal) = create_test_wal();
        wal.append(&write("a", 1, 1.0)).unwrap();
        wal.append(&write("a", 2, 2.0)).unwrap();
        wal.close().unwrap();
        let path = list_segments(temp_dir.path()).unwrap()[0].path.clone();
        let bytes = fs::read(&path).unwrap();

        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(reader.next_entry().unwrap().is_some());
        let good = reader.offset();
        assert!(matches!(
            reader.next_entry(),
            Err(TsmError::TruncatedSegment { offset, .. }) if offset == good
        ));

        // A bad final record is still the tail.
        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xFF;
        fs::write(&path, flipped).unwrap();
        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(reader.next_entry().unwrap().is_some());
        assert!(matches!(reader.next_entry(), Err(TsmError::TruncatedSegment { .. })));

        // A bad record followed by a good one is not.
        let mut flipped = bytes.clone();
        flipped[SegmentHeader::SIZE + RECORD_HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&path, flipped).unwrap();
        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(matches!(reader.next_entry(), Err(TsmError::CorruptSegment { .. })));
    }
}
