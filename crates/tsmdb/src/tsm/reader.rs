//! TSM file reader and block iterator.
//!
//! Opening a file validates header, footer and index checksum and loads the
//! index fully into memory. Block payloads are read on demand and verified
//! against their own checksum; a corrupt block fails only the call that
//! touches it.

use crate::error::{Result, TsmError};
use crate::tsm::block::{self, RawBlock, BLOCK_HEADER_SIZE};
use crate::tsm::index::{BloomFilter, IndexEntry, KeyIndex, TsmIndex};
use crate::tsm::tombstone::{tombstone_path, Tombstone, Tombstones};
use crate::tsm::writer::{TsmFileMeta, TsmFooter, TsmHeader, FOOTER_SIZE, HEADER_SIZE};
use crate::tsm::{BlockType, SeriesKey, TimeRange, Timestamp, Value};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Opens and reads TSM files, providing:
/// - Key lookup through the Bloom filter and sorted index
/// - Whole-key and time-range reads with tombstones applied
/// - Restartable raw block iteration for compaction
pub struct TsmReader {
    path: PathBuf,
    file: Mutex<File>,
    header: TsmHeader,
    footer: TsmFooter,
    index: TsmIndex,
    bloom: BloomFilter,
    size: u64,
    tombstones: RwLock<Arc<Tombstones>>,
    tombstone_version: AtomicU64,
}

impl std::fmt::Debug for TsmReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsmReader")
            .field("path", &self.path)
            .field("level", &self.header.level)
            .field("keys", &self.index.key_count())
            .field("size", &self.size)
            .finish()
    }
}

impl TsmReader {
    /// Opens a TSM file for reading.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::InvalidMagic` / `UnsupportedVersion` for a foreign
    /// header, and `TsmError::CorruptFile` for any structural problem with the
    /// footer, index, Bloom filter or tombstone sidecar.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let corrupt = |reason: String| TsmError::CorruptFile {
            path: path.to_path_buf(),
            reason,
        };

        if size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(corrupt(format!("file too short: {size} bytes")));
        }

        let header = TsmHeader::read_from(&mut file)?;

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(size - FOOTER_SIZE as u64))?;
        file.read_exact(&mut footer_buf)?;
        let footer = TsmFooter::from_bytes(&footer_buf)?;

        let tail = u64::from(footer.index_size) + u64::from(footer.bloom_size) + FOOTER_SIZE as u64;
        if footer.index_offset < HEADER_SIZE as u64
            || footer.index_offset.checked_add(tail) != Some(size)
        {
            return Err(corrupt("footer offsets do not match file size".to_string()));
        }

        let mut meta_buf = vec![0u8; (footer.index_size as usize) + footer.bloom_size as usize];
        file.seek(SeekFrom::Start(footer.index_offset))?;
        file.read_exact(&mut meta_buf)?;
        let actual = crc32fast::hash(&meta_buf);
        if actual != footer.index_crc32 {
            return Err(corrupt(format!(
                "index checksum mismatch: expected {:#010x}, got {actual:#010x}",
                footer.index_crc32
            )));
        }

        let (index_bytes, bloom_bytes) = meta_buf.split_at(footer.index_size as usize);
        let index = TsmIndex::from_bytes(index_bytes).map_err(|e| corrupt(e.to_string()))?;
        let bloom = BloomFilter::from_bytes(bloom_bytes).map_err(|e| corrupt(e.to_string()))?;

        if index.key_count() != footer.key_count as usize {
            return Err(corrupt("key count disagrees with footer".to_string()));
        }
        Self::validate_index(&index, footer.index_offset).map_err(corrupt)?;

        let tombstones = Tombstones::load(&tombstone_path(path))?;

        debug!(
            path = %path.display(),
            keys = index.key_count(),
            blocks = index.block_count(),
            tombstones = tombstones.len(),
            "opened TSM file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            header,
            footer,
            index,
            bloom,
            size,
            tombstones: RwLock::new(Arc::new(tombstones)),
            tombstone_version: AtomicU64::new(0),
        })
    }

    fn validate_index(index: &TsmIndex, data_end: u64) -> std::result::Result<(), String> {
        let min_block = (BLOCK_HEADER_SIZE + 4) as u64;
        let mut prev_key: Option<&SeriesKey> = None;
        for k in index.keys() {
            if prev_key.is_some_and(|p| p >= &k.key) {
                return Err(format!("index keys out of order at {}", k.key));
            }
            prev_key = Some(&k.key);

            let mut prev_max: Option<Timestamp> = None;
            for e in &k.entries {
                if e.min_time > e.max_time || prev_max.is_some_and(|m| m >= e.min_time) {
                    return Err(format!("overlapping or inverted blocks for {}", k.key));
                }
                prev_max = Some(e.max_time);
                let end = e.offset.checked_add(u64::from(e.size));
                if e.offset < HEADER_SIZE as u64
                    || u64::from(e.size) < min_block
                    || end.map_or(true, |end| end > data_end)
                {
                    return Err(format!("block of {} outside data section", k.key));
                }
            }
        }
        Ok(())
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the compaction level.
    pub fn level(&self) -> u8 {
        self.header.level
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of values stored (before tombstones).
    pub fn point_count(&self) -> u64 {
        self.footer.point_count
    }

    /// Returns the in-memory index.
    pub fn index(&self) -> &TsmIndex {
        &self.index
    }

    /// Returns the number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.index.key_count()
    }

    /// Iterates keys in storage order.
    pub fn keys(&self) -> impl Iterator<Item = &SeriesKey> {
        self.index.keys().iter().map(|k| &k.key)
    }

    /// Smallest timestamp in the file.
    pub fn min_time(&self) -> Timestamp {
        self.index.min_time()
    }

    /// Largest timestamp in the file.
    pub fn max_time(&self) -> Timestamp {
        self.index.max_time()
    }

    /// Summary of the file as the writer reported it.
    pub fn meta(&self) -> TsmFileMeta {
        TsmFileMeta {
            path: self.path.clone(),
            level: self.header.level,
            key_count: self.index.key_count(),
            block_count: self.index.block_count(),
            point_count: self.footer.point_count,
            size: self.size,
            min_time: self.index.min_time(),
            max_time: self.index.max_time(),
        }
    }

    /// Looks a key up, consulting the Bloom filter first.
    pub fn key_index(&self, key: &[u8]) -> Option<&KeyIndex> {
        if !self.bloom.maybe_contains(key) {
            return None;
        }
        self.index.find(key)
    }

    /// Returns true if the file stores `key`.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.key_index(key).is_some()
    }

    /// Returns the payload kind of `key`.
    pub fn key_type(&self, key: &[u8]) -> Option<BlockType> {
        self.key_index(key).map(|k| k.block_type)
    }

    fn read_block_bytes(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; entry.size as usize];
        let mut file = self.file.lock().unwrap_or_else(|err| err.into_inner());
        file.seek(SeekFrom::Start(entry.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn decode_entry(&self, k: &KeyIndex, entry: &IndexEntry) -> Result<Vec<Value>> {
        let bytes = self.read_block_bytes(entry)?;
        let values = block::decode_block(&bytes, entry.offset)?;
        if let Some(v) = values.iter().find(|v| v.block_type() != k.block_type) {
            return Err(TsmError::CorruptBlock {
                offset: entry.offset,
                reason: format!("block holds {:?}, index says {:?}", v.block_type(), k.block_type),
            });
        }
        Ok(values)
    }

    fn read_where(
        &self,
        key: &[u8],
        block_filter: impl Fn(&IndexEntry) -> bool,
        value_filter: impl Fn(Timestamp) -> bool,
    ) -> Result<Vec<Value>> {
        let Some(k) = self.key_index(key) else {
            return Ok(Vec::new());
        };
        let tombstones = self.tombstones();

        let mut out = Vec::new();
        for entry in k.entries.iter().filter(|e| block_filter(e)) {
            let mut values = self.decode_entry(k, entry)?;
            values.retain(|v| value_filter(v.timestamp));
            out.extend(values);
        }
        tombstones.apply(key, &mut out);
        Ok(out)
    }

    /// Reads every live value of `key`.
    ///
    /// Returns an empty vector if the key is absent.
    pub fn read_all(&self, key: &[u8]) -> Result<Vec<Value>> {
        self.read_where(key, |_| true, |_| true)
    }

    /// Reads live values of `key` with timestamps in `range`.
    ///
    /// Only blocks overlapping the range are read.
    pub fn read_range(&self, key: &[u8], range: TimeRange) -> Result<Vec<Value>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        self.read_where(key, |e| e.overlaps(&range), |ts| range.contains(ts))
    }

    /// Returns a restartable iterator over every block in storage order.
    pub fn block_iter(&self) -> BlockIterator<'_> {
        BlockIterator {
            reader: self,
            key_pos: 0,
            entry_pos: 0,
        }
    }

    /// Reads every block and verifies its checksum.
    pub fn verify_block_checksums(&self) -> Result<()> {
        for block in self.block_iter() {
            block?.verify()?;
        }
        Ok(())
    }

    /// Current tombstone set.
    pub fn tombstones(&self) -> Arc<Tombstones> {
        self.tombstones
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Incremented every time tombstones are added.
    pub fn tombstone_version(&self) -> u64 {
        self.tombstone_version.load(Ordering::Acquire)
    }

    /// Records deletion of `[min, max]` (inclusive) for each of `keys` this file
    /// stores within that span.
    ///
    /// Returns true if any tombstone was written.
    pub fn delete_range(&self, keys: &[SeriesKey], min: Timestamp, max: Timestamp) -> Result<bool> {
        if min > max {
            return Ok(false);
        }
        let new: Vec<Tombstone> = keys
            .iter()
            .filter(|key| {
                self.key_index(key.as_bytes())
                    .is_some_and(|k| k.min_time() <= max && k.max_time() >= min)
            })
            .map(|key| Tombstone {
                key: key.clone(),
                min,
                max,
            })
            .collect();
        if new.is_empty() {
            return Ok(false);
        }

        let mut guard = self.tombstones.write().unwrap_or_else(|err| err.into_inner());
        let next = guard.with_added(&tombstone_path(&self.path), &new)?;
        *guard = Arc::new(next);
        self.tombstone_version.fetch_add(1, Ordering::AcqRel);
        debug!(path = %self.path.display(), keys = new.len(), min, max, "tombstoned TSM file");
        Ok(true)
    }

    /// Deletes the file and its tombstone sidecar from disk.
    pub fn remove_files(&self) -> Result<()> {
        for path in [self.path.clone(), tombstone_path(&self.path)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Lazy, restartable iteration over the raw blocks of one file.
///
/// Each item is one block in storage order (key order, then time order). A
/// block that fails its checksum yields `TsmError::CorruptBlock` and iteration
/// continues with the next block.
pub struct BlockIterator<'a> {
    reader: &'a TsmReader,
    key_pos: usize,
    entry_pos: usize,
}

impl<'a> BlockIterator<'a> {
    /// Rewinds to the first block.
    pub fn reset(&mut self) {
        self.key_pos = 0;
        self.entry_pos = 0;
    }

    /// Key of the block the next call to `next` will return.
    pub fn peek_key(&self) -> Option<&'a SeriesKey> {
        self.reader.index.keys().get(self.key_pos).map(|k| &k.key)
    }

    /// Skips the remaining blocks of the current key.
    pub fn skip_key(&mut self) {
        if self.key_pos < self.reader.index.keys().len() {
            self.key_pos += 1;
            self.entry_pos = 0;
        }
    }
}

impl Iterator for BlockIterator<'_> {
    type Item = Result<RawBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        let keys = self.reader.index.keys();
        let k = keys.get(self.key_pos)?;
        let entry = k.entries[self.entry_pos];

        self.entry_pos += 1;
        if self.entry_pos >= k.entries.len() {
            self.key_pos += 1;
            self.entry_pos = 0;
        }

        let result = self.reader.read_block_bytes(&entry).and_then(|bytes| {
            let header = block::verify_block(&bytes, entry.offset)?;
            if header.block_type != k.block_type {
                return Err(TsmError::CorruptBlock {
                    offset: entry.offset,
                    reason: "block type disagrees with index".to_string(),
                });
            }
            Ok(RawBlock {
                key: k.key.clone(),
                min_time: entry.min_time,
                max_time: entry.max_time,
                block_type: k.block_type,
                offset: entry.offset,
                bytes,
            })
        });
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsm::writer::TsmWriter;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, series: &[(&str, Vec<Value>)]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = TsmWriter::create(&path, 4).unwrap();
        for (key, values) in series {
            writer.write_series(&SeriesKey::from(*key), values).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn floats(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(|i| Value::float(i, i as f64 * 1.5)).collect()
    }

    #[test]
    fn test_read_all_and_range() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            dir.path(),
            "a.tsm",
            &[("cpu", floats(0..10)), ("mem", vec![Value::integer(5, -1)])],
        );
        let reader = TsmReader::open(&path).unwrap();

        assert_eq!(reader.key_count(), 2);
        assert_eq!(reader.read_all(b"cpu").unwrap(), floats(0..10));
        assert_eq!(reader.read_range(b"cpu", TimeRange::new(3, 6)).unwrap(), floats(3..6));
        assert_eq!(reader.key_type(b"mem"), Some(BlockType::Integer));
        assert!(reader.read_all(b"disk").unwrap().is_empty());
        assert!(!reader.contains(b"disk"));
        assert_eq!((reader.min_time(), reader.max_time()), (0, 9));

        let meta = reader.meta();
        assert_eq!((meta.key_count, meta.point_count, meta.level), (2, 11, 1));
        assert_eq!(meta.size, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_value_at_max_timestamp_readable() {
        let dir = TempDir::new().unwrap();
        let values = vec![Value::boolean(0, true), Value::boolean(i64::MAX, false)];
        let path = write_file(dir.path(), "a.tsm", &[("k", values.clone())]);
        let reader = TsmReader::open(&path).unwrap();
        assert_eq!(reader.read_all(b"k").unwrap(), values);
    }

    #[test]
    fn test_block_iterator_is_restartable() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "a.tsm", &[("a", floats(0..9)), ("b", floats(0..2))]);
        let reader = TsmReader::open(&path).unwrap();

        let mut iter = reader.block_iter();
        let first: Vec<_> = iter.by_ref().map(|b| b.unwrap()).collect();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].key, SeriesKey::from("a"));
        assert_eq!((first[2].min_time, first[2].max_time), (8, 8));
        assert_eq!(first[3].key, SeriesKey::from("b"));

        iter.reset();
        let second: Vec<_> = iter.map(|b| b.unwrap().offset).collect();
        assert_eq!(second, first.iter().map(|b| b.offset).collect::<Vec<_>>());
    }

    #[test]
    fn test_corrupt_block_isolated() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "a.tsm", &[("a", floats(0..4)), ("b", floats(0..4))]);
        let reader = TsmReader::open(&path).unwrap();
        let target = reader.key_index(b"a").unwrap().entries[0];
        drop(reader);

        let mut bytes = fs::read(&path).unwrap();
        bytes[target.offset as usize + BLOCK_HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let reader = TsmReader::open(&path).unwrap();
        assert!(matches!(reader.read_all(b"a"), Err(TsmError::CorruptBlock { .. })));
        assert_eq!(reader.read_all(b"b").unwrap(), floats(0..4));

        let results: Vec<_> = reader.block_iter().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
        assert!(reader.verify_block_checksums().is_err());
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "a.tsm", &[("a", floats(0..4))]);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(TsmReader::open(&path).is_err());
    }

    #[test]
    fn test_delete_range_persists_tombstones() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "a.tsm", &[("a", floats(0..10)), ("b", floats(0..3))]);
        let reader = TsmReader::open(&path).unwrap();

        let keys = vec![SeriesKey::from("a"), SeriesKey::from("zzz")];
        assert!(reader.delete_range(&keys, 2, 4).unwrap());
        assert_eq!(reader.tombstone_version(), 1);
        assert!(!reader.delete_range(&keys, 100, 200).unwrap());

        let expected: Vec<Value> = floats(0..10).into_iter().filter(|v| !(2..=4).contains(&v.timestamp)).collect();
        assert_eq!(reader.read_all(b"a").unwrap(), expected);
        drop(reader);

        let reopened = TsmReader::open(&path).unwrap();
        assert_eq!(reopened.read_all(b"a").unwrap(), expected);
        assert_eq!(reopened.read_all(b"b").unwrap(), floats(0..3));

        reopened.remove_files().unwrap();
        assert!(!path.exists());
        assert!(!tombstone_path(&path).exists());
    }
}
