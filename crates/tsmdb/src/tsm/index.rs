//! Per-file block index and key Bloom filter.
//!
//! The index lists every block of every key in storage order. It is loaded
//! fully into memory when a file is opened; lookups go through the Bloom
//! filter first and then a binary search over the sorted keys.

use crate::error::Result;
use crate::tsm::{BlockType, SeriesKey, TimeRange, Timestamp};
use std::io::{self, Read, Write};

/// Default number of hash functions for the Bloom filter.
const BLOOM_FILTER_DEFAULT_HASH_COUNT: u8 = 3;

/// Upper bound on the hash count accepted from disk.
const BLOOM_FILTER_MAX_HASH_COUNT: u8 = 16;

/// Serialized size of one [`IndexEntry`].
pub const INDEX_ENTRY_SIZE: usize = 28;

/// Location and time span of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Smallest timestamp in the block.
    pub min_time: Timestamp,
    /// Largest timestamp in the block.
    pub max_time: Timestamp,
    /// Offset of the block from file start.
    pub offset: u64,
    /// Size of the block in bytes.
    pub size: u32,
}

impl IndexEntry {
    /// Returns true if the block may hold timestamps in `range`.
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        range.overlaps(self.min_time, self.max_time)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.min_time.to_le_bytes())?;
        writer.write_all(&self.max_time.to_le_bytes())?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        reader.read_exact(&mut buf)?;
        let mut b8 = [0u8; 8];
        let mut b4 = [0u8; 4];

        b8.copy_from_slice(&buf[0..8]);
        let min_time = i64::from_le_bytes(b8);
        b8.copy_from_slice(&buf[8..16]);
        let max_time = i64::from_le_bytes(b8);
        b8.copy_from_slice(&buf[16..24]);
        let offset = u64::from_le_bytes(b8);
        b4.copy_from_slice(&buf[24..28]);
        let size = u32::from_le_bytes(b4);

        Ok(Self {
            min_time,
            max_time,
            offset,
            size,
        })
    }
}

/// All blocks of one key, ordered by time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIndex {
    /// Series key.
    pub key: SeriesKey,
    /// Payload kind shared by every block of the key.
    pub block_type: BlockType,
    /// Blocks sorted by `min_time`, non-overlapping.
    pub entries: Vec<IndexEntry>,
}

impl KeyIndex {
    /// Smallest timestamp across the key's blocks.
    pub fn min_time(&self) -> Timestamp {
        self.entries.first().map_or(Timestamp::MAX, |e| e.min_time)
    }

    /// Largest timestamp across the key's blocks.
    pub fn max_time(&self) -> Timestamp {
        self.entries.last().map_or(Timestamp::MIN, |e| e.max_time)
    }
}

/// Bloom filter for fast key existence checks.
///
/// Uses xxhash64 with k hash functions using different seeds:
/// `h_i(x) = xxhash64(x, seed=i) % size_bits`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hash_count: u8,
}

impl BloomFilter {
    /// Creates a new Bloom filter sized for the given number of items.
    ///
    /// Uses approximately 10 bits per item for ~1% false positive rate.
    pub fn new(expected_items: usize) -> Self {
        let num_bits = (expected_items * 10).max(64);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            hash_count: BLOOM_FILTER_DEFAULT_HASH_COUNT,
        }
    }

    fn positions<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = (usize, u64)> + 'a {
        let num_bits = (self.bits.len() * 64) as u64;
        (0..self.hash_count).map(move |seed| {
            let bit_idx = xxhash_rust::xxh64::xxh64(key, u64::from(seed)) % num_bits;
            ((bit_idx / 64) as usize, 1u64 << (bit_idx % 64))
        })
    }

    /// Adds a key to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<_> = self.positions(key).collect();
        for (word, mask) in positions {
            self.bits[word] |= mask;
        }
    }

    /// Returns `false` if the key is definitely absent.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return true;
        }
        self.positions(key).all(|(word, mask)| self.bits[word] & mask != 0)
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        8 + self.bits.len() * 8
    }

    /// Writes the Bloom filter to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        // Hash count + 3 bytes reserved for alignment
        writer.write_all(&[self.hash_count, 0, 0, 0])?;
        for word in &self.bits {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a Bloom filter whose serialized form is exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        if bytes.len() < 8 {
            return Err(invalid("bloom filter header truncated"));
        }
        let num_words = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let hash_count = bytes[4];
        if hash_count == 0 || hash_count > BLOOM_FILTER_MAX_HASH_COUNT {
            return Err(invalid("bloom filter hash count out of range"));
        }
        if bytes.len() != 8 + num_words * 8 {
            return Err(invalid("bloom filter size mismatch"));
        }
        let bits = bytes[8..]
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            })
            .collect();
        Ok(Self { bits, hash_count })
    }
}

/// In-memory index of one TSM file.
#[derive(Debug, Clone, Default)]
pub struct TsmIndex {
    keys: Vec<KeyIndex>,
    block_count: usize,
}

impl TsmIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block entry. Callers append keys in sorted order and a key's
    /// blocks in time order.
    pub fn push(&mut self, key: &SeriesKey, block_type: BlockType, entry: IndexEntry) {
        match self.keys.last_mut() {
            Some(last) if last.key == *key => last.entries.push(entry),
            _ => self.keys.push(KeyIndex {
                key: key.clone(),
                block_type,
                entries: vec![entry],
            }),
        }
        self.block_count += 1;
    }

    /// Returns the last key appended.
    pub fn last_key(&self) -> Option<&SeriesKey> {
        self.keys.last().map(|k| &k.key)
    }

    /// Binary-searches for a key.
    pub fn find(&self, key: &[u8]) -> Option<&KeyIndex> {
        self.keys
            .binary_search_by(|k| k.key.as_bytes().cmp(key))
            .ok()
            .map(|i| &self.keys[i])
    }

    /// All keys in storage order.
    pub fn keys(&self) -> &[KeyIndex] {
        &self.keys
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Returns true if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Smallest timestamp in the file.
    pub fn min_time(&self) -> Timestamp {
        self.keys.iter().map(KeyIndex::min_time).min().unwrap_or(Timestamp::MAX)
    }

    /// Largest timestamp in the file.
    pub fn max_time(&self) -> Timestamp {
        self.keys.iter().map(KeyIndex::max_time).max().unwrap_or(Timestamp::MIN)
    }

    /// Builds the Bloom filter over every key.
    pub fn build_bloom(&self) -> BloomFilter {
        let mut bloom = BloomFilter::new(self.keys.len());
        for k in &self.keys {
            bloom.insert(k.key.as_bytes());
        }
        bloom
    }

    /// Writes the index.
    ///
    /// Format:
    /// - key_count: u32
    /// - per key: key_len u16, key bytes, block_type u8, entry_count u32, entries
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.keys.len() as u32).to_le_bytes())?;
        for k in &self.keys {
            writer.write_all(&(k.key.len() as u16).to_le_bytes())?;
            writer.write_all(k.key.as_bytes())?;
            writer.write_all(&[k.block_type as u8])?;
            writer.write_all(&(k.entries.len() as u32).to_le_bytes())?;
            for entry in &k.entries {
                entry.write_to(writer)?;
            }
        }
        Ok(())
    }

    /// Parses an index whose serialized form is exactly `bytes`.
    ///
    /// Only framing is checked here; the reader validates ordering and offsets.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
        let mut reader = io::Cursor::new(bytes);
        let mut buf4 = [0u8; 4];
        let mut buf2 = [0u8; 2];

        reader.read_exact(&mut buf4)?;
        let key_count = u32::from_le_bytes(buf4) as usize;
        // Each key costs at least 7 bytes.
        if key_count > bytes.len() / 7 {
            return Err(invalid(format!("implausible key count {key_count}")));
        }

        let mut keys = Vec::with_capacity(key_count);
        let mut block_count = 0;
        for _ in 0..key_count {
            reader.read_exact(&mut buf2)?;
            let key_len = u16::from_le_bytes(buf2) as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;

            let mut type_buf = [0u8; 1];
            reader.read_exact(&mut type_buf)?;
            let block_type = BlockType::from_u8(type_buf[0])
                .ok_or_else(|| invalid(format!("unknown block type {}", type_buf[0])))?;

            reader.read_exact(&mut buf4)?;
            let entry_count = u32::from_le_bytes(buf4) as usize;
            let remaining = bytes.len() - reader.position() as usize;
            if entry_count == 0 || entry_count > remaining / INDEX_ENTRY_SIZE {
                return Err(invalid(format!("implausible entry count {entry_count}")));
            }

            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                entries.push(IndexEntry::read_from(&mut reader)?);
            }
            block_count += entries.len();
            keys.push(KeyIndex {
                key: SeriesKey::new(key),
                block_type,
                entries,
            });
        }

        if reader.position() as usize != bytes.len() {
            return Err(invalid("trailing bytes after index".to_string()));
        }

        Ok(Self { keys, block_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(min: i64, max: i64, offset: u64) -> IndexEntry {
        IndexEntry {
            min_time: min,
            max_time: max,
            offset,
            size: 40,
        }
    }

    #[test]
    fn test_bloom_filter_membership() {
        let mut bloom = BloomFilter::new(100);
        for i in 0..100 {
            bloom.insert(format!("cpu,host={i}").as_bytes());
        }
        for i in 0..100 {
            assert!(bloom.maybe_contains(format!("cpu,host={i}").as_bytes()));
        }
        let false_positives = (100..1100)
            .filter(|i| bloom.maybe_contains(format!("cpu,host={i}").as_bytes()))
            .count();
        assert!(false_positives < 50, "false positive rate too high: {false_positives}");
    }

    #[test]
    fn test_bloom_filter_serialization() {
        let mut bloom = BloomFilter::new(10);
        bloom.insert(b"a");
        let mut buf = Vec::new();
        bloom.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), bloom.serialized_size());
        assert_eq!(BloomFilter::from_bytes(&buf).unwrap(), bloom);
        assert!(BloomFilter::from_bytes(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn test_index_push_groups_by_key() {
        let mut index = TsmIndex::new();
        let a = SeriesKey::from("a");
        let b = SeriesKey::from("b");
        index.push(&a, BlockType::Float, entry(0, 9, 8));
        index.push(&a, BlockType::Float, entry(10, 19, 48));
        index.push(&b, BlockType::Integer, entry(5, 5, 88));

        assert_eq!(index.key_count(), 2);
        assert_eq!(index.block_count(), 3);
        assert_eq!(index.find(b"a").unwrap().entries.len(), 2);
        assert_eq!(index.find(b"b").unwrap().block_type, BlockType::Integer);
        assert!(index.find(b"c").is_none());
        assert_eq!(index.min_time(), 0);
        assert_eq!(index.max_time(), 19);
    }

    #[test]
    fn test_index_serialization() {
        let mut index = TsmIndex::new();
        index.push(&SeriesKey::from("cpu"), BlockType::Float, entry(1, 2, 8));
        index.push(&SeriesKey::from("mem"), BlockType::String, entry(3, 4, 48));

        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        let parsed = TsmIndex::from_bytes(&buf).unwrap();
        assert_eq!(parsed.keys(), index.keys());
        assert_eq!(parsed.block_count(), 2);
    }

    #[test]
    fn test_index_rejects_garbage() {
        assert!(TsmIndex::from_bytes(&[0xFF; 16]).is_err());
        assert!(TsmIndex::from_bytes(&[]).is_err());
    }
}
