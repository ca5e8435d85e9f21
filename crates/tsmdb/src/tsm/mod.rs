//! Immutable sorted file format and the value model it stores.
//!
//! A TSM file holds compressed blocks of typed values grouped by series key,
//! followed by an in-memory-loadable index, a Bloom filter over the keys and a
//! fixed-size footer.

pub mod block;
pub mod encoding;
pub mod gorilla;
pub mod index;
pub mod reader;
pub mod tombstone;
pub mod writer;

pub use block::{BlockHeader, RawBlock};
pub use gorilla::CompressedBlock;
pub use index::{BloomFilter, IndexEntry, TsmIndex};
pub use reader::{BlockIterator, TsmReader};
pub use tombstone::{Tombstone, Tombstones};
pub use writer::{TsmFileMeta, TsmWriter};

use crate::error::{Result, TsmError};
use std::borrow::Borrow;
use std::fmt;

/// Timestamp in nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Longest series key, bounded by the `u16` length prefix used on disk.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Separator between the series part of a key and its field name.
pub const FIELD_SEPARATOR: &[u8] = b"#!~#";

/// Opaque, byte-ordered series identifier.
///
/// Conventionally `measurement,tag1=v1,tag2=v2#!~#field`. Ordering is plain
/// byte-lexicographic and is the order keys appear in files.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SeriesKey(Vec<u8>);

impl SeriesKey {
    /// Creates a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Builds the conventional `measurement,tags#!~#field` form.
    ///
    /// Tags are sorted by tag key so the same tag set always yields the same key.
    pub fn from_parts(measurement: &str, tags: &[(&str, &str)], field: &str) -> Self {
        let mut tags = tags.to_vec();
        tags.sort_unstable();

        let mut bytes = Vec::with_capacity(measurement.len() + field.len() + 16);
        bytes.extend_from_slice(measurement.as_bytes());
        for (k, v) in tags {
            bytes.push(b',');
            bytes.extend_from_slice(k.as_bytes());
            bytes.push(b'=');
            bytes.extend_from_slice(v.as_bytes());
        }
        bytes.extend_from_slice(FIELD_SEPARATOR);
        bytes.extend_from_slice(field.as_bytes());
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fails with `TsmError::KeyTooLong` if the key exceeds [`MAX_KEY_LEN`].
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() > MAX_KEY_LEN {
            return Err(TsmError::KeyTooLong {
                len: self.0.len(),
                max: MAX_KEY_LEN,
            });
        }
        Ok(())
    }

    /// Renders the key for logs and error messages.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeriesKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl Borrow<[u8]> for SeriesKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SeriesKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for SeriesKey {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&[u8]> for SeriesKey {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<Vec<u8>> for SeriesKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Payload kind stored in blocks and index entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    /// 64-bit IEEE float.
    Float = 0,
    /// Signed 64-bit integer.
    Integer = 1,
    /// Boolean.
    Boolean = 2,
    /// UTF-8 string.
    String = 3,
    /// Unsigned 64-bit integer.
    Unsigned = 4,
}

impl BlockType {
    /// Creates a BlockType from its on-disk id.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Float),
            1 => Some(Self::Integer),
            2 => Some(Self::Boolean),
            3 => Some(Self::String),
            4 => Some(Self::Unsigned),
            _ => None,
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit IEEE float.
    Float(f64),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Unsigned 64-bit integer.
    Unsigned(u64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string.
    String(String),
}

impl FieldValue {
    /// Returns the block type this value is stored as.
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Float(_) => BlockType::Float,
            Self::Integer(_) => BlockType::Integer,
            Self::Unsigned(_) => BlockType::Unsigned,
            Self::Boolean(_) => BlockType::Boolean,
            Self::String(_) => BlockType::String,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Self::Float(_) | Self::Integer(_) | Self::Unsigned(_) => 8,
            Self::Boolean(_) => 1,
            Self::String(s) => s.len(),
        }
    }
}

/// A timestamped, typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// Timestamp in nanoseconds.
    pub timestamp: Timestamp,
    /// The payload.
    pub field: FieldValue,
}

impl Value {
    /// Creates a value.
    pub fn new(timestamp: Timestamp, field: FieldValue) -> Self {
        Self { timestamp, field }
    }

    /// Creates a float value.
    pub fn float(timestamp: Timestamp, v: f64) -> Self {
        Self::new(timestamp, FieldValue::Float(v))
    }

    /// Creates a signed integer value.
    pub fn integer(timestamp: Timestamp, v: i64) -> Self {
        Self::new(timestamp, FieldValue::Integer(v))
    }

    /// Creates an unsigned integer value.
    pub fn unsigned(timestamp: Timestamp, v: u64) -> Self {
        Self::new(timestamp, FieldValue::Unsigned(v))
    }

    /// Creates a boolean value.
    pub fn boolean(timestamp: Timestamp, v: bool) -> Self {
        Self::new(timestamp, FieldValue::Boolean(v))
    }

    /// Creates a string value.
    pub fn string(timestamp: Timestamp, v: impl Into<String>) -> Self {
        Self::new(timestamp, FieldValue::String(v.into()))
    }

    /// Returns the block type of the payload.
    pub fn block_type(&self) -> BlockType {
        self.field.block_type()
    }

    /// Approximate in-memory footprint used for cache accounting.
    pub fn size(&self) -> usize {
        // timestamp + WAL sequence tag + payload
        16 + self.field.payload_size()
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive).
    pub start: Timestamp,
    /// End timestamp (exclusive).
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a new time range.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The range covering every representable timestamp except `i64::MAX`.
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Returns true if the timestamp falls within the range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Returns true if the inclusive span `[min, max]` intersects the range.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        min < self.end && max >= self.start
    }

    /// Returns true if the range is empty.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}
