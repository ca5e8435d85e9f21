//! Error and Result types for tsmdb operations.

use crate::tsm::BlockType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for tsmdb operations.
pub type Result<T> = std::result::Result<T, TsmError>;

/// The error type for all engine operations.
#[derive(Debug, Error)]
pub enum TsmError {
    /// The WAL could not make a write durable. The write was not applied.
    #[error("durability failure: {0}")]
    DurabilityFailure(#[source] io::Error),

    /// The cache is at its memory ceiling.
    #[error("cache capacity exceeded: {requested} bytes requested, {used}/{limit} in use")]
    CapacityExceeded {
        /// Bytes the rejected write needed.
        requested: u64,
        /// Bytes in use when the write was rejected.
        used: u64,
        /// Configured ceiling.
        limit: u64,
    },

    /// A WAL segment is corrupt somewhere other than its tail.
    #[error("corrupt WAL segment {path:?} at offset {offset}: {reason}")]
    CorruptSegment {
        /// Segment file.
        path: PathBuf,
        /// Byte offset of the first bad record.
        offset: u64,
        /// What was wrong with the record.
        reason: String,
    },

    /// The last WAL segment ends in a partial record.
    #[error("truncated WAL segment {path:?}: last good offset {offset}")]
    TruncatedSegment {
        /// Segment file.
        path: PathBuf,
        /// Byte offset after the last complete record.
        offset: u64,
    },

    /// A block failed its checksum or could not be decoded.
    #[error("corrupt block at offset {offset}: {reason}")]
    CorruptBlock {
        /// Offset of the block in its file.
        offset: u64,
        /// What was wrong with the block.
        reason: String,
    },

    /// A TSM file failed structural validation.
    #[error("corrupt TSM file {path:?}: {reason}")]
    CorruptFile {
        /// File that failed validation.
        path: PathBuf,
        /// What was wrong with the file.
        reason: String,
    },

    /// Compaction could not produce its outputs. Inputs are untouched.
    #[error("compaction failed: {0}")]
    CompactionFailure(String),

    /// A cooperative operation observed its cancellation flag.
    #[error("operation cancelled")]
    Cancelled,

    /// A value's kind does not match the series' established kind.
    #[error("type mismatch for series {key}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        /// Series key, lossily rendered.
        key: String,
        /// Kind already stored for the series.
        expected: BlockType,
        /// Kind of the rejected value.
        actual: BlockType,
    },

    /// A series key is longer than the on-disk formats can frame.
    #[error("series key of {len} bytes exceeds the {max}-byte limit")]
    KeyTooLong {
        /// Length of the rejected key.
        len: usize,
        /// Longest key accepted.
        max: usize,
    },

    /// A WAL entry encodes to more than one record can hold.
    #[error("WAL entry of {size} bytes exceeds the {max}-byte record limit")]
    EntryTooLarge {
        /// Encoded size of the rejected entry.
        size: usize,
        /// Largest record payload accepted.
        max: usize,
    },

    /// Keys handed to a writer were not strictly increasing.
    #[error("unsorted input: key {key} does not sort after the previous key")]
    UnsortedInput {
        /// Offending key, lossily rendered.
        key: String,
    },

    /// Invalid magic bytes in a file header or footer.
    #[error("invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported file format version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Checksum does not match the expected value.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Error during decompression.
    #[error("decompression error: {0}")]
    DecompressionError(String),

    /// The engine is closing or closed.
    #[error("engine is closed")]
    EngineClosed,

    /// The engine is still loading.
    #[error("engine is not serving yet")]
    EngineNotReady,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TsmError {
    /// Returns true for errors that leave persisted state intact and can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::Cancelled | Self::CompactionFailure(_)
        )
    }
}
