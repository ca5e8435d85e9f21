//! Self-contained, checksummed data blocks.
//!
//! ## Binary Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    1       block_type (u8)
//! 0x01    1       ts_encoding (u8)
//! 0x02    1       val_encoding (u8)
//! 0x03    1       reserved
//! 0x04    4       point_count (u32 LE)
//! 0x08    8       min_timestamp (i64 LE)
//! 0x10    8       max_timestamp (i64 LE)
//! 0x18    4       ts_data_size (u32 LE)
//! 0x1C    N       ts_data[ts_data_size]
//! 0x1C+N  M       val_data (runs to the checksum)
//! end-4   4       block_crc32 (u32 LE) over every preceding byte
//! ```

use crate::error::{Result, TsmError};
use crate::tsm::encoding::{self, TimestampEncoding, ValueEncoding};
use crate::tsm::{BlockType, SeriesKey, Timestamp, Value};

/// Fixed block header size in bytes.
pub const BLOCK_HEADER_SIZE: usize = 28;

/// Size of the trailing checksum.
const BLOCK_CRC_SIZE: usize = 4;

/// Decoded fixed-size block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload kind.
    pub block_type: BlockType,
    /// Timestamp column encoding.
    pub ts_encoding: TimestampEncoding,
    /// Value column encoding.
    pub val_encoding: ValueEncoding,
    /// Number of values in the block.
    pub point_count: u32,
    /// Smallest timestamp in the block.
    pub min_ts: Timestamp,
    /// Largest timestamp in the block.
    pub max_ts: Timestamp,
    /// Size of the timestamp column.
    pub ts_data_size: u32,
}

/// Encodes a sorted, deduplicated, single-kind run of values into block bytes.
///
/// # Errors
///
/// Returns `TsmError::TypeMismatch` if values disagree with `block_type`.
pub fn encode_block(block_type: BlockType, values: &[Value]) -> Result<Vec<u8>> {
    let cols = encoding::encode_values(block_type, values)?;
    let min_ts = values.first().map_or(0, |v| v.timestamp);
    let max_ts = values.last().map_or(0, |v| v.timestamp);

    let mut buf = Vec::with_capacity(
        BLOCK_HEADER_SIZE + cols.ts_data.len() + cols.val_data.len() + BLOCK_CRC_SIZE,
    );
    buf.push(block_type as u8);
    buf.push(cols.ts_encoding as u8);
    buf.push(cols.val_encoding as u8);
    buf.push(0);
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    buf.extend_from_slice(&min_ts.to_le_bytes());
    buf.extend_from_slice(&max_ts.to_le_bytes());
    buf.extend_from_slice(&(cols.ts_data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&cols.ts_data);
    buf.extend_from_slice(&cols.val_data);

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn corrupt(offset: u64, reason: impl Into<String>) -> TsmError {
    TsmError::CorruptBlock {
        offset,
        reason: reason.into(),
    }
}

/// Verifies the checksum and parses the header of a block.
///
/// `offset` is only used to label errors.
///
/// # Errors
///
/// Returns `TsmError::CorruptBlock` on checksum failure or a malformed header.
pub fn verify_block(bytes: &[u8], offset: u64) -> Result<BlockHeader> {
    if bytes.len() < BLOCK_HEADER_SIZE + BLOCK_CRC_SIZE {
        return Err(corrupt(offset, format!("block too short: {} bytes", bytes.len())));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - BLOCK_CRC_SIZE);
    let mut stored = [0u8; 4];
    stored.copy_from_slice(crc_bytes);
    let expected = u32::from_le_bytes(stored);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(corrupt(
            offset,
            format!("checksum mismatch: expected {expected:#010x}, got {actual:#010x}"),
        ));
    }

    let block_type = BlockType::from_u8(body[0])
        .ok_or_else(|| corrupt(offset, format!("unknown block type {}", body[0])))?;
    let ts_encoding = TimestampEncoding::from_u8(body[1])
        .ok_or_else(|| corrupt(offset, format!("unknown timestamp encoding {}", body[1])))?;
    let val_encoding = ValueEncoding::from_u8(body[2])
        .ok_or_else(|| corrupt(offset, format!("unknown value encoding {}", body[2])))?;

    let u32_at = |at: usize| u32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
    let i64_at = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&body[at..at + 8]);
        i64::from_le_bytes(b)
    };

    let header = BlockHeader {
        block_type,
        ts_encoding,
        val_encoding,
        point_count: u32_at(4),
        min_ts: i64_at(8),
        max_ts: i64_at(16),
        ts_data_size: u32_at(24),
    };

    if BLOCK_HEADER_SIZE + header.ts_data_size as usize > body.len() {
        return Err(corrupt(offset, "timestamp column overruns block"));
    }

    Ok(header)
}

/// Verifies and fully decodes a block.
///
/// # Errors
///
/// Returns `TsmError::CorruptBlock` if the block fails verification or its
/// columns cannot be decoded.
pub fn decode_block(bytes: &[u8], offset: u64) -> Result<Vec<Value>> {
    let header = verify_block(bytes, offset)?;
    let body = &bytes[..bytes.len() - BLOCK_CRC_SIZE];
    let ts_end = BLOCK_HEADER_SIZE + header.ts_data_size as usize;

    let values = encoding::decode_values(
        header.block_type,
        header.point_count as usize,
        header.ts_encoding,
        &body[BLOCK_HEADER_SIZE..ts_end],
        header.val_encoding,
        &body[ts_end..],
    )
    .map_err(|e| corrupt(offset, e.to_string()))?;

    if values.windows(2).any(|w| w[0].timestamp >= w[1].timestamp) {
        return Err(corrupt(offset, "timestamps not strictly increasing"));
    }

    Ok(values)
}

/// An encoded block together with the index metadata that locates it.
///
/// Produced by [`crate::tsm::BlockIterator`] and consumed by the compactor,
/// which can copy the bytes verbatim into a new file.
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Series the block belongs to.
    pub key: SeriesKey,
    /// Smallest timestamp in the block.
    pub min_time: Timestamp,
    /// Largest timestamp in the block.
    pub max_time: Timestamp,
    /// Payload kind.
    pub block_type: BlockType,
    /// Offset of the block in its source file.
    pub offset: u64,
    /// Encoded block bytes including the trailing checksum.
    pub bytes: Vec<u8>,
}

impl RawBlock {
    /// Decodes the block's values.
    pub fn decode(&self) -> Result<Vec<Value>> {
        decode_block(&self.bytes, self.offset)
    }

    /// Verifies the block checksum without decoding.
    pub fn verify(&self) -> Result<BlockHeader> {
        verify_block(&self.bytes, self.offset)
    }
}
