//! Column codecs for block payloads.
//!
//! A block stores its timestamps and its values as two independently encoded
//! columns. Each column records its encoding id so readers need no
//! out-of-band configuration.
//!
//! | Kind      | Value encoding                         |
//! |-----------|----------------------------------------|
//! | Float     | Gorilla XOR                            |
//! | Integer   | zig-zag delta varints                  |
//! | Unsigned  | zig-zag delta varints (wrapping)       |
//! | Boolean   | bit-packed, MSB first                  |
//! | String    | raw `u32` length-prefixed UTF-8        |
//!
//! Timestamps use delta-of-delta unless the raw form is smaller.

use crate::error::{Result, TsmError};
use crate::tsm::gorilla::{TimestampDecoder, TimestampEncoder, ValueDecoder, ValueEncoder};
use crate::tsm::{BlockType, FieldValue, Timestamp, Value};
use bitvec::prelude::*;

/// Upper bound on speculative allocation driven by an on-disk count.
const MAX_PREALLOC: usize = 1 << 16;

/// Timestamp column encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TimestampEncoding {
    /// Raw encoding (8 bytes × N, little-endian).
    Raw = 0,
    /// Delta-of-Delta encoding (Gorilla timestamps).
    #[default]
    DeltaOfDelta = 1,
}

impl TimestampEncoding {
    /// Creates a TimestampEncoding from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Raw),
            1 => Some(Self::DeltaOfDelta),
            _ => None,
        }
    }
}

/// Value column encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueEncoding {
    /// Fixed-width little-endian values; strings are `u32` length-prefixed.
    Raw = 0,
    /// Gorilla XOR compression (floats).
    GorillaXor = 1,
    /// Zig-zag varints of successive differences (integers, unsigned).
    ZigZagDelta = 2,
    /// One bit per value (booleans).
    BitPacked = 3,
}

impl ValueEncoding {
    /// Creates a ValueEncoding from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Raw),
            1 => Some(Self::GorillaXor),
            2 => Some(Self::ZigZagDelta),
            3 => Some(Self::BitPacked),
            _ => None,
        }
    }

    /// The encoding chosen for newly written blocks of a kind.
    pub fn preferred_for(block_type: BlockType) -> Self {
        match block_type {
            BlockType::Float => Self::GorillaXor,
            BlockType::Integer | BlockType::Unsigned => Self::ZigZagDelta,
            BlockType::Boolean => Self::BitPacked,
            BlockType::String => Self::Raw,
        }
    }
}

/// Encoded timestamp and value columns of one block.
#[derive(Debug, Clone)]
pub struct EncodedColumns {
    /// Timestamp encoding used.
    pub ts_encoding: TimestampEncoding,
    /// Encoded timestamps.
    pub ts_data: Vec<u8>,
    /// Value encoding used.
    pub val_encoding: ValueEncoding,
    /// Encoded values.
    pub val_data: Vec<u8>,
}

/// Encodes a run of values that all share `block_type`.
///
/// # Errors
///
/// Returns `TsmError::TypeMismatch` if any value has a different kind.
pub fn encode_values(block_type: BlockType, values: &[Value]) -> Result<EncodedColumns> {
    if let Some(bad) = values.iter().find(|v| v.block_type() != block_type) {
        return Err(TsmError::TypeMismatch {
            key: String::new(),
            expected: block_type,
            actual: bad.block_type(),
        });
    }

    let (ts_encoding, ts_data) = encode_timestamps(values.iter().map(|v| v.timestamp));
    let val_encoding = ValueEncoding::preferred_for(block_type);
    let val_data = match val_encoding {
        ValueEncoding::GorillaXor => {
            let mut out = BitVec::<u8, Msb0>::new();
            let mut encoder = ValueEncoder::new();
            for v in values {
                if let FieldValue::Float(f) = v.field {
                    encoder.encode(f, &mut out);
                }
            }
            out.into_vec()
        }
        ValueEncoding::ZigZagDelta => {
            let mut out = Vec::with_capacity(values.len() * 2);
            let mut prev = 0i64;
            for v in values {
                let cur = match v.field {
                    FieldValue::Integer(i) => i,
                    FieldValue::Unsigned(u) => u as i64,
                    _ => continue,
                };
                put_uvarint(&mut out, zigzag(cur.wrapping_sub(prev)));
                prev = cur;
            }
            out
        }
        ValueEncoding::BitPacked => {
            let mut out = BitVec::<u8, Msb0>::with_capacity(values.len());
            for v in values {
                if let FieldValue::Boolean(b) = v.field {
                    out.push(b);
                }
            }
            out.into_vec()
        }
        ValueEncoding::Raw => {
            let mut out = Vec::new();
            for v in values {
                write_raw(&v.field, &mut out);
            }
            out
        }
    };

    Ok(EncodedColumns {
        ts_encoding,
        ts_data,
        val_encoding,
        val_data,
    })
}

fn write_raw(field: &FieldValue, out: &mut Vec<u8>) {
    match field {
        FieldValue::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
        FieldValue::Integer(i) => out.extend_from_slice(&i.to_le_bytes()),
        FieldValue::Unsigned(u) => out.extend_from_slice(&u.to_le_bytes()),
        FieldValue::Boolean(b) => out.push(u8::from(*b)),
        FieldValue::String(s) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }
}

fn encode_timestamps(
    timestamps: impl ExactSizeIterator<Item = Timestamp> + Clone,
) -> (TimestampEncoding, Vec<u8>) {
    let count = timestamps.len();
    let mut bits = BitVec::<u8, Msb0>::new();
    let mut encoder = TimestampEncoder::new();
    for ts in timestamps.clone() {
        encoder.encode(ts, &mut bits);
    }

    if bits.len().div_ceil(8) <= count * 8 {
        return (TimestampEncoding::DeltaOfDelta, bits.into_vec());
    }

    let mut raw = Vec::with_capacity(count * 8);
    for ts in timestamps {
        raw.extend_from_slice(&ts.to_le_bytes());
    }
    (TimestampEncoding::Raw, raw)
}

/// Decodes `count` values of kind `block_type` from their columns.
///
/// # Errors
///
/// Returns `TsmError::DecompressionError` if either column is truncated,
/// malformed, or uses an encoding that cannot hold `block_type`.
pub fn decode_values(
    block_type: BlockType,
    count: usize,
    ts_encoding: TimestampEncoding,
    ts_data: &[u8],
    val_encoding: ValueEncoding,
    val_data: &[u8],
) -> Result<Vec<Value>> {
    let timestamps = decode_timestamps(count, ts_encoding, ts_data)?;
    let fields = decode_fields(block_type, count, val_encoding, val_data)?;
    Ok(timestamps
        .into_iter()
        .zip(fields)
        .map(|(timestamp, field)| Value { timestamp, field })
        .collect())
}

fn decode_timestamps(
    count: usize,
    encoding: TimestampEncoding,
    data: &[u8],
) -> Result<Vec<Timestamp>> {
    let mut out = Vec::with_capacity(count.min(MAX_PREALLOC));
    match encoding {
        TimestampEncoding::DeltaOfDelta => {
            let bits = BitSlice::<u8, Msb0>::from_slice(data);
            let mut decoder = TimestampDecoder::new(bits);
            for i in 0..count {
                out.push(decoder.decode_next().ok_or_else(|| truncated("timestamp", i))?);
            }
        }
        TimestampEncoding::Raw => {
            let mut chunks = data.chunks_exact(8);
            for i in 0..count {
                let chunk = chunks.next().ok_or_else(|| truncated("timestamp", i))?;
                out.push(i64::from_le_bytes(to_array(chunk)));
            }
        }
    }
    Ok(out)
}

fn decode_fields(
    block_type: BlockType,
    count: usize,
    encoding: ValueEncoding,
    data: &[u8],
) -> Result<Vec<FieldValue>> {
    let mut out = Vec::with_capacity(count.min(MAX_PREALLOC));
    match (encoding, block_type) {
        (ValueEncoding::GorillaXor, BlockType::Float) => {
            let bits = BitSlice::<u8, Msb0>::from_slice(data);
            let mut decoder = ValueDecoder::new(bits);
            for i in 0..count {
                let f = decoder.decode_next().ok_or_else(|| truncated("float", i))?;
                out.push(FieldValue::Float(f));
            }
        }
        (ValueEncoding::ZigZagDelta, BlockType::Integer | BlockType::Unsigned) => {
            let mut pos = 0usize;
            let mut prev = 0i64;
            for i in 0..count {
                let delta = get_uvarint(data, &mut pos).ok_or_else(|| truncated("integer", i))?;
                prev = prev.wrapping_add(unzigzag(delta));
                out.push(if block_type == BlockType::Integer {
                    FieldValue::Integer(prev)
                } else {
                    FieldValue::Unsigned(prev as u64)
                });
            }
        }
        (ValueEncoding::BitPacked, BlockType::Boolean) => {
            let bits = BitSlice::<u8, Msb0>::from_slice(data);
            if bits.len() < count {
                return Err(truncated("boolean", bits.len()));
            }
            out.extend(bits[..count].iter().by_vals().map(FieldValue::Boolean));
        }
        (ValueEncoding::Raw, _) => {
            let mut pos = 0usize;
            for i in 0..count {
                out.push(read_raw(block_type, data, &mut pos).ok_or_else(|| truncated("raw", i))??);
            }
        }
        (encoding, block_type) => {
            return Err(TsmError::DecompressionError(format!(
                "encoding {encoding:?} cannot hold {block_type:?} values"
            )));
        }
    }
    Ok(out)
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
    let end = pos.checked_add(n)?;
    let slice = data.get(*pos..end)?;
    *pos = end;
    Some(slice)
}

fn read_raw(block_type: BlockType, data: &[u8], pos: &mut usize) -> Option<Result<FieldValue>> {
    let field = match block_type {
        BlockType::Float => FieldValue::Float(f64::from_le_bytes(to_array(take(data, pos, 8)?))),
        BlockType::Integer => FieldValue::Integer(i64::from_le_bytes(to_array(take(data, pos, 8)?))),
        BlockType::Unsigned => {
            FieldValue::Unsigned(u64::from_le_bytes(to_array(take(data, pos, 8)?)))
        }
        BlockType::Boolean => FieldValue::Boolean(take(data, pos, 1)?[0] != 0),
        BlockType::String => {
            let len = u32::from_le_bytes(to_array(take(data, pos, 4)?)) as usize;
            let bytes = take(data, pos, len)?;
            match std::str::from_utf8(bytes) {
                Ok(s) => FieldValue::String(s.to_owned()),
                Err(e) => {
                    return Some(Err(TsmError::DecompressionError(format!(
                        "invalid UTF-8 in string value: {e}"
                    ))))
                }
            }
        }
    };
    Some(Ok(field))
}

fn truncated(what: &str, index: usize) -> TsmError {
    TsmError::DecompressionError(format!("{what} column ended at value {index}"))
}

/// Copies a slice whose length the caller has already checked.
fn to_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Appends `value` as an unsigned LEB128 varint.
pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Reads an unsigned LEB128 varint at `*pos`; `None` if truncated or overlong.
pub(crate) fn get_uvarint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return None;
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}
