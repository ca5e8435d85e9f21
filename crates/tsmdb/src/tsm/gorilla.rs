//! Gorilla compression for time series data.
//!
//! Implements Facebook's Gorilla algorithm for timestamps and float values.
//! The other value kinds use the codecs in [`crate::tsm::encoding`].
//!
//! # Algorithm Overview
//!
//! ## Timestamp Encoding (Delta-of-Delta)
//!
//! - First value: 64 bits raw
//! - Subsequent values use variable-length encoding based on delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! ## Value Encoding (XOR-based)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits
//!
//! Decoders are bounds-checked: a truncated or garbage stream yields `None`
//! instead of panicking.

use crate::error::{Result, TsmError};
use bitvec::prelude::*;

/// Compressed block containing Gorilla-encoded timestamps and values.
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    /// Compressed timestamps using delta-of-delta encoding.
    pub timestamps: BitVec<u8, Msb0>,
    /// Compressed values using XOR encoding.
    pub values: BitVec<u8, Msb0>,
    /// Number of data points in the block.
    pub count: u32,
}

impl CompressedBlock {
    /// Compresses a sequence of (timestamp, value) pairs into a block.
    ///
    /// ```rust,ignore
    /// let points = vec![(1000, 1.0), (1001, 1.1), (1002, 1.2)];
    /// let block = CompressedBlock::compress(&points);
    /// assert_eq!(block.count, 3);
    /// ```
    pub fn compress(points: &[(i64, f64)]) -> Self {
        let mut ts_output = BitVec::<u8, Msb0>::new();
        let mut val_output = BitVec::<u8, Msb0>::new();

        let mut ts_encoder = TimestampEncoder::new();
        let mut val_encoder = ValueEncoder::new();

        for &(ts, val) in points {
            ts_encoder.encode(ts, &mut ts_output);
            val_encoder.encode(val, &mut val_output);
        }

        Self {
            timestamps: ts_output,
            values: val_output,
            count: points.len() as u32,
        }
    }

    /// Decompresses the block back to a sequence of (timestamp, value) pairs.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::DecompressionError` if either stream ends early.
    pub fn decompress(&self) -> Result<Vec<(i64, f64)>> {
        let mut ts_decoder = TimestampDecoder::new(&self.timestamps);
        let mut val_decoder = ValueDecoder::new(&self.values);

        let mut result = Vec::with_capacity(self.count.min(1 << 16) as usize);

        for i in 0..self.count {
            let ts = ts_decoder.decode_next().ok_or_else(|| {
                TsmError::DecompressionError(format!("timestamp stream ended at point {i}"))
            })?;
            let val = val_decoder.decode_next().ok_or_else(|| {
                TsmError::DecompressionError(format!("value stream ended at point {i}"))
            })?;
            result.push((ts, val));
        }

        Ok(result)
    }
}

/// Reads `n` bits MSB-first starting at `*pos`, advancing it.
fn read_bits(data: &BitSlice<u8, Msb0>, pos: &mut usize, n: u32) -> Option<u64> {
    let end = pos.checked_add(n as usize)?;
    if end > data.len() {
        return None;
    }
    let mut out: u64 = 0;
    for bit in data[*pos..end].iter().by_vals() {
        out = (out << 1) | u64::from(bit);
    }
    *pos = end;
    Some(out)
}

fn read_bit(data: &BitSlice<u8, Msb0>, pos: &mut usize) -> Option<bool> {
    let bit = *data.get(*pos)?;
    *pos += 1;
    Some(bit)
}

fn push_bits(output: &mut BitVec<u8, Msb0>, value: u64, n: u32) {
    for i in (0..n).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Encoder for timestamps using delta-of-delta encoding.
#[derive(Debug, Default)]
pub struct TimestampEncoder {
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    /// Creates a new timestamp encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a timestamp into the output bit vector.
    pub fn encode(&mut self, timestamp: i64, output: &mut BitVec<u8, Msb0>) {
        if !self.started {
            self.started = true;
            self.prev_ts = timestamp;
            self.prev_delta = 0;
            push_bits(output, timestamp as u64, 64);
            return;
        }

        let delta = timestamp.wrapping_sub(self.prev_ts);
        let delta_of_delta = delta.wrapping_sub(self.prev_delta);

        if delta_of_delta == 0 {
            output.push(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            push_bits(output, 0b10, 2);
            push_bits(output, (delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            push_bits(output, 0b110, 3);
            push_bits(output, (delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (delta_of_delta + 2047) as u64, 12);
        } else {
            // Full width so arbitrary i64 gaps round-trip.
            push_bits(output, 0b1111, 4);
            push_bits(output, delta_of_delta as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = timestamp;
    }
}

/// Decoder for delta-of-delta encoded timestamps.
pub struct TimestampDecoder<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    /// Creates a new timestamp decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            data,
            pos: 0,
            started: false,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    /// Decodes the next timestamp from the bit stream.
    pub fn decode_next(&mut self) -> Option<i64> {
        let data = self.data;
        let pos = &mut self.pos;

        if !self.started {
            let ts = read_bits(data, pos, 64)? as i64;
            self.started = true;
            self.prev_ts = ts;
            self.prev_delta = 0;
            return Some(ts);
        }

        let delta_of_delta = if !read_bit(data, pos)? {
            0
        } else if !read_bit(data, pos)? {
            read_bits(data, pos, 7)? as i64 - 63
        } else if !read_bit(data, pos)? {
            read_bits(data, pos, 9)? as i64 - 255
        } else if !read_bit(data, pos)? {
            read_bits(data, pos, 12)? as i64 - 2047
        } else {
            read_bits(data, pos, 64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(delta_of_delta);
        let ts = self.prev_ts.wrapping_add(delta);
        self.prev_delta = delta;
        self.prev_ts = ts;

        Some(ts)
    }
}

/// Encoder for float values using XOR compression.
#[derive(Debug, Default)]
pub struct ValueEncoder {
    started: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a float value into the output bit vector.
    pub fn encode(&mut self, value: f64, output: &mut BitVec<u8, Msb0>) {
        let bits = value.to_bits();

        if !self.started {
            self.started = true;
            self.prev_value = bits;
            push_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_value;

        if xor == 0 {
            output.push(false);
        } else {
            // Only 5 bits are available for the leading count.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if self.prev_leading + self.prev_trailing > 0
                && leading >= self.prev_leading
                && trailing >= self.prev_trailing
            {
                push_bits(output, 0b10, 2);
                let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
                push_bits(output, xor >> self.prev_trailing, meaningful_bits);
            } else {
                push_bits(output, 0b11, 2);
                push_bits(output, u64::from(leading), 5);

                // 6 bits for meaningful length (1-64, stored as 0-63)
                let meaningful_bits = 64 - leading - trailing;
                push_bits(output, u64::from(meaningful_bits - 1), 6);
                push_bits(output, xor >> trailing, meaningful_bits);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value = bits;
    }
}

/// Decoder for XOR-encoded float values.
pub struct ValueDecoder<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
    started: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            data,
            pos: 0,
            started: false,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Decodes the next float value from the bit stream.
    pub fn decode_next(&mut self) -> Option<f64> {
        let data = self.data;
        let pos = &mut self.pos;

        if !self.started {
            let bits = read_bits(data, pos, 64)?;
            self.started = true;
            self.prev_value = bits;
            return Some(f64::from_bits(bits));
        }

        let xor = if !read_bit(data, pos)? {
            0u64
        } else if !read_bit(data, pos)? {
            let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
            read_bits(data, pos, meaningful_bits)? << self.prev_trailing
        } else {
            let leading = read_bits(data, pos, 5)? as u32;
            let meaningful_bits = read_bits(data, pos, 6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful_bits)?;
            let xor_value = read_bits(data, pos, meaningful_bits)?;

            self.prev_leading = leading;
            self.prev_trailing = trailing;

            xor_value.checked_shl(trailing).unwrap_or(0)
        };

        let bits = self.prev_value ^ xor;
        self.prev_value = bits;

        Some(f64::from_bits(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_timestamps(timestamps: &[i64]) {
        let mut output = BitVec::<u8, Msb0>::new();
        let mut encoder = TimestampEncoder::new();
        for &ts in timestamps {
            encoder.encode(ts, &mut output);
        }

        let mut decoder = TimestampDecoder::new(&output);
        for &expected in timestamps {
            assert_eq!(decoder.decode_next(), Some(expected));
        }
    }

    fn roundtrip_values(values: &[f64]) -> usize {
        let mut output = BitVec::<u8, Msb0>::new();
        let mut encoder = ValueEncoder::new();
        for &val in values {
            encoder.encode(val, &mut output);
        }

        let mut decoder = ValueDecoder::new(&output);
        for &expected in values {
            let decoded = decoder.decode_next().expect("should decode");
            assert_eq!(expected.to_bits(), decoded.to_bits());
        }
        output.len()
    }

    #[test]
    fn test_compressed_block_roundtrip() {
        let points = vec![
            (1000_i64, 1.0_f64),
            (1010, 1.1),
            (1020, 1.2),
            (1030, 1.1),
            (1040, 1.0),
        ];

        let block = CompressedBlock::compress(&points);
        assert_eq!(block.count, 5);
        assert_eq!(block.decompress().unwrap(), points);
    }

    #[test]
    fn test_empty_block() {
        let block = CompressedBlock::compress(&[]);
        assert_eq!(block.count, 0);
        assert!(block.decompress().unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_zero_delta_compresses() {
        let timestamps = vec![1000_i64, 1010, 1020, 1030, 1040];
        roundtrip_timestamps(&timestamps);

        let mut output = BitVec::<u8, Msb0>::new();
        let mut encoder = TimestampEncoder::new();
        for &ts in &timestamps {
            encoder.encode(ts, &mut output);
        }
        assert!(output.len() < 90, "regular intervals should compress well");
    }

    #[test]
    fn test_timestamp_all_buckets() {
        roundtrip_timestamps(&[1000, 1010, 1025, 1035, 1055]);
        roundtrip_timestamps(&[1000, 1100, 1350, 1400]);
        roundtrip_timestamps(&[1000, 2000, 5000, 5500]);
        roundtrip_timestamps(&[0, 1_000_000, 100_000_000, 100_001_000]);
    }

    #[test]
    fn test_timestamp_extreme_gaps() {
        roundtrip_timestamps(&[i64::MIN, 0, i64::MAX]);
        roundtrip_timestamps(&[-1_000_000_000, -999_999_000, 0, 1000]);
    }

    #[test]
    fn test_value_identical_compresses() {
        let bits = roundtrip_values(&[42.5_f64; 10]);
        assert!(bits < 80, "identical values should compress to ~73 bits");
    }

    #[test]
    fn test_value_special_floats() {
        roundtrip_values(&[
            0.0_f64,
            -0.0,
            f64::MIN,
            f64::MAX,
            f64::MIN_POSITIVE,
            f64::EPSILON,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NAN,
        ]);
    }

    #[test]
    fn test_value_many_leading_zeros() {
        // XORs with more than 31 leading zeros exercise the capped window.
        roundtrip_values(&[1.0, f64::from_bits(1.0f64.to_bits() ^ 1), 1.0, 2.0]);
    }

    #[test]
    fn test_decompress_truncated_stream_errors() {
        let points: Vec<(i64, f64)> = (0..10).map(|i| (i * 10, i as f64 * 1.5)).collect();
        let mut block = CompressedBlock::compress(&points);
        block.values.truncate(70);
        assert!(block.decompress().is_err());
    }

    #[test]
    fn test_decoders_never_panic_on_garbage() {
        let garbage: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(37) ^ 0xA5).collect();
        let bits = BitVec::<u8, Msb0>::from_vec(garbage);
        let mut ts = TimestampDecoder::new(&bits);
        let mut vals = ValueDecoder::new(&bits);
        for _ in 0..1000 {
            let a = ts.decode_next();
            let b = vals.decode_next();
            if a.is_none() && b.is_none() {
                break;
            }
        }
    }
}
