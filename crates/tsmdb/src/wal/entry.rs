//! WAL record payloads.
//!
//! ## Payload Layout
//!
//! ```text
//! entry_type u8 | sequence u64 | body
//!
//! Write body:       series_count u32
//!                   series_count × (key_len u16 | key | kind u8 | count u32 | count × value)
//!                   value = timestamp i64 | payload
//!                   payload = f64 | i64 | u64 | u8 (bool) | len u32 + utf8 bytes
//!
//! DeleteRange body: min i64 | max i64 | key_count u32 | key_count × (key_len u16 | key)
//! ```

use crate::error::Result;
use crate::tsm::{BlockType, FieldValue, SeriesKey, Timestamp, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum WalEntryType {
    Write = 1,
    DeleteRange = 2,
}

impl WalEntryType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Write),
            2 => Some(Self::DeleteRange),
            _ => None,
        }
    }
}

/// A logical WAL record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    /// Values for one or more series.
    Write {
        /// Series and their values, in the order they were submitted.
        values: Vec<(SeriesKey, Vec<Value>)>,
    },
    /// Inclusive deletion of `[min, max]` for each key.
    DeleteRange {
        /// Affected series.
        keys: Vec<SeriesKey>,
        /// First deleted timestamp.
        min: Timestamp,
        /// Last deleted timestamp.
        max: Timestamp,
    },
}

impl WalEntry {
    /// Creates a write entry for a single series.
    pub fn write(key: SeriesKey, values: Vec<Value>) -> Self {
        Self::Write {
            values: vec![(key, values)],
        }
    }

    /// Creates a delete entry.
    pub fn delete_range(keys: Vec<SeriesKey>, min: Timestamp, max: Timestamp) -> Self {
        Self::DeleteRange { keys, min, max }
    }

    /// Number of values carried by a write entry.
    pub fn value_count(&self) -> usize {
        match self {
            Self::Write { values } => values.iter().map(|(_, v)| v.len()).sum(),
            Self::DeleteRange { .. } => 0,
        }
    }

    /// Written series; empty for deletes.
    pub fn series(&self) -> &[(SeriesKey, Vec<Value>)] {
        match self {
            WalEntry::Write { values } => values,
            WalEntry::DeleteRange { .. } => &[],
        }
    }

    /// Fails with `TsmError::KeyTooLong` if any key cannot be framed.
    pub fn check_keys(&self) -> Result<()> {
        match self {
            Self::Write { values } => values.iter().try_for_each(|(key, _)| key.check_len()),
            Self::DeleteRange { keys, .. } => keys.iter().try_for_each(SeriesKey::check_len),
        }
    }

    pub(crate) fn encode(&self, sequence: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Self::Write { values } => {
                buf.push(WalEntryType::Write as u8);
                buf.extend_from_slice(&sequence.to_le_bytes());
                buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
                for (key, series) in values {
                    put_key(&mut buf, key);
                    let kind = series.first().map_or(BlockType::Float, Value::block_type);
                    buf.push(kind as u8);
                    buf.extend_from_slice(&(series.len() as u32).to_le_bytes());
                    for v in series {
                        buf.extend_from_slice(&v.timestamp.to_le_bytes());
                        put_field(&mut buf, &v.field);
                    }
                }
            }
            Self::DeleteRange { keys, min, max } => {
                buf.push(WalEntryType::DeleteRange as u8);
                buf.extend_from_slice(&sequence.to_le_bytes());
                buf.extend_from_slice(&min.to_le_bytes());
                buf.extend_from_slice(&max.to_le_bytes());
                buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
                for key in keys {
                    put_key(&mut buf, key);
                }
            }
        }
        buf
    }

    /// Decodes a payload into `(sequence, entry)`.
    ///
    /// Returns a description of the problem on malformed input.
    pub(crate) fn decode(bytes: &[u8]) -> std::result::Result<(u64, Self), String> {
        let mut r = Cursor { bytes, pos: 0 };
        let kind = r.u8()?;
        let sequence = r.u64()?;
        let entry = match WalEntryType::from_u8(kind) {
            Some(WalEntryType::Write) => {
                let series_count = r.u32()? as usize;
                let mut values = Vec::with_capacity(series_count.min(1024));
                for _ in 0..series_count {
                    let key = r.key()?;
                    let kind = BlockType::from_u8(r.u8()?).ok_or("unknown value kind")?;
                    let count = r.u32()? as usize;
                    let mut series = Vec::with_capacity(count.min(4096));
                    for _ in 0..count {
                        let timestamp = r.i64()?;
                        series.push(Value::new(timestamp, r.field(kind)?));
                    }
                    values.push((key, series));
                }
                Self::Write { values }
            }
            Some(WalEntryType::DeleteRange) => {
                let min = r.i64()?;
                let max = r.i64()?;
                let key_count = r.u32()? as usize;
                let mut keys = Vec::with_capacity(key_count.min(1024));
                for _ in 0..key_count {
                    keys.push(r.key()?);
                }
                Self::DeleteRange { keys, min, max }
            }
            None => return Err(format!("unknown entry type {kind}")),
        };
        if r.pos != bytes.len() {
            return Err(format!("{} trailing bytes", bytes.len() - r.pos));
        }
        Ok((sequence, entry))
    }
}

fn put_key(buf: &mut Vec<u8>, key: &SeriesKey) {
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
}

fn put_field(buf: &mut Vec<u8>, field: &FieldValue) {
    match field {
        FieldValue::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Integer(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Unsigned(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Boolean(v) => buf.push(u8::from(*v)),
        FieldValue::String(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.bytes.len());
        let end = end.ok_or_else(|| format!("payload ends early at {}", self.pos))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        self.array().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> std::result::Result<i64, String> {
        self.array().map(i64::from_le_bytes)
    }

    fn key(&mut self) -> std::result::Result<SeriesKey, String> {
        let len = u16::from_le_bytes(self.array()?) as usize;
        Ok(SeriesKey::from(self.take(len)?))
    }

    fn field(&mut self, kind: BlockType) -> std::result::Result<FieldValue, String> {
        Ok(match kind {
            BlockType::Float => FieldValue::Float(f64::from_le_bytes(self.array()?)),
            BlockType::Integer => FieldValue::Integer(self.i64()?),
            BlockType::Unsigned => FieldValue::Unsigned(self.u64()?),
            BlockType::Boolean => match self.u8()? {
                0 => FieldValue::Boolean(false),
                1 => FieldValue::Boolean(true),
                other => return Err(format!("invalid boolean byte {other}")),
            },
            BlockType::String => {
                let len = self.u32()? as usize;
                let raw = self.take(len)?;
                let s = std::str::from_utf8(raw).map_err(|e| e.to_string())?;
                FieldValue::String(s.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_entry_roundtrip() {
        let entry = WalEntry::Write {
            values: vec![
                (
                    SeriesKey::from("cpu#!~#usage"),
                    vec![Value::float(1, 1.5), Value::float(2, f64::NAN)],
                ),
                (SeriesKey::from("up"), vec![Value::boolean(3, true)]),
                (SeriesKey::from("msg"), vec![Value::string(4, "héllo")]),
                (SeriesKey::from("n"), vec![Value::unsigned(5, u64::MAX)]),
            ],
        };
        let (seq, decoded) = WalEntry::decode(&entry.encode(42)).unwrap();
        assert_eq!(seq, 42);
        // NaN != NaN, so compare bit patterns of the float series.
        let WalEntry::Write { values } = decoded else {
            panic!("expected write entry");
        };
        assert_eq!(values.len(), 4);
        match &values[0].1[1].field {
            FieldValue::Float(f) => assert!(f.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(values[2].1, vec![Value::string(4, "héllo")]);
        assert_eq!(values[3].1, vec![Value::unsigned(5, u64::MAX)]);
    }

    #[test]
    fn test_delete_entry_roundtrip() {
        let entry = WalEntry::delete_range(vec![SeriesKey::from("a"), SeriesKey::from("b")], -5, 5);
        assert_eq!(WalEntry::decode(&entry.encode(7)).unwrap(), (7, entry));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WalEntry::decode(&[]).is_err());
        assert!(WalEntry::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());

        let mut bytes = WalEntry::write(SeriesKey::from("k"), vec![Value::integer(1, 1)]).encode(1);
        bytes.push(0);
        assert!(WalEntry::decode(&bytes).is_err());
        bytes.truncate(bytes.len() - 3);
        assert!(WalEntry::decode(&bytes).is_err());
    }
}
