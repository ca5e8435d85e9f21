//! Deletion markers for immutable TSM files.
//!
//! A file's tombstones live in a sidecar next to it
//! (`000000001-000000001.tombstone` for `000000001-000000001.tsm`). The sidecar
//! is an append-only log: every delete batch is one CRC-framed record, synced
//! before the in-memory set changes.
//!
//! ```text
//! magic "TSTB" | version u8 | reserved [u8; 3]
//! records: len u32 | crc32 u32 | payload
//! payload: count u32 | count × (key_len u16 | key | min i64 | max i64)
//! ```
//!
//! A bad record at the very end of the sidecar is an interrupted append and is
//! cut off on load; a bad record anywhere else is corruption.

use crate::error::{Result, TsmError};
use crate::tsm::writer::sync_parent_dir;
use crate::tsm::{SeriesKey, Timestamp, Value};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const TOMBSTONE_MAGIC: [u8; 4] = *b"TSTB";
const TOMBSTONE_VERSION: u8 = 2;
const TOMBSTONE_EXTENSION: &str = "tombstone";
const HEADER_SIZE: usize = 8;
const FRAME_SIZE: usize = 8;

/// An inclusive deleted time span of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Deleted key.
    pub key: SeriesKey,
    /// First deleted timestamp (inclusive).
    pub min: Timestamp,
    /// Last deleted timestamp (inclusive).
    pub max: Timestamp,
}

/// The tombstone set of one file.
#[derive(Debug, Clone, Default)]
pub struct Tombstones {
    ranges: BTreeMap<SeriesKey, Vec<(Timestamp, Timestamp)>>,
    count: usize,
}

/// Returns the sidecar path for a TSM file path.
pub fn tombstone_path(tsm_path: &Path) -> PathBuf {
    tsm_path.with_extension(TOMBSTONE_EXTENSION)
}

/// Outcome of scanning a sidecar.
enum Scan {
    /// Every record is valid.
    Clean(Tombstones),
    /// Valid up to `offset`, followed by an interrupted append.
    TornTail(Tombstones, u64),
}

impl Tombstones {
    /// Loads the sidecar at `path`; a missing file is an empty set.
    ///
    /// An interrupted append at the end of the sidecar is truncated away.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CorruptFile` if the header is wrong or a record other
    /// than the last one is damaged.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| TsmError::CorruptFile {
            path: path.to_path_buf(),
            reason,
        };
        match Self::scan(&bytes).map_err(corrupt)? {
            Scan::Clean(tombstones) => Ok(tombstones),
            Scan::TornTail(tombstones, offset) => {
                warn!(path = %path.display(), offset, "truncating tombstone tail");
                OpenOptions::new().write(true).open(path)?.set_len(offset)?;
                Ok(tombstones)
            }
        }
    }

    fn scan(bytes: &[u8]) -> std::result::Result<Scan, String> {
        if bytes.len() < HEADER_SIZE {
            // A header that never finished writing holds no tombstones.
            return Ok(Scan::TornTail(Self::default(), 0));
        }
        if bytes[0..4] != TOMBSTONE_MAGIC {
            return Err("bad tombstone magic".to_string());
        }
        if bytes[4] != TOMBSTONE_VERSION {
            return Err(format!("unsupported tombstone version {}", bytes[4]));
        }

        let mut out = Self::default();
        let mut pos = HEADER_SIZE;
        while pos < bytes.len() {
            let remaining = bytes.len() - pos;
            if remaining < FRAME_SIZE {
                return Ok(Scan::TornTail(out, pos as u64));
            }
            let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
            let crc = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]]);
            let end = FRAME_SIZE as u64 + u64::from(len);
            if end > remaining as u64 {
                return Ok(Scan::TornTail(out, pos as u64));
            }
            let end = pos + end as usize;
            let payload = &bytes[pos + FRAME_SIZE..end];
            let batch = (crc32fast::hash(payload) == crc)
                .then(|| decode_batch(payload))
                .flatten();
            match batch {
                Some(batch) => batch.into_iter().for_each(|t| out.insert(t)),
                None if end == bytes.len() => return Ok(Scan::TornTail(out, pos as u64)),
                None => return Err(format!("bad tombstone record at offset {pos}")),
            }
            pos = end;
        }
        Ok(Scan::Clean(out))
    }

    fn insert(&mut self, t: Tombstone) {
        self.ranges.entry(t.key).or_default().push((t.min, t.max));
        self.count += 1;
    }

    /// Returns a copy extended with `new`, appended durably to `path`.
    ///
    /// The in-memory set is only replaced by the caller once the write succeeds.
    /// A failed append is cut back off the sidecar when possible.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::KeyTooLong` for a key the record cannot frame, or an
    /// I/O error if the append or sync fails.
    pub fn with_added(&self, path: &Path, new: &[Tombstone]) -> Result<Self> {
        new.iter().try_for_each(|t| t.key.check_len())?;
        let payload = encode_batch(new);

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let start = file.metadata()?.len();
        let mut record = Vec::with_capacity(HEADER_SIZE + FRAME_SIZE + payload.len());
        if start == 0 {
            record.extend_from_slice(&TOMBSTONE_MAGIC);
            record.extend_from_slice(&[TOMBSTONE_VERSION, 0, 0, 0]);
        }
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        record.extend_from_slice(&payload);

        let written = file.write_all(&record).and_then(|()| file.sync_data());
        if let Err(e) = written {
            if let Err(undo) = file.set_len(start) {
                warn!(path = %path.display(), error = %undo, "failed to roll back tombstone append");
            }
            return Err(e.into());
        }
        if start == 0 {
            sync_parent_dir(path)?;
        }

        let mut next = self.clone();
        for t in new {
            next.insert(t.clone());
        }
        Ok(next)
    }

    /// Returns every tombstone.
    pub fn iter(&self) -> impl Iterator<Item = Tombstone> + '_ {
        self.ranges.iter().flat_map(|(key, spans)| {
            spans.iter().map(move |&(min, max)| Tombstone {
                key: key.clone(),
                min,
                max,
            })
        })
    }

    /// Returns the deleted spans of one key.
    pub fn for_key(&self, key: &[u8]) -> &[(Timestamp, Timestamp)] {
        self.ranges.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if `ts` of `key` is deleted.
    pub fn covers(&self, key: &[u8], ts: Timestamp) -> bool {
        self.for_key(key).iter().any(|&(min, max)| ts >= min && ts <= max)
    }

    /// Returns true if any span of `key` intersects `[min, max]`.
    pub fn overlaps(&self, key: &[u8], min: Timestamp, max: Timestamp) -> bool {
        self.for_key(key).iter().any(|&(lo, hi)| lo <= max && hi >= min)
    }

    /// Drops deleted values of `key` from `values`.
    pub fn apply(&self, key: &[u8], values: &mut Vec<Value>) {
        let spans = self.for_key(key);
        if !spans.is_empty() {
            values.retain(|v| {
                !spans
                    .iter()
                    .any(|&(min, max)| v.timestamp >= min && v.timestamp <= max)
            });
        }
    }

    /// Number of tombstones.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if there are no tombstones.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn encode_batch(batch: &[Tombstone]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    for t in batch {
        buf.extend_from_slice(&(t.key.len() as u16).to_le_bytes());
        buf.extend_from_slice(t.key.as_bytes());
        buf.extend_from_slice(&t.min.to_le_bytes());
        buf.extend_from_slice(&t.max.to_le_bytes());
    }
    buf
}

fn decode_batch(payload: &[u8]) -> Option<Vec<Tombstone>> {
    let count = u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?) as usize;
    let mut pos = 4usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let key_len = u16::from_le_bytes(payload.get(pos..pos + 2)?.try_into().ok()?) as usize;
        pos += 2;
        let key = SeriesKey::from(payload.get(pos..pos + key_len)?);
        pos += key_len;
        let min = i64::from_le_bytes(payload.get(pos..pos + 8)?.try_into().ok()?);
        let max = i64::from_le_bytes(payload.get(pos + 8..pos + 16)?.try_into().ok()?);
        pos += 16;
        out.push(Tombstone { key, min, max });
    }
    (pos == payload.len()).then_some(out)
}
