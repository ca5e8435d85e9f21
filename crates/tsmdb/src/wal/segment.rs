//! WAL segment files: header, naming and record-level reading.

use crate::error::{Result, TsmError};
use crate::wal::entry::WalEntry;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// WAL segment file extension.
pub(crate) const SEGMENT_EXTENSION: &str = "wal";

/// WAL segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// WAL file magic bytes.
const WAL_MAGIC: [u8; 4] = *b"TWAL";

/// WAL format version.
const WAL_VERSION: u16 = 1;

/// Size of the `[len u32][crc u32]` record frame.
pub(crate) const RECORD_HEADER_SIZE: usize = 8;

/// Largest record payload; appends beyond it are refused.
pub(crate) const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// WAL segment header.
#[derive(Debug, Clone)]
pub(crate) struct SegmentHeader {
    pub(crate) segment_id: u64,
    pub(crate) created_at: i64,
}

impl SegmentHeader {
    pub(crate) const SIZE: usize = 22; // 4 + 2 + 8 + 8

    pub(crate) fn new(segment_id: u64) -> Self {
        Self {
            segment_id,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
        }
    }

    pub(crate) fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&WAL_MAGIC)?;
        writer.write_all(&WAL_VERSION.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        Ok(())
    }

    fn from_bytes(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != WAL_MAGIC {
            return Err(TsmError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != WAL_VERSION {
            return Err(TsmError::UnsupportedVersion(version));
        }

        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[6..14]);
        let segment_id = u64::from_le_bytes(b);
        b.copy_from_slice(&buf[14..22]);
        let created_at = i64::from_le_bytes(b);

        Ok(Self {
            segment_id,
            created_at,
        })
    }
}

/// A segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment id, parsed from the file name.
    pub id: u64,
    /// Full path of the segment file.
    pub path: PathBuf,
    /// Size in bytes at listing time.
    pub size: u64,
}

/// Generates the path for a segment file.
pub(crate) fn segment_path(log_dir: &Path, segment_id: u64) -> PathBuf {
    log_dir.join(format!(
        "{}_{:016x}.{}",
        SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
    ))
}

/// Parses the segment ID from a segment file path.
pub(crate) fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(&format!("{}_", SEGMENT_PREFIX)))
        .and_then(|s| u64::from_str_radix(s, 16).ok())
}

/// Lists the segments of `log_dir` ordered by id.
///
/// A missing directory has no segments.
pub fn list_segments(log_dir: &Path) -> Result<Vec<SegmentInfo>> {
    let dir = match fs::read_dir(log_dir) {
        Ok(dir) => dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    for entry in dir {
        let entry = entry?;
        let path = entry.path();
        if let Some(id) = parse_segment_id(&path) {
            let size = entry.metadata()?.len();
            segments.push(SegmentInfo { id, path, size });
        }
    }
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

/// Sequential reader over the records of one segment.
///
/// Distinguishes a record cut short by end of file (`TruncatedSegment`) from a
/// complete record that fails validation (`CorruptSegment`). Deciding whether
/// either is recoverable is left to the caller, which knows whether this is the
/// last segment.
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    file_size: u64,
    header: Option<SegmentHeader>,
}

impl SegmentReader {
    /// Opens a segment and reads its header.
    ///
    /// A file shorter than a header yields a reader with no records whose
    /// [`has_header`](Self::has_header) is false.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = if file_size < SegmentHeader::SIZE as u64 {
            None
        } else {
            let mut buf = [0u8; SegmentHeader::SIZE];
            reader.read_exact(&mut buf)?;
            Some(SegmentHeader::from_bytes(&buf).map_err(|e| TsmError::CorruptSegment {
                path: path.to_path_buf(),
                offset: 0,
                reason: e.to_string(),
            })?)
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            offset: if header.is_some() { SegmentHeader::SIZE as u64 } else { 0 },
            file_size,
            header,
        })
    }

    /// Returns false if the file ended before a complete header.
    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    /// Segment id recorded in the header.
    pub fn segment_id(&self) -> Option<u64> {
        self.header.as_ref().map(|h| h.segment_id)
    }

    /// Segment creation time in nanoseconds since the Unix epoch.
    pub fn created_at(&self) -> Option<i64> {
        self.header.as_ref().map(|h| h.created_at)
    }

    /// Offset just past the last record returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn truncated(&self) -> TsmError {
        TsmError::TruncatedSegment {
            path: self.path.clone(),
            offset: self.offset,
        }
    }

    fn corrupt(&self, reason: String) -> TsmError {
        TsmError::CorruptSegment {
            path: self.path.clone(),
            offset: self.offset,
            reason,
        }
    }

    /// Reads the next record.
    ///
    /// Returns `Ok(None)` at a clean end of file. A record that runs past the
    /// end of file, or a bad record that is the last thing in the file, is
    /// `TruncatedSegment`; a bad record with more bytes after it is
    /// `CorruptSegment`. On error the offset is left at the start of the bad
    /// record.
    pub fn next_entry(&mut self) -> Result<Option<(u64, WalEntry)>> {
        if self.header.is_none() || self.offset == self.file_size {
            return Ok(None);
        }
        let remaining = self.file_size - self.offset;
        if remaining < RECORD_HEADER_SIZE as u64 {
            return Err(self.truncated());
        }

        let mut frame = [0u8; RECORD_HEADER_SIZE];
        self.reader.read_exact(&mut frame)?;
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let expected_crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);

        if len as u64 + RECORD_HEADER_SIZE as u64 > remaining {
            return Err(self.truncated());
        }
        if len == 0 {
            // Zero-filled space after the last write is a tail, anything else is not.
            return Err(if self.rest_is_zeroed(remaining - RECORD_HEADER_SIZE as u64)? {
                self.truncated()
            } else {
                self.corrupt("zero record length".to_string())
            });
        }
        if len > MAX_RECORD_SIZE {
            return Err(self.corrupt(format!("implausible record length {len}")));
        }

        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        let at_tail = len as u64 + RECORD_HEADER_SIZE as u64 == remaining;

        let actual_crc = crc32fast::hash(&data);
        if actual_crc != expected_crc {
            if at_tail {
                return Err(self.truncated());
            }
            return Err(self.corrupt(format!(
                "checksum mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
            )));
        }

        let (sequence, entry) = WalEntry::decode(&data).map_err(|reason| {
            if at_tail {
                self.truncated()
            } else {
                self.corrupt(reason)
            }
        })?;
        self.offset += (RECORD_HEADER_SIZE + len) as u64;
        Ok(Some((sequence, entry)))
    }

    fn rest_is_zeroed(&mut self, len: u64) -> Result<bool> {
        let mut rest = Vec::new();
        (&mut self.reader).take(len).read_to_end(&mut rest)?;
        Ok(rest.iter().all(|&b| b == 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_naming() {
        let dir = Path::new("/tmp/wal");
        let path = segment_path(dir, 0x2a);
        assert_eq!(path.file_name().unwrap(), "segment_000000000000002a.wal");
        assert_eq!(parse_segment_id(&path), Some(0x2a));
        assert_eq!(parse_segment_id(Path::new("/tmp/wal/segment_zz.wal")), None);
        assert_eq!(parse_segment_id(Path::new("/tmp/wal/segment_01.tmp")), None);
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        SegmentHeader::new(9).write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), SegmentHeader::SIZE);
        let parsed = SegmentHeader::from_bytes(buf.as_slice().try_into().unwrap()).unwrap();
        assert_eq!(parsed.segment_id, 9);

        buf[0] = b'X';
        assert!(matches!(
            SegmentHeader::from_bytes(buf.as_slice().try_into().unwrap()),
            Err(TsmError::InvalidMagic(_))
        ));
    }
}
