//! TSM file writer.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (8 bytes)                                            │
//! │  - Magic: "TSM1" (4 bytes)                                   │
//! │  - Version: u8, Level: u8, Reserved: 2 bytes                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data Blocks (key order, then time order)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Index (keys, block types, block locations)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Bloom filter over keys                                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (36 bytes)                                           │
//! │  - Index offset/size, bloom size, counts, CRC, "1MST"        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Files are written to `<name>.tsm.tmp` and renamed into place by
//! [`TsmWriter::finish`], so a half-written file is never visible under its
//! final name.

use crate::error::{Result, TsmError};
use crate::tsm::block::{self, RawBlock};
use crate::tsm::index::{IndexEntry, TsmIndex};
use crate::tsm::{SeriesKey, Timestamp, Value};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the TSM file header.
pub const TSM_MAGIC: [u8; 4] = *b"TSM1";

/// Reverse magic bytes for the TSM file footer.
pub const TSM_MAGIC_REVERSE: [u8; 4] = *b"1MST";

/// Current TSM file format version.
pub const TSM_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 36;

/// Extension of in-progress files.
pub const TMP_EXTENSION: &str = "tsm.tmp";

/// TSM file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsmHeader {
    /// File format version.
    pub version: u8,
    /// Compaction level (1 = flushed from the cache).
    pub level: u8,
}

impl TsmHeader {
    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&TSM_MAGIC)?;
        writer.write_all(&[self.version, self.level, 0, 0])?;
        Ok(())
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::InvalidMagic` or `TsmError::UnsupportedVersion`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != TSM_MAGIC {
            return Err(TsmError::InvalidMagic(magic));
        }
        let version = buf[4];
        if version == 0 || version > TSM_VERSION {
            return Err(TsmError::UnsupportedVersion(u16::from(version)));
        }

        Ok(Self {
            version,
            level: buf[5],
        })
    }
}

/// TSM file footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TsmFooter {
    /// Offset of the index from file start.
    pub index_offset: u64,
    /// Size of the index in bytes.
    pub index_size: u32,
    /// Size of the Bloom filter in bytes (it directly follows the index).
    pub bloom_size: u32,
    /// Number of distinct keys.
    pub key_count: u32,
    /// Total number of values.
    pub point_count: u64,
    /// CRC32 over the index and Bloom filter bytes.
    pub index_crc32: u32,
}

impl TsmFooter {
    /// Writes the footer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.index_size.to_le_bytes())?;
        writer.write_all(&self.bloom_size.to_le_bytes())?;
        writer.write_all(&self.key_count.to_le_bytes())?;
        writer.write_all(&self.point_count.to_le_bytes())?;
        writer.write_all(&self.index_crc32.to_le_bytes())?;
        writer.write_all(&TSM_MAGIC_REVERSE)?;
        Ok(())
    }

    /// Parses a footer from exactly [`FOOTER_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::InvalidMagic` if the reverse magic bytes don't match.
    pub fn from_bytes(buf: &[u8; FOOTER_SIZE]) -> Result<Self> {
        let magic = [buf[32], buf[33], buf[34], buf[35]];
        if magic != TSM_MAGIC_REVERSE {
            return Err(TsmError::InvalidMagic(magic));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };

        Ok(Self {
            index_offset: u64_at(0),
            index_size: u32_at(8),
            bloom_size: u32_at(12),
            key_count: u32_at(16),
            point_count: u64_at(20),
            index_crc32: u32_at(28),
        })
    }
}

/// Summary of a finished file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsmFileMeta {
    /// Final path of the file.
    pub path: PathBuf,
    /// Compaction level recorded in the header.
    pub level: u8,
    /// Number of distinct keys.
    pub key_count: usize,
    /// Number of blocks.
    pub block_count: usize,
    /// Number of values.
    pub point_count: u64,
    /// File size in bytes.
    pub size: u64,
    /// Smallest timestamp in the file.
    pub min_time: Timestamp,
    /// Largest timestamp in the file.
    pub max_time: Timestamp,
}

/// Fsyncs the directory containing `path` so a rename or unlink is durable.
pub(crate) fn sync_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Streams sorted series into a new TSM file.
pub struct TsmWriter {
    writer: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    position: u64,
    index: TsmIndex,
    max_points_per_block: usize,
    level: u8,
    point_count: u64,
}

impl TsmWriter {
    /// Creates a writer whose output will appear at `final_path` on finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be created.
    pub fn create(final_path: &Path, max_points_per_block: usize) -> Result<Self> {
        let tmp_path = final_path.with_extension(TMP_EXTENSION);
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        TsmHeader {
            version: TSM_VERSION,
            level: 1,
        }
        .write_to(&mut writer)?;

        Ok(Self {
            writer: Some(writer),
            tmp_path,
            final_path: final_path.to_path_buf(),
            position: HEADER_SIZE as u64,
            index: TsmIndex::new(),
            max_points_per_block: max_points_per_block.max(1),
            level: 1,
            point_count: 0,
        })
    }

    /// Sets the compaction level recorded in the header.
    pub fn set_level(&mut self, level: u8) {
        self.level = level;
    }

    /// Bytes written so far, excluding index and footer.
    pub fn size(&self) -> u64 {
        self.position
    }

    /// Number of keys written so far.
    pub fn key_count(&self) -> usize {
        self.index.key_count()
    }

    /// Number of values written so far.
    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    /// Last key written.
    pub fn last_key(&self) -> Option<&SeriesKey> {
        self.index.last_key()
    }

    fn out(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("TSM writer already finished"))
    }

    /// Writes all values of one key.
    ///
    /// Values must be sorted by timestamp without duplicates and share one kind.
    /// They are split into blocks of at most `max_points_per_block` values.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::UnsortedInput` if `key` does not sort after the previous
    /// key or timestamps are not strictly increasing,
    /// `TsmError::TypeMismatch` if kinds differ, and `TsmError::KeyTooLong`
    /// for a key the index cannot frame.
    pub fn write_series(&mut self, key: &SeriesKey, values: &[Value]) -> Result<()> {
        let Some(first) = values.first() else {
            return Ok(());
        };
        key.check_len()?;
        if self.index.last_key().is_some_and(|last| last >= key)
            || values.windows(2).any(|w| w[0].timestamp >= w[1].timestamp)
        {
            return Err(TsmError::UnsortedInput {
                key: key.to_string_lossy(),
            });
        }

        let block_type = first.block_type();
        for chunk in values.chunks(self.max_points_per_block) {
            let bytes = block::encode_block(block_type, chunk).map_err(|e| match e {
                TsmError::TypeMismatch {
                    expected, actual, ..
                } => TsmError::TypeMismatch {
                    key: key.to_string_lossy(),
                    expected,
                    actual,
                },
                other => other,
            })?;
            let min_time = chunk[0].timestamp;
            let max_time = chunk[chunk.len() - 1].timestamp;
            self.append_block(key, block_type, min_time, max_time, &bytes)?;
            self.point_count += chunk.len() as u64;
        }
        Ok(())
    }

    /// Appends an already-encoded block verbatim.
    ///
    /// Blocks of a key must arrive in time order without overlap.
    pub fn write_raw_block(&mut self, raw: &RawBlock) -> Result<()> {
        raw.key.check_len()?;
        let header = raw.verify()?;
        if let Some(last) = self.index.keys().last() {
            let out_of_order = match last.key.cmp(&raw.key) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => last.max_time() >= raw.min_time,
                std::cmp::Ordering::Less => false,
            };
            if out_of_order {
                return Err(TsmError::UnsortedInput {
                    key: raw.key.to_string_lossy(),
                });
            }
            if last.key == raw.key && last.block_type != raw.block_type {
                return Err(TsmError::TypeMismatch {
                    key: raw.key.to_string_lossy(),
                    expected: last.block_type,
                    actual: raw.block_type,
                });
            }
        }
        self.append_block(&raw.key, raw.block_type, raw.min_time, raw.max_time, &raw.bytes)?;
        self.point_count += u64::from(header.point_count);
        Ok(())
    }

    fn append_block(
        &mut self,
        key: &SeriesKey,
        block_type: crate::tsm::BlockType,
        min_time: Timestamp,
        max_time: Timestamp,
        bytes: &[u8],
    ) -> Result<()> {
        let offset = self.position;
        self.out()?.write_all(bytes)?;
        self.position += bytes.len() as u64;
        self.index.push(
            key,
            block_type,
            IndexEntry {
                min_time,
                max_time,
                offset,
                size: bytes.len() as u32,
            },
        );
        Ok(())
    }

    /// Writes index, Bloom filter and footer, fsyncs, and renames into place.
    ///
    /// # Errors
    ///
    /// Returns an error if any I/O operation fails; the temporary file is removed.
    pub fn finish(mut self) -> Result<TsmFileMeta> {
        match self.finish_inner() {
            Ok(meta) => Ok(meta),
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    fn finish_inner(&mut self) -> Result<TsmFileMeta> {
        let mut index_buf = Vec::new();
        self.index.write_to(&mut index_buf)?;
        let mut bloom_buf = Vec::new();
        self.index.build_bloom().write_to(&mut bloom_buf)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&index_buf);
        hasher.update(&bloom_buf);

        let footer = TsmFooter {
            index_offset: self.position,
            index_size: index_buf.len() as u32,
            bloom_size: bloom_buf.len() as u32,
            key_count: self.index.key_count() as u32,
            point_count: self.point_count,
            index_crc32: hasher.finalize(),
        };

        let level = self.level;
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::other("TSM writer already finished"))?;
        writer.write_all(&index_buf)?;
        writer.write_all(&bloom_buf)?;
        footer.write_to(&mut writer)?;

        // Patch the level into the header now that it is final.
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        {
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(5))?;
            file.write_all(&[level])?;
        }
        file.sync_all()?;
        let size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path)?;

        debug!(
            path = %self.final_path.display(),
            keys = footer.key_count,
            points = footer.point_count,
            size,
            "finished TSM file"
        );

        Ok(TsmFileMeta {
            path: self.final_path.clone(),
            level,
            key_count: self.index.key_count(),
            block_count: self.index.block_count(),
            point_count: self.point_count,
            size,
            min_time: self.index.min_time(),
            max_time: self.index.max_time(),
        })
    }

    /// Abandons the file and removes the temporary output.
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        self.writer = None;
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.tmp_path.display(), error = %e, "failed to remove temporary TSM file");
            }
        }
    }
}

impl Drop for TsmWriter {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.discard();
        }
    }
}
