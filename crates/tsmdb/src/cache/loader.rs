//! Startup replay of WAL segments into a cache.

use crate::cache::{Cache, DeleteRecord};
use crate::error::{Result, TsmError};
use crate::wal::{SegmentInfo, SegmentReader, WalEntry};
use std::fs::{self, OpenOptions};
use tracing::{debug, info, warn};

/// Outcome of a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Highest sequence number replayed (0 if none).
    pub max_sequence: u64,
    /// Number of WAL entries replayed.
    pub entries: usize,
    /// Number of values written into the cache.
    pub values: usize,
    /// Deletes replayed, in log order, for re-application to TSM files.
    pub deletes: Vec<DeleteRecord>,
    /// Offset the last segment was truncated to, if it had a bad tail.
    pub truncated: Option<u64>,
}

/// Replays WAL segments into a [`Cache`].
///
/// Segments are replayed in id order through the same write and delete paths
/// the engine uses, without the memory ceiling. A partial record, or a bad
/// record that ends the last segment, ends the replay and is cut off the file.
/// A bad record with data after it is fatal, as is any damage to an earlier
/// segment.
#[derive(Debug)]
pub struct CacheLoader {
    segments: Vec<SegmentInfo>,
}

impl CacheLoader {
    /// Creates a loader over `segments`, which need not be sorted.
    pub fn new(mut segments: Vec<SegmentInfo>) -> Self {
        segments.sort_by_key(|s| s.id);
        Self { segments }
    }

    /// Replays every segment into `cache`.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CorruptSegment` for a bad record that is not the
    /// tail of the last segment, or an I/O error if a segment cannot be read.
    pub fn load(&self, cache: &Cache) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        let last = self.segments.len().saturating_sub(1);

        for (i, segment) in self.segments.iter().enumerate() {
            let is_last = i == last;
            let mut reader = match SegmentReader::open(&segment.path) {
                Ok(reader) => reader,
                Err(TsmError::CorruptSegment { .. }) if is_last => {
                    warn!(path = %segment.path.display(), "discarding WAL segment with bad header");
                    fs::remove_file(&segment.path)?;
                    summary.truncated = Some(0);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !reader.has_header() {
                if !is_last {
                    return Err(TsmError::CorruptSegment {
                        path: segment.path.clone(),
                        offset: 0,
                        reason: "incomplete segment header".to_string(),
                    });
                }
                warn!(path = %segment.path.display(), "discarding WAL segment with partial header");
                fs::remove_file(&segment.path)?;
                summary.truncated = Some(0);
                continue;
            }

            let mut entries = 0usize;
            loop {
                match reader.next_entry() {
                    Ok(Some((sequence, entry))) => {
                        self.apply(cache, sequence, entry, &mut summary)?;
                        entries += 1;
                    }
                    Ok(None) => break,
                    Err(e @ TsmError::TruncatedSegment { .. }) if is_last => {
                        let offset = reader.offset();
                        warn!(
                            path = %segment.path.display(),
                            offset,
                            error = %e,
                            "truncating WAL tail"
                        );
                        OpenOptions::new()
                            .write(true)
                            .open(&segment.path)?
                            .set_len(offset)?;
                        summary.truncated = Some(offset);
                        break;
                    }
                    Err(TsmError::TruncatedSegment { path, offset }) => {
                        return Err(TsmError::CorruptSegment {
                            path,
                            offset,
                            reason: "partial record before the last segment".to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            debug!(segment = segment.id, entries, "replayed WAL segment");
        }

        if summary.entries > 0 {
            info!(
                segments = self.segments.len(),
                entries = summary.entries,
                values = summary.values,
                max_sequence = summary.max_sequence,
                "WAL replay complete"
            );
        }
        Ok(summary)
    }

    fn apply(
        &self,
        cache: &Cache,
        sequence: u64,
        entry: WalEntry,
        summary: &mut LoadSummary,
    ) -> Result<()> {
        match entry {
            WalEntry::Write { values } => {
                for (key, series) in values {
                    // A batch that passed the type check at write time can only
                    // conflict if the series was deleted and rewritten; keep the
                    // rest of the log replayable.
                    match cache.write(&key, &series, sequence) {
                        Ok(()) => {
                            cache.force_reserve(Cache::charge_for(&series));
                            summary.values += series.len();
                        }
                        Err(e @ TsmError::TypeMismatch { .. }) => {
                            warn!(key = %key, sequence, error = %e, "skipping WAL values");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            WalEntry::DeleteRange { keys, min, max } => {
                cache.delete_range(&keys, min, max);
                summary.deletes.push(DeleteRecord { keys, min, max });
            }
        }
        summary.entries += 1;
        summary.max_sequence = summary.max_sequence.max(sequence);
        Ok(())
    }
}
