//! K-way merge of TSM block streams.

use crate::cache::entry::merge_tagged;
use crate::error::{Result, TsmError};
use crate::filestore::FileId;
use crate::tsm::tombstone::Tombstones;
use crate::tsm::{BlockIterator, RawBlock, SeriesKey, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One merge source. Sources must be supplied oldest first.
pub(crate) struct MergeInput<'a> {
    pub(crate) id: FileId,
    pub(crate) blocks: BlockIterator<'a>,
    pub(crate) tombstones: Arc<Tombstones>,
}

/// The merged content of one series.
#[derive(Debug)]
pub(crate) enum MergedSeries {
    /// Blocks from a single untouched source, copied verbatim.
    Raw(Vec<RawBlock>),
    /// Decoded values, deduplicated with newer sources winning.
    Values(Vec<Value>),
}

/// Counters accumulated while merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Blocks copied without decoding.
    pub blocks_copied: u64,
    /// Blocks decoded and re-encoded.
    pub blocks_merged: u64,
    /// Values dropped because a newer source had the same timestamp.
    pub duplicates_resolved: u64,
    /// Values dropped by tombstones.
    pub tombstoned: u64,
}

/// Walks the sources in key order, yielding each series once.
pub(crate) struct KeyMerger<'a> {
    inputs: Vec<MergeInput<'a>>,
    cancel: &'a AtomicBool,
    stats: MergeStats,
}

impl<'a> KeyMerger<'a> {
    pub(crate) fn new(inputs: Vec<MergeInput<'a>>, cancel: &'a AtomicBool) -> Self {
        Self {
            inputs,
            cancel,
            stats: MergeStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> MergeStats {
        self.stats
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(TsmError::Cancelled);
        }
        Ok(())
    }

    fn next_key(&self) -> Option<SeriesKey> {
        self.inputs
            .iter()
            .filter_map(|input| input.blocks.peek_key())
            .min()
            .cloned()
    }

    /// Pulls every block of `key` from each source, preserving source order.
    fn take_blocks(&mut self, key: &SeriesKey) -> Result<Vec<(usize, Vec<RawBlock>)>> {
        let mut sources = Vec::new();
        for i in 0..self.inputs.len() {
            let mut blocks = Vec::new();
            while self.inputs[i].blocks.peek_key() == Some(key) {
                self.check_cancel()?;
                match self.inputs[i].blocks.next() {
                    Some(block) => blocks.push(block.map_err(|e| {
                        TsmError::CompactionFailure(format!("input {}: {e}", self.inputs[i].id))
                    })?),
                    None => break,
                }
            }
            if !blocks.is_empty() {
                sources.push((i, blocks));
            }
        }
        Ok(sources)
    }

    fn merge_key(&mut self, key: &SeriesKey) -> Result<MergedSeries> {
        let mut sources = self.take_blocks(key)?;

        if let [(i, _)] = sources.as_slice() {
            if self.inputs[*i].tombstones.for_key(key.as_bytes()).is_empty() {
                let (_, blocks) = sources.remove(0);
                self.stats.blocks_copied += blocks.len() as u64;
                return Ok(MergedSeries::Raw(blocks));
            }
        }

        let block_type = sources
            .iter()
            .rev()
            .find_map(|(_, blocks)| blocks.first().map(|b| b.block_type));
        let mut runs = Vec::with_capacity(sources.len());
        let mut decoded = 0u64;
        for (i, blocks) in sources {
            let input = &self.inputs[i];
            let mut values = Vec::new();
            for block in &blocks {
                self.check_cancel()?;
                if Some(block.block_type) != block_type {
                    return Err(TsmError::CompactionFailure(format!(
                        "series {key} has conflicting types across inputs"
                    )));
                }
                values.extend(block.decode().map_err(|e| {
                    TsmError::CompactionFailure(format!("input {}: {e}", input.id))
                })?);
            }
            let before = values.len() as u64;
            input.tombstones.apply(key.as_bytes(), &mut values);
            self.stats.tombstoned += before - values.len() as u64;
            self.stats.blocks_merged += blocks.len() as u64;
            decoded += values.len() as u64;
            // Source position is the age rank: later inputs are newer.
            runs.push(values.into_iter().map(|v| (v, i as u64)).collect());
        }

        let merged = merge_tagged(runs);
        self.stats.duplicates_resolved += decoded - merged.len() as u64;
        Ok(MergedSeries::Values(merged))
    }
}

impl Iterator for KeyMerger<'_> {
    type Item = Result<(SeriesKey, MergedSeries)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.check_cancel() {
            return Some(Err(e));
        }
        let key = self.next_key()?;
        Some(self.merge_key(&key).map(|merged| (key, merged)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsm::{TsmReader, TsmWriter};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn file(dir: &Path, name: &str, series: &[(&str, Vec<Value>)]) -> PathBuf {
        let path = dir.join(name);
        let mut w = TsmWriter::create(&path, 2).unwrap();
        for (k, v) in series {
            w.write_series(&SeriesKey::from(*k), v).unwrap();
        }
        w.finish().unwrap();
        path
    }

    fn inputs(readers: &[TsmReader]) -> Vec<MergeInput<'_>> {
        readers
            .iter()
            .enumerate()
            .map(|(i, r)| MergeInput {
                id: FileId::new(i as u64 + 1, 1),
                blocks: r.block_iter(),
                tombstones: r.tombstones(),
            })
            .collect()
    }

    #[test]
    fn test_merge_copies_unique_keys_and_dedups_shared() {
        let dir = TempDir::new().unwrap();
        let old = file(
            dir.path(),
            "a.tsm",
            &[
                ("k", vec![Value::integer(5, 10), Value::integer(6, 6)]),
                ("only-old", vec![Value::integer(1, 1)]),
            ],
        );
        let new = file(dir.path(), "b.tsm", &[("k", vec![Value::integer(5, 99)])]);
        let readers = vec![TsmReader::open(&old).unwrap(), TsmReader::open(&new).unwrap()];
        let cancel = AtomicBool::new(false);
        let mut merger = KeyMerger::new(inputs(&readers), &cancel);

        let (key, merged) = merger.next().unwrap().unwrap();
        assert_eq!(key, SeriesKey::from("k"));
        match merged {
            MergedSeries::Values(v) => {
                assert_eq!(v, vec![Value::integer(5, 99), Value::integer(6, 6)])
            }
            other => panic!("expected values, got {other:?}"),
        }

        let (key, merged) = merger.next().unwrap().unwrap();
        assert_eq!(key, SeriesKey::from("only-old"));
        assert!(matches!(merged, MergedSeries::Raw(ref b) if b.len() == 1));
        assert!(merger.next().is_none());

        let stats = merger.stats();
        assert_eq!(stats.duplicates_resolved, 1);
        assert_eq!(stats.blocks_copied, 1);
    }

    #[test]
    fn test_tombstones_force_decode() {
        let dir = TempDir::new().unwrap();
        let path = file(dir.path(), "a.tsm", &[("k", (0..4).map(|i| Value::float(i, 0.0)).collect())]);
        let reader = TsmReader::open(&path).unwrap();
        reader.delete_range(&[SeriesKey::from("k")], 1, 2).unwrap();
        let readers = vec![reader];
        let cancel = AtomicBool::new(false);
        let mut merger = KeyMerger::new(inputs(&readers), &cancel);

        match merger.next().unwrap().unwrap().1 {
            MergedSeries::Values(v) => {
                assert_eq!(v.iter().map(|v| v.timestamp).collect::<Vec<_>>(), vec![0, 3])
            }
            other => panic!("expected values, got {other:?}"),
        }
        assert_eq!(merger.stats().tombstoned, 2);
    }

    #[test]
    fn test_cancellation_observed() {
        let dir = TempDir::new().unwrap();
        let path = file(dir.path(), "a.tsm", &[("k", vec![Value::float(1, 1.0)])]);
        let readers = vec![TsmReader::open(&path).unwrap()];
        let cancel = AtomicBool::new(true);
        let mut merger = KeyMerger::new(inputs(&readers), &cancel);
        assert!(matches!(merger.next(), Some(Err(TsmError::Cancelled))));
    }
}
