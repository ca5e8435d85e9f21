//! Compaction planning and execution for TSM files.
//!
//! Flushed files start at level 1. Once a level accumulates more than its
//! `max_files` consecutive files, they are merged into files one level up.
//! Only runs adjacent in [`FileId`] order are merged together, so the output
//! can take the newest input's generation without reordering data relative to
//! files outside the run.

use crate::error::{Result, TsmError};
use crate::filestore::{discard_file, FileId, FileSet, FileStore, TsmFile};
use crate::lifecycle::merge::{KeyMerger, MergeInput, MergeStats, MergedSeries};
use crate::tsm::{TsmFileMeta, TsmWriter};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Compaction level configuration.
///
/// # Examples
/// ```rust,ignore
/// use tsmdb::lifecycle::compaction::LevelConfig;
///
/// let level = LevelConfig {
///     level: 1,
///     max_files: 4,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelConfig {
    /// Level number (1 = flushed).
    pub level: u8,
    /// Max number of consecutive files before compaction triggers.
    pub max_files: usize,
}

/// Compaction configuration for all levels.
///
/// # Examples
/// ```rust,ignore
/// use tsmdb::lifecycle::compaction::CompactionConfig;
///
/// let config = CompactionConfig::default().with_max_file_size(64 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Level configurations sorted by level.
    pub levels: Vec<LevelConfig>,
    /// Upper bound on files merged by one compaction.
    pub max_files_per_compaction: usize,
    /// Output files roll at the next key boundary past this size; files at or
    /// above it are not compacted again. 0 disables both.
    pub max_file_size: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                LevelConfig {
                    level: 1,
                    max_files: 4,
                },
                LevelConfig {
                    level: 2,
                    max_files: 4,
                },
                LevelConfig {
                    level: 3,
                    max_files: 4,
                },
                LevelConfig {
                    level: 4,
                    max_files: 8,
                },
            ],
            max_files_per_compaction: 16,
            max_file_size: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl CompactionConfig {
    /// Returns level configuration for the given level.
    pub fn level_config(&self, level: u8) -> Option<&LevelConfig> {
        self.levels.iter().find(|config| config.level == level)
    }

    /// Highest configured level.
    pub fn max_level(&self) -> u8 {
        self.levels.iter().map(|l| l.level).max().unwrap_or(1)
    }

    /// Replaces the level table.
    pub fn with_levels(mut self, levels: Vec<LevelConfig>) -> Self {
        self.levels = levels;
        self
    }

    /// Sets the per-compaction file cap.
    pub fn with_max_files_per_compaction(mut self, max: usize) -> Self {
        self.max_files_per_compaction = max.max(2);
        self
    }

    /// Sets the output size limit.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }
}

/// Files to merge together.
#[derive(Debug, Clone)]
pub struct CompactionGroup {
    /// Inputs, oldest first.
    pub files: Vec<Arc<TsmFile>>,
    /// Level recorded in the outputs.
    pub output_level: u8,
    /// Tombstone version of each input when the group was planned.
    pub tombstone_versions: Vec<(FileId, u64)>,
}

impl CompactionGroup {
    /// Builds a group, capturing the inputs' current tombstone versions.
    pub fn new(files: Vec<Arc<TsmFile>>, output_level: u8) -> Self {
        let tombstone_versions = files
            .iter()
            .map(|f| (f.id(), f.reader().tombstone_version()))
            .collect();
        Self {
            files,
            output_level,
            tombstone_versions,
        }
    }

    /// Input ids, oldest first.
    pub fn ids(&self) -> Vec<FileId> {
        self.files.iter().map(|f| f.id()).collect()
    }

    /// Generation the outputs take.
    pub fn output_generation(&self) -> u64 {
        self.files.iter().map(|f| f.id().generation).max().unwrap_or(0)
    }
}

/// Chooses which files to compact.
#[derive(Debug, Clone)]
pub struct CompactionPlanner {
    config: CompactionConfig,
}

impl CompactionPlanner {
    /// Creates a planner.
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Returns the compaction config.
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    fn is_full(&self, file: &TsmFile) -> bool {
        self.config.max_file_size > 0 && file.size() >= self.config.max_file_size
    }

    /// Plans compactions over `files`.
    ///
    /// Walks files in id order, forming runs of consecutive same-level files
    /// below the size limit. Every run longer than its level's `max_files` is
    /// split into groups of at most `max_files_per_compaction` files that never
    /// split a generation.
    pub fn plan(&self, files: &FileSet) -> Vec<CompactionGroup> {
        let mut runs: Vec<Vec<Arc<TsmFile>>> = Vec::new();
        let mut run: Vec<Arc<TsmFile>> = Vec::new();
        for file in files.iter() {
            if self.is_full(file) {
                runs.push(std::mem::take(&mut run));
                continue;
            }
            if run.last().is_some_and(|last| last.level() != file.level()) {
                runs.push(std::mem::take(&mut run));
            }
            run.push(file.clone());
        }
        runs.push(run);

        let mut groups = Vec::new();
        for run in runs {
            let Some(level) = run.first().map(|f| f.level()) else {
                continue;
            };
            let Some(level_config) = self.config.level_config(level) else {
                continue;
            };
            if run.len() <= level_config.max_files {
                continue;
            }
            let output_level = (level + 1).min(self.config.max_level());
            for chunk in self.split_run(run) {
                if chunk.len() >= 2 {
                    groups.push(CompactionGroup::new(chunk, output_level));
                }
            }
        }
        groups
    }

    fn split_run(&self, run: Vec<Arc<TsmFile>>) -> Vec<Vec<Arc<TsmFile>>> {
        let cap = self.config.max_files_per_compaction.max(2);
        let mut chunks = Vec::new();
        let mut rest = run.as_slice();
        while !rest.is_empty() {
            let mut end = rest.len().min(cap);
            if end < rest.len() {
                // Back off to a generation boundary, or extend to one if the
                // first generation alone exceeds the cap.
                let boundary_gen = rest[end].id().generation;
                let back = (1..=end)
                    .rev()
                    .find(|&e| rest[e - 1].id().generation != boundary_gen);
                end = match back {
                    Some(e) => e,
                    None => rest
                        .iter()
                        .position(|f| f.id().generation != boundary_gen)
                        .unwrap_or(rest.len()),
                };
            }
            chunks.push(rest[..end].to_vec());
            rest = &rest[end..];
        }
        chunks
    }
}

/// Outcome of one compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    /// Retired inputs.
    pub inputs: Vec<FileId>,
    /// Installed outputs.
    pub outputs: Vec<TsmFileMeta>,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Total values written.
    pub points_written: u64,
    /// Merge counters.
    pub merge: MergeStats,
}

/// Summary of an [`crate::Engine::compact`] pass.
#[derive(Debug, Clone, Default)]
pub struct CompactionSummary {
    /// Groups that completed and were installed.
    pub completed: Vec<CompactionResult>,
    /// Groups abandoned because their inputs changed or the pass was cancelled.
    pub aborted: usize,
}

impl CompactionSummary {
    /// Number of input files retired.
    pub fn files_compacted(&self) -> usize {
        self.completed.iter().map(|r| r.inputs.len()).sum()
    }
}

/// Merges groups of files into new files.
#[derive(Debug, Clone)]
pub struct Compactor {
    store: Arc<FileStore>,
    config: CompactionConfig,
    max_points_per_block: usize,
}

impl Compactor {
    /// Creates a compactor writing into `store`'s directory.
    pub fn new(store: Arc<FileStore>, config: CompactionConfig, max_points_per_block: usize) -> Self {
        Self {
            store,
            config,
            max_points_per_block,
        }
    }

    /// Writes the merged contents of `group` to new files.
    ///
    /// The outputs are finished on disk but not installed. On any error,
    /// including `Cancelled`, every output written so far is removed and the
    /// inputs are untouched.
    pub fn compact(&self, group: &CompactionGroup, cancel: &AtomicBool) -> Result<Vec<TsmFileMeta>> {
        let mut outputs = Vec::new();
        match self.compact_into(group, cancel, &mut outputs) {
            Ok(_) => Ok(outputs),
            Err(e) => {
                for meta in &outputs {
                    discard_file(&meta.path);
                }
                Err(e)
            }
        }
    }

    fn compact_into(
        &self,
        group: &CompactionGroup,
        cancel: &AtomicBool,
        outputs: &mut Vec<TsmFileMeta>,
    ) -> Result<MergeStats> {
        let inputs = group
            .files
            .iter()
            .map(|f| MergeInput {
                id: f.id(),
                blocks: f.reader().block_iter(),
                tombstones: f.reader().tombstones(),
            })
            .collect();
        let mut merger = KeyMerger::new(inputs, cancel);

        let generation = group.output_generation();
        let mut next_sequence = self.store.next_sequence(generation);
        let mut writer: Option<TsmWriter> = None;

        for item in merger.by_ref() {
            let (key, merged) = item?;
            let w = match writer {
                Some(ref mut w) => w,
                None => {
                    let path = self.store.file_path(FileId::new(generation, next_sequence));
                    next_sequence += 1;
                    let mut w = TsmWriter::create(&path, self.max_points_per_block)?;
                    w.set_level(group.output_level);
                    writer.insert(w)
                }
            };

            match merged {
                MergedSeries::Raw(blocks) => {
                    for block in &blocks {
                        w.write_raw_block(block)?;
                    }
                }
                MergedSeries::Values(values) => w.write_series(&key, &values)?,
            }

            if self.config.max_file_size > 0 && w.size() >= self.config.max_file_size {
                if let Some(full) = writer.take() {
                    Self::finish_output(full, outputs)?;
                }
            }
        }

        if let Some(w) = writer.take() {
            Self::finish_output(w, outputs)?;
        }
        Ok(merger.stats())
    }

    fn finish_output(writer: TsmWriter, outputs: &mut Vec<TsmFileMeta>) -> Result<()> {
        if writer.key_count() == 0 {
            writer.abort();
            return Ok(());
        }
        outputs.push(writer.finish()?);
        Ok(())
    }

    /// Compacts `group` and swaps the outputs in for the inputs.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CompactionFailure` if the inputs changed while
    /// merging; the outputs are discarded and the group can be replanned.
    pub fn run(&self, group: &CompactionGroup, cancel: &AtomicBool) -> Result<CompactionResult> {
        let started = Instant::now();
        let ids = group.ids();
        info!(
            inputs = ids.len(),
            output_level = group.output_level,
            generation = group.output_generation(),
            "compaction started"
        );

        let mut outputs = Vec::new();
        let merge = match self.compact_into(group, cancel, &mut outputs) {
            Ok(stats) => stats,
            Err(e) => {
                outputs.iter().for_each(|m| discard_file(&m.path));
                warn!(error = %e, "compaction aborted");
                return Err(e);
            }
        };

        let installed = outputs
            .iter()
            .map(|m| TsmFile::open(&m.path).map(Arc::new))
            .collect::<Result<Vec<_>>>()
            .and_then(|files| self.store.replace(&ids, files, &group.tombstone_versions));
        if let Err(e) = installed {
            outputs.iter().for_each(|m| discard_file(&m.path));
            warn!(error = %e, "compaction aborted");
            return Err(e);
        }

        let result = CompactionResult {
            inputs: ids,
            bytes_written: outputs.iter().map(|m| m.size).sum(),
            points_written: outputs.iter().map(|m| m.point_count).sum(),
            outputs,
            merge,
        };
        info!(
            inputs = result.inputs.len(),
            outputs = result.outputs.len(),
            bytes = result.bytes_written,
            duplicates = result.merge.duplicates_resolved,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(result)
    }
}

/// Plans and runs compactions until nothing is left to do or `cancel` is set.
pub(crate) fn compact_all(
    planner: &CompactionPlanner,
    compactor: &Compactor,
    store: &FileStore,
    cancel: &AtomicBool,
) -> Result<CompactionSummary> {
    let mut summary = CompactionSummary::default();
    loop {
        let groups = planner.plan(&store.files());
        if groups.is_empty() {
            break;
        }
        let mut progressed = false;
        for group in &groups {
            match compactor.run(group, cancel) {
                Ok(result) => {
                    summary.completed.push(result);
                    progressed = true;
                }
                Err(TsmError::Cancelled) => {
                    summary.aborted += 1;
                    return Ok(summary);
                }
                Err(e @ TsmError::CompactionFailure(_)) => {
                    debug!(error = %e, "compaction group skipped");
                    summary.aborted += 1;
                }
                Err(e) => return Err(e),
            }
        }
        if !progressed {
            break;
        }
    }
    Ok(summary)
}
