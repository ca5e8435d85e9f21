//! The live set of TSM files.
//!
//! Readers take an `Arc<FileSet>` snapshot and never block on installs or
//! compactions; mutations build a new set and swap it in under a short lock.
//! Files removed from the set are marked retired and physically deleted when
//! the last reference to them is dropped.

use crate::cache::entry::merge_tagged;
use crate::error::{Result, TsmError};
use crate::tsm::tombstone::tombstone_path;
use crate::tsm::{BlockType, SeriesKey, TimeRange, Timestamp, TsmReader, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// TSM file extension.
pub const TSM_EXTENSION: &str = "tsm";

/// Identity and age of a TSM file; larger ids hold newer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId {
    /// Flush generation.
    pub generation: u64,
    /// Position within the generation (compaction outputs share one).
    pub sequence: u32,
}

impl FileId {
    /// Creates a file id.
    pub fn new(generation: u64, sequence: u32) -> Self {
        Self {
            generation,
            sequence,
        }
    }

    /// File name for this id, e.g. `000000012-000000001.tsm`.
    pub fn file_name(&self) -> String {
        format!("{:09}-{:09}.{}", self.generation, self.sequence, TSM_EXTENSION)
    }

    /// Parses an id from a TSM file name.
    pub fn parse(path: &Path) -> Option<Self> {
        if path.extension()? != TSM_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (generation, sequence) = stem.split_once('-')?;
        Some(Self {
            generation: generation.parse().ok()?,
            sequence: sequence.parse().ok()?,
        })
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.sequence)
    }
}

/// An open TSM file owned by the file store.
pub struct TsmFile {
    id: FileId,
    reader: TsmReader,
    retired: AtomicBool,
}

impl fmt::Debug for TsmFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsmFile")
            .field("id", &self.id)
            .field("level", &self.reader.level())
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish()
    }
}

impl TsmFile {
    /// Opens the file at `path`, which must be named after its id.
    pub fn open(path: &Path) -> Result<Self> {
        let id = FileId::parse(path).ok_or_else(|| TsmError::CorruptFile {
            path: path.to_path_buf(),
            reason: "file name is not a TSM file id".to_string(),
        })?;
        Ok(Self {
            id,
            reader: TsmReader::open(path)?,
            retired: AtomicBool::new(false),
        })
    }

    /// File id.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Reader for the file.
    pub fn reader(&self) -> &TsmReader {
        &self.reader
    }

    /// Compaction level.
    pub fn level(&self) -> u8 {
        self.reader.level()
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Returns true once the file has left the live set.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Marks the file for deletion when its last reference drops.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for TsmFile {
    fn drop(&mut self) {
        if self.is_retired() {
            match self.reader.remove_files() {
                Ok(()) => debug!(file = %self.id, "deleted retired TSM file"),
                Err(e) => warn!(file = %self.id, error = %e, "failed to delete retired TSM file"),
            }
        }
    }
}

/// Immutable, id-ordered snapshot of the live files.
#[derive(Debug, Default)]
pub struct FileSet {
    files: Vec<Arc<TsmFile>>,
}

impl FileSet {
    fn new(mut files: Vec<Arc<TsmFile>>) -> Self {
        files.sort_by_key(|f| f.id);
        Self { files }
    }

    /// Files ordered oldest first.
    pub fn files(&self) -> &[Arc<TsmFile>] {
        &self.files
    }

    /// Iterates files oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<TsmFile>> {
        self.files.iter()
    }

    /// Looks a file up by id.
    pub fn get(&self, id: FileId) -> Option<&Arc<TsmFile>> {
        self.files
            .binary_search_by_key(&id, |f| f.id)
            .ok()
            .map(|i| &self.files[i])
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if there are no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Values of `key` within `range` across files, newer files winning.
    pub fn read_range(&self, key: &[u8], range: TimeRange) -> Result<Vec<Value>> {
        let mut runs = Vec::new();
        for (age, file) in self.files.iter().enumerate() {
            let reader = file.reader();
            let Some(k) = reader.key_index(key) else {
                continue;
            };
            if !range.overlaps(k.min_time(), k.max_time()) {
                continue;
            }
            let values = reader.read_range(key, range)?;
            runs.push(values.into_iter().map(|v| (v, age as u64)).collect());
        }
        Ok(merge_tagged(runs))
    }

    /// Payload kind of `key` in the newest file holding it.
    pub fn key_type(&self, key: &[u8]) -> Option<BlockType> {
        self.files.iter().rev().find_map(|f| f.reader().key_type(key))
    }
}

/// File store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStoreStats {
    /// Number of live files.
    pub file_count: usize,
    /// Bytes on disk across live files.
    pub total_size: u64,
    /// Stored values before tombstones.
    pub point_count: u64,
    /// Files carrying tombstones.
    pub tombstoned_files: usize,
    /// File count per compaction level.
    pub files_per_level: BTreeMap<u8, usize>,
}

/// Owner of the live file set.
pub struct FileStore {
    dir: PathBuf,
    current: RwLock<Arc<FileSet>>,
    mutate: Mutex<()>,
    next_generation: AtomicU64,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("dir", &self.dir)
            .field("files", &self.files().len())
            .finish()
    }
}

impl FileStore {
    /// Opens the store in `dir`, creating it if needed.
    ///
    /// Leftover temporary files are removed and every TSM file is opened and
    /// validated.
    ///
    /// # Errors
    ///
    /// Returns the first error from opening a TSM file; a corrupt file stops
    /// the open rather than silently dropping data.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        let mut sidecars = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.ends_with(".tmp") {
                debug!(path = %path.display(), "removing leftover temporary file");
                fs::remove_file(&path)?;
            } else if FileId::parse(&path).is_some() {
                files.push(Arc::new(TsmFile::open(&path)?));
            } else if path.extension().is_some_and(|e| e == "tombstone") {
                sidecars.push(path);
            }
        }

        for sidecar in sidecars {
            if !sidecar.with_extension(TSM_EXTENSION).exists() {
                debug!(path = %sidecar.display(), "removing orphaned tombstone file");
                fs::remove_file(&sidecar)?;
            }
        }

        let next_generation = files.iter().map(|f| f.id.generation).max().unwrap_or(0) + 1;
        let set = FileSet::new(files);
        info!(dir = %dir.display(), files = set.len(), next_generation, "opened file store");

        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(set)),
            mutate: Mutex::new(()),
            next_generation: AtomicU64::new(next_generation),
        })
    }

    fn lock_mutate(&self) -> MutexGuard<'_, ()> {
        self.mutate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn swap(&self, set: FileSet) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(set);
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current live set.
    pub fn files(&self) -> Arc<FileSet> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Allocates a fresh generation for a flush.
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::AcqRel)
    }

    /// Next free sequence of `generation` among live files.
    pub fn next_sequence(&self, generation: u64) -> u32 {
        self.files()
            .iter()
            .filter(|f| f.id.generation == generation)
            .map(|f| f.id.sequence)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Path a file with `id` lives at.
    pub fn file_path(&self, id: FileId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    /// Adds a finished file to the live set.
    pub fn install(&self, file: Arc<TsmFile>) -> Result<()> {
        let _guard = self.lock_mutate();
        let current = self.files();
        if current.get(file.id).is_some() {
            return Err(TsmError::CompactionFailure(format!(
                "file {} is already installed",
                file.id
            )));
        }
        let mut files = current.files.clone();
        debug!(file = %file.id, level = file.level(), size = file.size(), "installed TSM file");
        files.push(file);
        self.swap(FileSet::new(files));
        Ok(())
    }

    /// Atomically swaps `inputs` for `outputs`.
    ///
    /// `expected_versions` holds the tombstone version each input had when it
    /// was read. If any input is gone or has gained tombstones since, nothing
    /// changes and `CompactionFailure` is returned.
    pub fn replace(
        &self,
        inputs: &[FileId],
        outputs: Vec<Arc<TsmFile>>,
        expected_versions: &[(FileId, u64)],
    ) -> Result<()> {
        let _guard = self.lock_mutate();
        let current = self.files();

        for id in inputs {
            let Some(file) = current.get(*id) else {
                return Err(TsmError::CompactionFailure(format!("input {id} is no longer live")));
            };
            let expected = expected_versions
                .iter()
                .find(|(vid, _)| vid == id)
                .map(|(_, v)| *v);
            if expected != Some(file.reader().tombstone_version()) {
                return Err(TsmError::CompactionFailure(format!(
                    "input {id} gained tombstones during compaction"
                )));
            }
        }

        let (retired, mut kept): (Vec<_>, Vec<_>) = current
            .files
            .iter()
            .cloned()
            .partition(|f| inputs.contains(&f.id));
        kept.extend(outputs);
        self.swap(FileSet::new(kept));
        for file in &retired {
            file.retire();
        }
        debug!(inputs = retired.len(), "replaced TSM files");
        Ok(())
    }

    /// Removes files from the live set; they are deleted once unreferenced.
    pub fn retire(&self, ids: &[FileId]) -> usize {
        let _guard = self.lock_mutate();
        let current = self.files();
        let (retired, kept): (Vec<_>, Vec<_>) = current
            .files
            .iter()
            .cloned()
            .partition(|f| ids.contains(&f.id));
        self.swap(FileSet::new(kept));
        for file in &retired {
            file.retire();
        }
        retired.len()
    }

    /// Tombstones `[min, max]` of `keys` in every live file holding them.
    ///
    /// Returns the number of files that gained tombstones.
    pub fn delete_range(&self, keys: &[SeriesKey], min: Timestamp, max: Timestamp) -> Result<usize> {
        let _guard = self.lock_mutate();
        let mut touched = 0;
        for file in self.files().iter() {
            if file.reader().delete_range(keys, min, max)? {
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Values of `key` within `range`, newer files winning.
    pub fn read_range(&self, key: &[u8], range: TimeRange) -> Result<Vec<Value>> {
        self.files().read_range(key, range)
    }

    /// Payload kind of `key` in the newest file holding it.
    pub fn key_type(&self, key: &[u8]) -> Option<BlockType> {
        self.files().key_type(key)
    }

    /// Current statistics.
    pub fn stats(&self) -> FileStoreStats {
        let mut stats = FileStoreStats::default();
        for file in self.files().iter() {
            stats.file_count += 1;
            stats.total_size += file.size();
            stats.point_count += file.reader().point_count();
            if !file.reader().tombstones().is_empty() {
                stats.tombstoned_files += 1;
            }
            *stats.files_per_level.entry(file.level()).or_default() += 1;
        }
        stats
    }
}

/// Removes a file that was written but never installed.
pub(crate) fn discard_file(path: &Path) {
    for p in [path.to_path_buf(), tombstone_path(path)] {
        if let Err(e) = fs::remove_file(&p) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %p.display(), error = %e, "failed to remove discarded file");
            }
        }
    }
}
