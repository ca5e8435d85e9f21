//! File lifecycle: compaction planning, block merging, and the background
//! tasks that drive flushes and compactions.

pub mod compaction;
pub(crate) mod merge;
pub mod scheduler;

pub use compaction::{
    CompactionConfig, CompactionGroup, CompactionPlanner, CompactionResult, CompactionSummary,
    Compactor, LevelConfig,
};
pub use merge::MergeStats;
pub use scheduler::{BackgroundTask, CompactionTask, Context, FlushTask, Scheduler};
