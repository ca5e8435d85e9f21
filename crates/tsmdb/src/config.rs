//! Engine configuration.
//!
//! Every section has a `Default` suitable for production and `with_*`
//! builders for overrides:
//!
//! ```rust,ignore
//! use tsmdb::config::{CacheConfig, EngineConfig};
//! use tsmdb::wal::{SyncMode, WalConfig};
//!
//! let config = EngineConfig::default()
//!     .with_wal(WalConfig::default().with_sync_mode(SyncMode::Fdatasync))
//!     .with_cache(CacheConfig::default().with_max_size(256 * 1024 * 1024));
//! ```

use crate::cache::BackpressurePolicy;
use std::time::Duration;

pub use crate::lifecycle::compaction::{CompactionConfig, LevelConfig};
pub use crate::wal::{SyncMode, WalConfig};

/// Default cache ceiling (1 GiB).
pub const DEFAULT_CACHE_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Default active-generation size that triggers a flush (25 MiB).
pub const DEFAULT_SNAPSHOT_SIZE: u64 = 25 * 1024 * 1024;

/// Default age of unflushed data that triggers a flush (10 minutes).
pub const DEFAULT_SNAPSHOT_AGE: Duration = Duration::from_secs(10 * 60);

/// Default maximum values per block.
pub const DEFAULT_MAX_POINTS_PER_BLOCK: usize = 1000;

/// Cache sizing and admission control.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard ceiling on cached bytes; 0 disables the ceiling.
    pub max_size: u64,
    /// Active-generation size at which a flush is due.
    pub snapshot_size: u64,
    /// Time since the last snapshot after which non-empty data is flushed.
    pub snapshot_age: Duration,
    /// Behavior of writes that do not fit.
    pub backpressure: BackpressurePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            snapshot_size: DEFAULT_SNAPSHOT_SIZE,
            snapshot_age: DEFAULT_SNAPSHOT_AGE,
            backpressure: BackpressurePolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Sets the memory ceiling.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the flush size threshold.
    pub fn with_snapshot_size(mut self, snapshot_size: u64) -> Self {
        self.snapshot_size = snapshot_size;
        self
    }

    /// Sets the flush age threshold.
    pub fn with_snapshot_age(mut self, snapshot_age: Duration) -> Self {
        self.snapshot_age = snapshot_age;
        self
    }

    /// Sets the backpressure policy.
    pub fn with_backpressure(mut self, backpressure: BackpressurePolicy) -> Self {
        self.backpressure = backpressure;
        self
    }
}

/// TSM file layout settings.
#[derive(Debug, Clone)]
pub struct TsmConfig {
    /// Maximum values per block.
    pub max_points_per_block: usize,
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            max_points_per_block: DEFAULT_MAX_POINTS_PER_BLOCK,
        }
    }
}

impl TsmConfig {
    /// Sets the maximum values per block.
    pub fn with_max_points_per_block(mut self, max_points_per_block: usize) -> Self {
        self.max_points_per_block = max_points_per_block.max(1);
        self
    }
}

/// Background task timers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the flush task checks [`crate::Engine::should_flush`].
    pub flush_interval: Duration,
    /// How often the compaction task plans and runs compactions.
    pub compaction_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Sets the flush check interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the compaction interval.
    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Write-ahead log.
    pub wal: WalConfig,
    /// In-memory cache.
    pub cache: CacheConfig,
    /// TSM file layout.
    pub tsm: TsmConfig,
    /// Compaction planning.
    pub compaction: CompactionConfig,
    /// Background tasks.
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Replaces the WAL section.
    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Replaces the cache section.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replaces the TSM section.
    pub fn with_tsm(mut self, tsm: TsmConfig) -> Self {
        self.tsm = tsm;
        self
    }

    /// Replaces the compaction section.
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Replaces the scheduler section.
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_override_defaults() {
        let config = EngineConfig::default()
            .with_wal(WalConfig::default().with_sync_mode(SyncMode::None))
            .with_cache(CacheConfig::default().with_max_size(10).with_snapshot_size(5))
            .with_tsm(TsmConfig::default().with_max_points_per_block(0));

        assert_eq!(config.wal.sync_mode, SyncMode::None);
        assert_eq!(config.cache.max_size, 10);
        assert_eq!(config.cache.snapshot_size, 5);
        assert_eq!(config.tsm.max_points_per_block, 1);
        assert_eq!(config.cache.backpressure, BackpressurePolicy::Reject);
    }
}
