//! tsmdb - single-node time-series storage engine
//!
//! Writes are made durable in a segmented write-ahead log, served from a
//! sharded in-memory cache, and periodically flushed into immutable,
//! compressed TSM files that a background compactor merges over time.
//!
//! # Components
//!
//! - [`Engine`]: the public read/write/delete API and lifecycle
//! - [`wal::Wal`]: CRC-framed, segmented write-ahead log
//! - [`cache::Cache`]: sharded cache with snapshots and backpressure
//! - [`TsmWriter`] / [`TsmReader`]: TSM file format I/O
//! - [`filestore::FileStore`]: the live, atomically swapped file set
//! - [`lifecycle`]: compaction and background scheduling
//!
//! # Example
//!
//! ```rust,ignore
//! use tsmdb::{Engine, EngineConfig, SeriesKey, Value};
//!
//! let engine = Engine::open("/var/lib/tsmdb", EngineConfig::default())?;
//! let key = SeriesKey::from_parts("cpu", &[("host", "a")], "usage");
//!
//! engine.write(key.clone(), vec![Value::float(1, 0.75)])?;
//! let values = engine.read_range(key.as_bytes(), 0, 2)?;
//!
//! engine.flush()?;
//! engine.close()?;
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod filestore;
pub mod lifecycle;
pub mod tsm;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineState, EngineStats};
pub use error::{Result, TsmError};
pub use filestore::FileId;
pub use lifecycle::compaction::CompactionSummary;
pub use tsm::{
    BlockType, FieldValue, SeriesKey, TimeRange, Timestamp, TsmReader, TsmWriter, Value,
};
pub use wal::{SyncMode, Wal, WalConfig, WalEntry};
