//! # Pointstore
//!
//! Telemetry point-history engine: keeps a bounded recent history for every
//! point in memory, archives samples behind a write-behind queue, and answers
//! range queries by merging the two.
//!
//! ## Features
//!
//! - **Recent history**: bounded per-point buffers with blocking reads
//! - **Write-behind archiving**: background flush and retention threads
//! - **Flat-file archive**: per-point text segments, rotated and zip compressed
//! - **Range queries**: buffer/archive merge with time-based decimation
//!
//! ## Modules
//!
//! - [`storage`]: Buffer, archiver, backends and the engine tying them together
//! - [`query`]: Range query merge and decimation
//! - [`config`]: TOML configuration with environment overrides
//! - [`logging`]: Subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pointstore::config::Config;
//! use pointstore::storage::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = HistoryEngine::open(&Config::load_default())?;
//!     engine.start()?;
//!
//!     let point = PointId::parse("siteA.temp")?;
//!     for value in [20.5, 20.7, 21.0] {
//!         engine.ingest(&point, Sample::now(value), true);
//!     }
//!
//!     let last_hour = engine.range(&point, TimeRange::last_secs(3600), 100)?;
//!     println!("Found {} samples", last_hour.map_or(0, |s| s.len()));
//!
//!     // Graceful shutdown drains the archive queue
//!     engine.shutdown()?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod query;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    EngineStats, HistoryEngine, PointId, Sample, StorageError, StorageResult, TimeRange, Value,
};

pub use query::{decimate, QueryExecutor};

pub use config::{Config, ConfigError, LoggingConfig};
