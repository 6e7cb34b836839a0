//! Pointstore Storage Engine
//!
//! This module provides the point-history storage pipeline:
//!
//! - **types**: Core data structures (PointId, Sample, Value, TimeRange)
//! - **registry**: Per-point buffer capacity and retention
//! - **buffer**: Bounded recent history per point, with blocking reads
//! - **archiver**: Backend contract plus the write-behind flush/purge engine
//! - **record**: Text line codec for archived samples
//! - **segment**: Segment file naming and selection
//! - **compression**: Zip compression of rotated segments
//! - **flatfile**, **sqlite**, **memory**: Archive backends
//! - **engine**: Main engine orchestrating all components
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Sample → RecentHistory → pending queue → flush thread → ArchiveBackend
//!
//! Read Path:
//!   Query → RecentHistory window → Archive (+ pending) → Merge → Decimate
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use pointstore::config::Config;
//! use pointstore::storage::{HistoryEngine, PointId, Sample, TimeRange};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = HistoryEngine::open(&Config::load_default())?;
//!     engine.start()?;
//!
//!     let point = PointId::parse("siteA.temp")?;
//!     engine.ingest(&point, Sample::now(21.5), true);
//!
//!     let recent = engine.range(&point, TimeRange::last_secs(60), 0)?;
//!     println!("{:?}", recent);
//!
//!     engine.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod archiver;
pub mod buffer;
pub mod compression;
pub mod engine;
pub mod error;
pub mod flatfile;
pub mod memory;
pub mod record;
pub mod registry;
pub mod segment;
pub mod sqlite;
pub mod types;

// Re-export commonly used types
pub use archiver::{open_backend, ArchiveBackend, ArchiverStats, WriteBehindArchiver};
pub use buffer::RecentHistory;
pub use engine::{EngineStats, HistoryEngine};
pub use error::{StorageError, StorageResult};
pub use flatfile::{FlatFileArchive, FlatFileConfig};
pub use memory::{MemoryArchive, NullArchive};
pub use registry::{PointConfig, PointRegistry};
pub use segment::{SegmentCatalog, SegmentFile, SegmentName};
pub use sqlite::SqliteArchive;
pub use types::{duration_micros, now_micros, PointId, Sample, TimeRange, Timestamp, Value};
