//! Pointstore Query Engine
//!
//! Range queries over one point's history:
//!
//! - **executor**: merges the recent history with the archive (including
//!   samples still queued for persistence)
//! - **decimate**: time-based down-sampling to a maximum sample count
//!
//! # Example
//!
//! ```rust,no_run
//! use pointstore::config::Config;
//! use pointstore::storage::{HistoryEngine, PointId, TimeRange};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = HistoryEngine::open(&Config::default())?;
//!     let point = PointId::parse("siteA.temp")?;
//!
//!     // At most 500 samples spread over the last hour
//!     if let Some(samples) = engine.range(&point, TimeRange::last_secs(3600), 500)? {
//!         println!("{} samples", samples.len());
//!     }
//!     Ok(())
//! }
//! ```

mod decimate;
mod executor;

pub use decimate::decimate;
pub use executor::QueryExecutor;
