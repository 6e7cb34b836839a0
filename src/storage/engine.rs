//! Pointstore History Engine
//!
//! The engine wires the pieces of the history pipeline together:
//! - Ingest path: Sample → RecentHistory (always) → WriteBehindArchiver (if eligible)
//! - Read path: RecentHistory → Archiver (queued + backend) → merge → decimate
//!
//! All state is shared behind `Arc`s; the engine itself is `Send + Sync` and
//! meant to be held in an `Arc` by the server layers that call it.

use crate::config::Config;
use crate::query::QueryExecutor;
use crate::storage::archiver::{open_backend, ArchiveBackend, ArchiverStats, WriteBehindArchiver};
use crate::storage::buffer::RecentHistory;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::registry::PointRegistry;
use crate::storage::types::{PointId, Sample, TimeRange, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The main history engine
pub struct HistoryEngine {
    registry: Arc<PointRegistry>,
    history: Arc<RecentHistory>,
    archiver: Arc<WriteBehindArchiver>,
    executor: QueryExecutor,
    shut_down: AtomicBool,
}

impl HistoryEngine {
    /// Build the engine from configuration, opening the configured backend
    ///
    /// Backend construction failures are returned, never papered over.
    pub fn open(config: &Config) -> StorageResult<Self> {
        config
            .validate()
            .map_err(|e| StorageError::Config(e.to_string()))?;
        let backend = open_backend(&config.archive)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Build the engine around an already constructed backend
    pub fn with_backend(config: &Config, backend: Arc<dyn ArchiveBackend>) -> Self {
        let registry = Arc::new(PointRegistry::from_configs(
            config.buffer.default_capacity,
            &config.points,
        ));
        let history = Arc::new(RecentHistory::new(Arc::clone(&registry)));
        let archiver = Arc::new(WriteBehindArchiver::new(
            backend,
            Arc::clone(&registry),
            config.archiver.clone(),
        ));
        let executor = QueryExecutor::new(Arc::clone(&history), Arc::clone(&archiver));

        tracing::info!(
            "History engine ready: {} configured points, {} backend",
            registry.len(),
            archiver.backend().name()
        );

        Self {
            registry,
            history,
            archiver,
            executor,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start the background flush and purge threads
    pub fn start(&self) -> StorageResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StorageError::ShutDown);
        }
        self.archiver.start()
    }

    /// Record a sample for a point
    ///
    /// The sample always enters the recent history. When `archive` is true it
    /// is also queued for persistence; archive trouble never affects the
    /// in-memory write. Returns the sample as stored, with its sequence number.
    pub fn ingest(&self, point: &PointId, sample: Sample, archive: bool) -> Sample {
        self.registry.ensure(point);
        let stored = self.history.record(point, sample);
        if archive {
            self.archiver.archive(point, stored.clone());
        }
        stored
    }

    /// Most recent sample of a point
    pub fn latest(&self, point: &PointId) -> Option<Sample> {
        self.history.latest(point)
    }

    /// Samples within `range`, decimated to `max_samples` when that is above 1
    pub fn range(
        &self,
        point: &PointId,
        range: TimeRange,
        max_samples: usize,
    ) -> StorageResult<Option<Vec<Sample>>> {
        self.executor.query(point, range, max_samples)
    }

    /// Last sample with `timestamp <= ts`
    pub fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        if self.history.earliest(point).is_some_and(|earliest| earliest <= ts) {
            return Ok(self.history.preceding_or_at(point, ts));
        }
        self.archiver.preceding_or_at(point, ts)
    }

    /// First sample with `timestamp >= ts`
    pub fn following_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        let buffered = self.history.following_or_at(point, ts);
        match self.history.earliest(point) {
            Some(earliest) if earliest <= ts => Ok(buffered),
            _ => {
                let archived = self.archiver.following_or_at(point, ts)?;
                Ok(match (archived, buffered) {
                    (Some(a), Some(b)) => Some(if b.timestamp < a.timestamp { b } else { a }),
                    (a, b) => a.or(b),
                })
            }
        }
    }

    /// Wait until the point has at least one sample
    pub fn blocking_latest(&self, point: &PointId) -> Sample {
        self.history.blocking_latest(point)
    }

    /// Wait until the point has at least one sample, then return its history
    pub fn blocking_all(&self, point: &PointId) -> Vec<Sample> {
        self.history.blocking_all(point)
    }

    pub fn blocking_latest_timeout(&self, point: &PointId, timeout: Duration) -> Option<Sample> {
        self.history.blocking_latest_timeout(point, timeout)
    }

    pub fn blocking_all_timeout(&self, point: &PointId, timeout: Duration) -> Option<Vec<Sample>> {
        self.history.blocking_all_timeout(point, timeout)
    }

    /// True while samples are waiting to be archived
    pub fn pending_exists(&self) -> bool {
        self.archiver.pending_exists()
    }

    /// Persist everything queued so far, returning the number of samples written
    pub fn flush(&self) -> StorageResult<usize> {
        self.archiver.flush_now()
    }

    /// Run one retention pass immediately
    pub fn purge(&self) -> usize {
        self.archiver.purge_pass(Duration::ZERO).unwrap_or(0)
    }

    pub fn registry(&self) -> &Arc<PointRegistry> {
        &self.registry
    }

    pub fn points(&self) -> Vec<PointId> {
        self.registry.points()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            backend: self.archiver.backend().name(),
            points: self.history.point_count(),
            buffered_samples: self.history.total_samples(),
            archiver: self.archiver.stats(),
        }
    }

    /// Stop the background threads and drain every pending queue
    ///
    /// Later calls are no-ops. Ingest keeps filling the recent history after
    /// shutdown but nothing more is archived.
    pub fn shutdown(&self) -> StorageResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.archiver.shutdown()?;
        tracing::info!("History engine shut down: {}", self.stats());
        Ok(())
    }
}

impl Drop for HistoryEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Shutdown flush failed: {}", e);
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub backend: &'static str,
    pub points: usize,
    pub buffered_samples: usize,
    pub archiver: ArchiverStats,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Backend: {}, Points: {}, Buffered: {}, Pending: {}, Persisted: {}, Dropped: {}, Failed batches: {}",
            self.backend,
            self.points,
            self.buffered_samples,
            self.archiver.pending_samples,
            self.archiver.persisted,
            self.archiver.dropped,
            self.archiver.failed_batches
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveConfig, BackendKind};
    use crate::storage::registry::PointConfig;
    use crate::storage::types::{now_micros, MICROS_PER_DAY};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, backend: BackendKind) -> Config {
        let point = PointId::new("siteA", "temp");
        let mut config = Config::default();
        config.archive = ArchiveConfig::new(dir.join("archive"));
        config.archive.temp_dir = Some(dir.join("tmp").to_string_lossy().to_string());
        config.archive.backend = backend;
        config.archiver.idle_delay_ms = 5;
        config.archiver.flush_point_delay_ms = 0;
        config.points = vec![PointConfig::new(&point).buffer_size(3).longevity_days(7)];
        config
    }

    fn create_test_engine() -> (HistoryEngine, PointId, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let engine = HistoryEngine::open(&test_config(dir.path(), BackendKind::Flatfile)).unwrap();
        (engine, PointId::new("siteA", "temp"), dir)
    }

    fn timestamps(samples: &[Sample]) -> Vec<Timestamp> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_end_to_end_before_flush() {
        let (engine, point, _dir) = create_test_engine();

        let base = engine.ingest(&point, Sample::new(0, 10.0), false).sequence;
        for t in 1..=4 {
            engine.ingest(&point, Sample::new(t, 10.0 + t as f64), false);
        }

        let buffered = engine.history.all(&point).unwrap();
        assert_eq!(timestamps(&buffered), vec![2, 3, 4]);
        let values: Vec<f64> = buffered.iter().filter_map(|s| s.value.as_f64()).collect();
        assert_eq!(values, vec![12.0, 13.0, 14.0]);
        let sequences: Vec<u64> = buffered.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![base + 2, base + 3, base + 4]);

        let result = engine.range(&point, TimeRange::new(0, 4), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), vec![2, 3, 4]);
    }

    #[test]
    fn test_archived_history_merges_with_buffer() {
        let (engine, point, _dir) = create_test_engine();
        for t in 0..10 {
            engine.ingest(&point, Sample::new(t, t as f64), true);
        }
        assert!(engine.pending_exists());
        assert_eq!(engine.flush().unwrap(), 10);
        assert!(!engine.pending_exists());

        let result = engine.range(&point, TimeRange::new(0, 9), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), (0..10).collect::<Vec<_>>());

        let decimated = engine.range(&point, TimeRange::new(0, 9), 5).unwrap().unwrap();
        assert!(decimated.len() <= 5);
        assert_eq!(decimated[0].timestamp, 0);
    }

    #[test]
    fn test_unarchived_samples_only_in_buffer() {
        let (engine, point, _dir) = create_test_engine();
        for t in 0..6 {
            engine.ingest(&point, Sample::new(t, t as f64), t % 2 == 0);
        }
        engine.flush().unwrap();

        // 0, 2 from the archive; 3, 4, 5 from the buffer
        let result = engine.range(&point, TimeRange::new(0, 5), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), vec![0, 2, 3, 4, 5]);
    }

    #[test]
    fn test_neighbours_across_buffer_and_archive() {
        let (engine, point, _dir) = create_test_engine();
        for t in [10, 20, 30, 40, 50] {
            engine.ingest(&point, Sample::new(t, t as f64), true);
        }
        engine.flush().unwrap();

        // Buffer holds 30..50
        assert_eq!(engine.preceding_or_at(&point, 45).unwrap().unwrap().timestamp, 40);
        assert_eq!(engine.preceding_or_at(&point, 25).unwrap().unwrap().timestamp, 20);
        assert!(engine.preceding_or_at(&point, 5).unwrap().is_none());

        assert_eq!(engine.following_or_at(&point, 15).unwrap().unwrap().timestamp, 20);
        assert_eq!(engine.following_or_at(&point, 35).unwrap().unwrap().timestamp, 40);
        assert!(engine.following_or_at(&point, 51).unwrap().is_none());
    }

    #[test]
    fn test_restart_reads_archive() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), BackendKind::Flatfile);
        let point = PointId::new("siteA", "temp");

        {
            let engine = HistoryEngine::open(&config).unwrap();
            engine.start().unwrap();
            for t in 0..20 {
                engine.ingest(&point, Sample::new(t, t as f64), true);
            }
            engine.shutdown().unwrap();
            assert_eq!(engine.stats().archiver.persisted, 20);
        }

        let engine = HistoryEngine::open(&config).unwrap();
        assert!(engine.latest(&point).is_none());
        let result = engine.range(&point, TimeRange::new(0, 19), 0).unwrap().unwrap();
        assert_eq!(result.len(), 20);
    }

    #[test]
    fn test_background_flush() {
        let (engine, point, _dir) = create_test_engine();
        engine.start().unwrap();
        engine.ingest(&point, Sample::new(1, 1.0), true);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.pending_exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.pending_exists());
        assert_eq!(engine.stats().archiver.persisted, 1);
    }

    #[test]
    fn test_purge_respects_longevity() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), BackendKind::Memory);
        let other = PointId::new("siteB", "temp");
        config.points.push(PointConfig::new(&other));
        let engine = HistoryEngine::open(&config).unwrap();
        let point = PointId::new("siteA", "temp");

        let old = now_micros() - 30 * MICROS_PER_DAY;
        engine.ingest(&point, Sample::new(old, 1.0), true);
        engine.ingest(&other, Sample::new(old, 1.0), true);
        engine.flush().unwrap();

        // siteB keeps everything, siteA drops the old sample
        assert_eq!(engine.purge(), 1);
        assert!(engine.archiver.preceding_or_at(&point, now_micros()).unwrap().is_none());
        assert!(engine.archiver.preceding_or_at(&other, now_micros()).unwrap().is_some());
    }

    #[test]
    fn test_shutdown_then_ingest() {
        let dir = tempdir().unwrap();
        let engine = HistoryEngine::open(&test_config(dir.path(), BackendKind::Memory)).unwrap();
        let point = PointId::new("siteX", "flag");

        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        assert!(matches!(engine.start(), Err(StorageError::ShutDown)));

        let stored = engine.ingest(&point, Sample::new(5, true), true);
        assert_eq!(engine.latest(&point), Some(stored));
        assert_eq!(engine.stats().archiver.dropped, 1);
        assert!(engine.points().contains(&point));
    }

    #[test]
    fn test_blocking_reads() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(
            HistoryEngine::open(&test_config(dir.path(), BackendKind::None)).unwrap(),
        );
        let point = PointId::new("siteA", "temp");

        assert!(engine
            .blocking_latest_timeout(&point, Duration::from_millis(10))
            .is_none());

        let writer = {
            let engine = Arc::clone(&engine);
            let point = point.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                engine.ingest(&point, Sample::new(7, 7.0), false);
            })
        };
        assert_eq!(engine.blocking_latest(&point).timestamp, 7);
        writer.join().unwrap();
        assert_eq!(engine.blocking_all(&point).len(), 1);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), BackendKind::Memory);
        config.archive.max_records = 0;
        assert!(matches!(HistoryEngine::open(&config), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_stats_display() {
        let dir = tempdir().unwrap();
        let engine = HistoryEngine::open(&test_config(dir.path(), BackendKind::Memory)).unwrap();
        engine.ingest(&PointId::new("siteA", "temp"), Sample::new(1, 1.0), true);
        let text = engine.stats().to_string();
        assert!(text.contains("Backend: memory"));
        assert!(text.contains("Pending: 1"));
    }
}
