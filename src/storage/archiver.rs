//! Write-behind archiver
//!
//! Archive-eligible samples are queued per point and persisted by a
//! background flush thread, so ingestion never waits on storage. A second
//! background thread enforces per-point retention once a day.
//!
//! Concurrency:
//! - the pending table has its own lock; inserts are O(1) appends
//! - the flush loop swaps a point's queue out under the lock and persists it
//!   outside the lock
//! - a writer lock keeps a single persister per table, so samples of one
//!   point reach the backend in the order they were queued
//!
//! Pending queues are bounded (`max_pending_per_point`). When the backend
//! falls behind, the oldest pending samples are dropped and counted.

use crate::config::{ArchiveConfig, ArchiverConfig, BackendKind};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::flatfile::{FlatFileArchive, FlatFileConfig};
use crate::storage::memory::{MemoryArchive, NullArchive};
use crate::storage::registry::PointRegistry;
use crate::storage::sqlite::SqliteArchive;
use crate::storage::types::{PointId, Sample, TimeRange, Timestamp};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Durable storage for point history
///
/// Implementations only need to be correct for a single writer per point;
/// reads may run concurrently with that writer.
pub trait ArchiveBackend: Send + Sync + 'static {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Append a time-ordered batch for a point
    fn persist(&self, point: &PointId, batch: &[Sample]) -> StorageResult<()>;

    /// Samples with `start <= timestamp <= end`, at most `max_records()` of
    /// them, in stored order (not necessarily time order)
    fn extract(&self, point: &PointId, range: TimeRange) -> StorageResult<Vec<Sample>>;

    /// Last sample with `timestamp <= ts`
    fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>>;

    /// First sample with `timestamp >= ts`
    fn following_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>>;

    /// Drop stored data older than `age`, returning the number of units removed
    fn purge_older_than(&self, point: &PointId, age: Duration) -> StorageResult<usize>;

    /// Cap on the number of records one extract returns
    fn max_records(&self) -> usize;
}

/// Construct the configured backend, failing on any problem
pub fn open_backend(config: &ArchiveConfig) -> StorageResult<Arc<dyn ArchiveBackend>> {
    let backend: Arc<dyn ArchiveBackend> = match config.backend {
        BackendKind::Flatfile => Arc::new(FlatFileArchive::open(
            FlatFileConfig::from_archive_config(config),
        )?),
        BackendKind::Sqlite => Arc::new(SqliteArchive::open(
            &config.sqlite_path(),
            config.max_records,
        )?),
        BackendKind::Memory => Arc::new(MemoryArchive::new(config.max_records)),
        BackendKind::None => Arc::new(NullArchive::new(config.max_records)),
    };
    tracing::info!("Using {} archive backend", backend.name());
    Ok(backend)
}

/// Archiver counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiverStats {
    pub pending_points: usize,
    pub pending_samples: usize,
    pub persisted: u64,
    pub dropped: u64,
    pub failed_batches: u64,
}

/// Queues samples per point and persists them from a background thread
pub struct WriteBehindArchiver {
    backend: Arc<dyn ArchiveBackend>,
    registry: Arc<PointRegistry>,
    config: ArchiverConfig,

    /// Point → samples not yet handed to the backend
    pending: Mutex<HashMap<PointId, VecDeque<Sample>>>,
    /// Signalled on every insert and on shutdown
    work: Condvar,
    /// Held for each take-and-persist
    writer: Mutex<()>,
    /// Batches taken from `pending` but not yet persisted
    in_flight: AtomicUsize,

    stopping: AtomicBool,
    sleeper: Mutex<()>,
    wake_sleepers: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,

    persisted: AtomicU64,
    dropped: AtomicU64,
    dropped_unreported: AtomicU64,
    failed_batches: AtomicU64,
}

impl WriteBehindArchiver {
    pub fn new(
        backend: Arc<dyn ArchiveBackend>,
        registry: Arc<PointRegistry>,
        config: ArchiverConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
            pending: Mutex::new(HashMap::new()),
            work: Condvar::new(),
            writer: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            sleeper: Mutex::new(()),
            wake_sleepers: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            persisted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dropped_unreported: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ArchiveBackend> {
        &self.backend
    }

    /// Spawn the flush and purge threads
    pub fn start(self: &Arc<Self>) -> StorageResult<()> {
        if self.is_stopping() {
            return Err(StorageError::ShutDown);
        }
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }

        let archiver = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("pointstore-flush".into())
                .spawn(move || archiver.flush_loop())?,
        );

        let archiver = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("pointstore-purge".into())
                .spawn(move || archiver.purge_loop())?,
        );

        tracing::info!("Archiver started ({} backend)", self.backend.name());
        Ok(())
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Queue one sample for persistence
    pub fn archive(&self, point: &PointId, sample: Sample) {
        self.archive_batch(point, std::iter::once(sample));
    }

    /// Queue several samples for persistence, in order
    pub fn archive_batch<I>(&self, point: &PointId, samples: I)
    where
        I: IntoIterator<Item = Sample>,
    {
        if self.is_stopping() {
            let rejected = samples.into_iter().count() as u64;
            self.dropped.fetch_add(rejected, Ordering::Relaxed);
            tracing::debug!("Archiver stopped, dropping {} samples for {}", rejected, point);
            return;
        }

        let limit = self.config.max_pending_per_point.max(1);
        let mut overflow = 0u64;
        {
            let mut pending = self.pending.lock();
            let queue = pending.entry(point.clone()).or_default();
            for sample in samples {
                queue.push_back(sample);
                if queue.len() > limit {
                    queue.pop_front();
                    overflow += 1;
                }
            }
            if queue.is_empty() {
                pending.remove(point);
            }
        }

        if overflow > 0 {
            self.dropped.fetch_add(overflow, Ordering::Relaxed);
            self.dropped_unreported.fetch_add(overflow, Ordering::Relaxed);
        }
        self.work.notify_all();
    }

    /// True while any sample is queued or being persisted
    pub fn pending_exists(&self) -> bool {
        let pending = self.pending.lock();
        !pending.is_empty() || self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Queued samples across all points
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(|q| q.len()).sum()
    }

    fn pending_points(&self) -> Vec<PointId> {
        self.pending.lock().keys().cloned().collect()
    }

    /// Take one point's queue and persist it
    ///
    /// Returns the number of samples persisted.
    fn flush_point(&self, point: &PointId) -> StorageResult<usize> {
        let _writer = self.writer.lock();

        let batch = {
            let mut pending = self.pending.lock();
            let batch = pending.remove(point);
            if batch.is_some() {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
            }
            batch
        };
        let batch: Vec<Sample> = match batch {
            Some(queue) => queue.into(),
            None => return Ok(0),
        };

        let result = if batch.is_empty() {
            Ok(())
        } else {
            self.backend.persist(point, &batch)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.persisted.fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::debug!("Flushed {} samples for {}", batch.len(), point);
                Ok(batch.len())
            }
            Err(e) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to archive {} samples for {}: {}", batch.len(), point, e);
                Err(e)
            }
        }
    }

    /// Persist everything queued right now, without pauses
    ///
    /// Every point is attempted; the first failure is returned at the end.
    pub fn flush_now(&self) -> StorageResult<usize> {
        let mut flushed = 0;
        let mut first_error = None;

        // Keep going until nothing is left; inserts may race with the drain
        loop {
            let points = self.pending_points();
            if points.is_empty() {
                break;
            }
            for point in points {
                match self.flush_point(&point) {
                    Ok(n) => flushed += n,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    fn report_drops(&self) {
        let dropped = self.dropped_unreported.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(
                "Archive is falling behind: dropped {} oldest pending samples",
                dropped
            );
        }
    }

    fn flush_loop(&self) {
        tracing::debug!("Flush loop running");
        while !self.is_stopping() {
            let points = self.pending_points();

            if points.is_empty() {
                let mut pending = self.pending.lock();
                if pending.is_empty() && !self.is_stopping() {
                    self.work.wait_for(&mut pending, self.config.idle_delay());
                }
                continue;
            }

            for point in points {
                if self.is_stopping() {
                    break;
                }
                // errors are logged in flush_point; the loop carries on
                let _ = self.flush_point(&point);
                thread::sleep(self.config.flush_point_delay());
            }
            self.report_drops();
        }
        tracing::debug!("Flush loop stopped");
    }

    /// Sleep for `duration` unless shutdown starts first; true when stopping
    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.sleeper.lock();
        while !self.is_stopping() {
            if self.wake_sleepers.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_stopping()
    }

    /// One retention pass over every known point
    ///
    /// Returns the number of purged units, or `None` if shutdown interrupted it.
    pub fn purge_pass(&self, point_delay: Duration) -> Option<usize> {
        let mut purged = 0;
        for point in self.registry.points() {
            if let Some(age) = self.registry.longevity(&point) {
                match self.backend.purge_older_than(&point, age) {
                    Ok(n) => purged += n,
                    Err(e) => tracing::error!("Purge failed for {}: {}", point, e),
                }
            }
            if self.sleep_unless_stopped(point_delay) {
                return None;
            }
        }
        Some(purged)
    }

    fn purge_loop(&self) {
        if self.sleep_unless_stopped(self.config.purge_initial_delay()) {
            return;
        }

        loop {
            let run_started = Instant::now();
            match self.purge_pass(self.config.purge_point_delay()) {
                Some(purged) => tracing::info!(
                    "Retention pass done in {:?}, {} segments purged",
                    run_started.elapsed(),
                    purged
                ),
                None => return,
            }

            let next_run = run_started + self.config.purge_interval();
            let wait = next_run.saturating_duration_since(Instant::now());
            if self.sleep_unless_stopped(wait) {
                return;
            }
        }
    }

    /// Stop both loops and persist whatever is still queued
    pub fn shutdown(&self) -> StorageResult<()> {
        let first = !self.stopping.swap(true, Ordering::SeqCst);

        if first {
            {
                let _guard = self.sleeper.lock();
                self.wake_sleepers.notify_all();
            }
            {
                let _pending = self.pending.lock();
                self.work.notify_all();
            }

            let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
            for handle in threads {
                if handle.join().is_err() {
                    tracing::error!("Archiver thread panicked");
                }
            }
        }

        let flushed = self.flush_now()?;
        if first {
            tracing::info!("Archiver stopped, {} samples flushed on shutdown", flushed);
        }
        Ok(())
    }

    fn pending_in(&self, point: &PointId, range: TimeRange) -> Vec<Sample> {
        self.pending
            .lock()
            .get(point)
            .map(|q| q.iter().filter(|s| range.contains(s.timestamp)).cloned().collect())
            .unwrap_or_default()
    }

    /// Archived samples in `range`, including ones still queued
    pub fn extract(&self, point: &PointId, range: TimeRange) -> StorageResult<Vec<Sample>> {
        let mut samples = self.backend.extract(point, range)?;
        let max = self.backend.max_records();

        // A capped result stays contiguous; queued data is newer still
        if samples.len() < max {
            let queued = self.pending_in(point, range);
            if !queued.is_empty() {
                samples.extend(queued);
                samples.sort_by_key(|s| s.timestamp);
                samples.truncate(max);
            }
        }
        Ok(samples)
    }

    /// Last archived or queued sample with `timestamp <= ts`
    pub fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        let queued = self
            .pending_in(point, TimeRange::until(ts))
            .into_iter()
            .max_by_key(|s| s.timestamp);
        let stored = self.backend.preceding_or_at(point, ts)?;

        Ok(match (stored, queued) {
            (Some(s), Some(q)) => Some(if s.timestamp > q.timestamp { s } else { q }),
            (s, q) => q.or(s),
        })
    }

    /// First archived or queued sample with `timestamp >= ts`
    pub fn following_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        let queued = self
            .pending_in(point, TimeRange::new(ts, Timestamp::MAX))
            .into_iter()
            .min_by_key(|s| s.timestamp);
        let stored = self.backend.following_or_at(point, ts)?;

        Ok(match (stored, queued) {
            (Some(s), Some(q)) => Some(if q.timestamp < s.timestamp { q } else { s }),
            (s, q) => s.or(q),
        })
    }

    pub fn stats(&self) -> ArchiverStats {
        let (pending_points, pending_samples) = {
            let pending = self.pending.lock();
            (pending.len(), pending.values().map(|q| q.len()).sum())
        };
        ArchiverStats {
            pending_points,
            pending_samples,
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::registry::PointConfig;

    fn fast_config() -> ArchiverConfig {
        ArchiverConfig {
            flush_point_delay_ms: 0,
            idle_delay_ms: 5,
            max_pending_per_point: 1000,
            purge_initial_delay_secs: 3600,
            purge_interval_secs: 3600,
            purge_point_delay_ms: 0,
        }
    }

    fn archiver_with(
        backend: Arc<dyn ArchiveBackend>,
        config: ArchiverConfig,
    ) -> Arc<WriteBehindArchiver> {
        Arc::new(WriteBehindArchiver::new(
            backend,
            Arc::new(PointRegistry::default()),
            config,
        ))
    }

    fn wait_until_settled(archiver: &WriteBehindArchiver) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while archiver.pending_exists() {
            assert!(Instant::now() < deadline, "flush loop never drained");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Backend that fails every write
    struct BrokenArchive;

    impl ArchiveBackend for BrokenArchive {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn persist(&self, _: &PointId, _: &[Sample]) -> StorageResult<()> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk on fire",
            )))
        }
        fn extract(&self, _: &PointId, _: TimeRange) -> StorageResult<Vec<Sample>> {
            Ok(Vec::new())
        }
        fn preceding_or_at(&self, _: &PointId, _: Timestamp) -> StorageResult<Option<Sample>> {
            Ok(None)
        }
        fn following_or_at(&self, _: &PointId, _: Timestamp) -> StorageResult<Option<Sample>> {
            Ok(None)
        }
        fn purge_older_than(&self, _: &PointId, _: Duration) -> StorageResult<usize> {
            Ok(0)
        }
        fn max_records(&self) -> usize {
            10
        }
    }

    #[test]
    fn test_flush_loop_persists_in_order() {
        let memory = Arc::new(MemoryArchive::new(1000));
        let archiver = archiver_with(memory.clone(), fast_config());
        archiver.start().unwrap();

        let point = PointId::new("siteA", "temp");
        for i in 0..50 {
            archiver.archive(&point, Sample::new(i, i as f64));
        }
        wait_until_settled(&archiver);

        let stored = memory.extract(&point, TimeRange::new(0, 100)).unwrap();
        let ts: Vec<i64> = stored.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, (0..50).collect::<Vec<_>>());
        assert_eq!(archiver.stats().persisted, 50);

        archiver.shutdown().unwrap();
    }

    #[test]
    fn test_reads_see_queued_samples() {
        let memory = Arc::new(MemoryArchive::new(1000));
        // not started: everything stays queued
        let archiver = archiver_with(memory.clone(), fast_config());
        let point = PointId::new("siteA", "temp");

        memory.persist(&point, &[Sample::new(10, 1.0), Sample::new(20, 2.0)]).unwrap();
        archiver.archive_batch(&point, vec![Sample::new(30, 3.0), Sample::new(40, 4.0)]);
        assert!(archiver.pending_exists());

        let all = archiver.extract(&point, TimeRange::new(0, 100)).unwrap();
        let ts: Vec<i64> = all.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![10, 20, 30, 40]);

        assert_eq!(archiver.preceding_or_at(&point, 35).unwrap().unwrap().timestamp, 30);
        assert_eq!(archiver.preceding_or_at(&point, 25).unwrap().unwrap().timestamp, 20);
        assert_eq!(archiver.following_or_at(&point, 25).unwrap().unwrap().timestamp, 30);
        assert_eq!(archiver.following_or_at(&point, 15).unwrap().unwrap().timestamp, 20);
        assert!(archiver.following_or_at(&point, 41).unwrap().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let memory = Arc::new(MemoryArchive::new(1000));
        let config = ArchiverConfig {
            max_pending_per_point: 3,
            ..fast_config()
        };
        let archiver = archiver_with(memory.clone(), config);
        let point = PointId::new("s", "p");

        for i in 0..5 {
            archiver.archive(&point, Sample::new(i, i as f64));
        }
        assert_eq!(archiver.pending_count(), 3);
        assert_eq!(archiver.stats().dropped, 2);

        archiver.flush_now().unwrap();
        let ts: Vec<i64> = memory
            .extract(&point, TimeRange::new(0, 10))
            .unwrap()
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(ts, vec![2, 3, 4]);
    }

    #[test]
    fn test_failed_batch_is_dropped_and_loop_continues() {
        let archiver = archiver_with(Arc::new(BrokenArchive), fast_config());
        archiver.start().unwrap();

        let point = PointId::new("s", "p");
        archiver.archive(&point, Sample::new(1, 1.0));
        wait_until_settled(&archiver);
        archiver.archive(&point, Sample::new(2, 2.0));
        wait_until_settled(&archiver);

        let stats = archiver.stats();
        assert_eq!(stats.failed_batches, 2);
        assert_eq!(stats.persisted, 0);
        archiver.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let memory = Arc::new(MemoryArchive::new(1000));
        let config = ArchiverConfig {
            // keep the loop asleep so shutdown does the work
            idle_delay_ms: 60_000,
            ..fast_config()
        };
        let archiver = archiver_with(memory.clone(), config);
        let point = PointId::new("s", "p");
        archiver.archive_batch(&point, (0..10).map(|i| Sample::new(i, 0.5)));

        archiver.shutdown().unwrap();
        assert!(!archiver.pending_exists());
        assert_eq!(memory.extract(&point, TimeRange::new(0, 10)).unwrap().len(), 10);

        // late samples are refused
        archiver.archive(&point, Sample::new(99, 1.0));
        assert!(!archiver.pending_exists());
        assert!(archiver.start().is_err());
    }

    #[test]
    fn test_purge_pass_honours_longevity() {
        let memory = Arc::new(MemoryArchive::new(1000));
        let registry = Arc::new(PointRegistry::default());
        let kept = PointId::new("s", "forever");
        let purged = PointId::new("s", "weekly");
        registry.register(PointConfig::new(&kept).longevity_days(0));
        registry.register(PointConfig::new(&purged).longevity_days(7));

        let old = crate::storage::types::now_micros() - 30 * crate::storage::types::MICROS_PER_DAY;
        memory.persist(&kept, &[Sample::new(old, 1.0)]).unwrap();
        memory.persist(&purged, &[Sample::new(old, 1.0)]).unwrap();

        let archiver = WriteBehindArchiver::new(memory.clone(), registry, fast_config());
        assert_eq!(archiver.purge_pass(Duration::ZERO), Some(1));
        assert!(memory.extract(&kept, TimeRange::new(old, old)).unwrap().len() == 1);
        assert!(memory.extract(&purged, TimeRange::new(old, old)).unwrap().is_empty());
    }

    #[test]
    fn test_open_backend_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ArchiveConfig::new(dir.path());

        config.backend = BackendKind::Memory;
        assert_eq!(open_backend(&config).unwrap().name(), "memory");
        config.backend = BackendKind::None;
        assert_eq!(open_backend(&config).unwrap().name(), "none");
        config.backend = BackendKind::Sqlite;
        assert_eq!(open_backend(&config).unwrap().name(), "sqlite");
        config.backend = BackendKind::Flatfile;
        assert_eq!(open_backend(&config).unwrap().name(), "flatfile");
    }
}
