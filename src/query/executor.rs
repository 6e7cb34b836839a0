//! Range query execution
//!
//! Answers "all samples of a point between two instants" by stitching the
//! archive and the in-memory history together:
//!
//! ```text
//! window = history.window(range)
//! window starts at or before range.start  → window
//! otherwise                               → archive ∪ queued, trimmed below
//!                                           the window start, then window
//! result → decimate(max_samples)
//! ```
//!
//! When the archive hit its per-query cap the merged result would have a
//! gap, so the recent window is left off and the caller sees a contiguous
//! prefix instead.

use crate::query::decimate::decimate;
use crate::storage::archiver::WriteBehindArchiver;
use crate::storage::buffer::RecentHistory;
use crate::storage::error::StorageResult;
use crate::storage::types::{PointId, Sample, TimeRange};
use std::sync::Arc;
use std::time::Instant;

/// Executes range queries over the recent history and the archive
pub struct QueryExecutor {
    history: Arc<RecentHistory>,
    archiver: Arc<WriteBehindArchiver>,
}

impl QueryExecutor {
    pub fn new(history: Arc<RecentHistory>, archiver: Arc<WriteBehindArchiver>) -> Self {
        Self { history, archiver }
    }

    /// Samples of `point` within `range`, oldest first
    ///
    /// Returns `None` when nothing is known for the range. A `max_samples` of
    /// 0 or 1 returns every sample found.
    pub fn query(
        &self,
        point: &PointId,
        range: TimeRange,
        max_samples: usize,
    ) -> StorageResult<Option<Vec<Sample>>> {
        if range.is_empty() {
            return Ok(None);
        }
        let started = Instant::now();

        let window = self.history.window(point, range).unwrap_or_default();
        let from_archive;

        let merged = match window.first() {
            Some(first) if first.timestamp <= range.start => {
                from_archive = 0;
                window
            }
            _ => {
                // Backends return records in append order, which late
                // samples leave out of time order
                let mut archived = self.archiver.extract(point, range)?;
                archived.sort_by_key(|s| s.timestamp);
                from_archive = archived.len();

                if self.archive_truncated(point, range, &archived)? {
                    tracing::debug!(
                        "Archive capped at {} records for {}, leaving recent samples off",
                        archived.len(),
                        point
                    );
                } else if let Some(first) = window.first() {
                    archived.retain(|s| s.timestamp < first.timestamp);
                    archived.extend(window);
                }
                archived
            }
        };

        let total = merged.len();
        let result = decimate(merged, range, max_samples);

        tracing::debug!(
            "Query {} [{}, {}]: {} samples ({} archived), {} returned in {:?}",
            point,
            range.start,
            range.end,
            total,
            from_archive,
            result.len(),
            started.elapsed()
        );

        Ok(if result.is_empty() { None } else { Some(result) })
    }

    /// Whether the archive stopped short of the range because of its cap
    ///
    /// Only a result at the cap can be short; it is short if another stored
    /// sample follows the last one returned while still inside the range.
    fn archive_truncated(
        &self,
        point: &PointId,
        range: TimeRange,
        archived: &[Sample],
    ) -> StorageResult<bool> {
        let last = match archived.last() {
            Some(last) if archived.len() >= self.archiver.backend().max_records() => last,
            _ => return Ok(false),
        };

        let Some(after) = last.timestamp.checked_add(1) else {
            return Ok(false);
        };
        Ok(self
            .archiver
            .following_or_at(point, after)?
            .is_some_and(|next| next.timestamp <= range.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiverConfig;
    use crate::storage::archiver::ArchiveBackend;
    use crate::storage::memory::MemoryArchive;
    use crate::storage::registry::{PointConfig, PointRegistry};
    use crate::storage::types::Timestamp;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Memory archive that counts extract calls
    struct CountingArchive {
        inner: MemoryArchive,
        extracts: AtomicUsize,
    }

    impl ArchiveBackend for CountingArchive {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn persist(&self, point: &PointId, batch: &[Sample]) -> StorageResult<()> {
            self.inner.persist(point, batch)
        }

        fn extract(&self, point: &PointId, range: TimeRange) -> StorageResult<Vec<Sample>> {
            self.extracts.fetch_add(1, Ordering::SeqCst);
            self.inner.extract(point, range)
        }

        fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
            self.inner.preceding_or_at(point, ts)
        }

        fn following_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
            self.inner.following_or_at(point, ts)
        }

        fn purge_older_than(&self, point: &PointId, age: Duration) -> StorageResult<usize> {
            self.inner.purge_older_than(point, age)
        }

        fn max_records(&self) -> usize {
            self.inner.max_records()
        }
    }

    fn create_test_executor(
        capacity: usize,
        max_records: usize,
    ) -> (QueryExecutor, Arc<RecentHistory>, Arc<CountingArchive>, PointId) {
        let point = PointId::new("siteA", "temp");
        let registry = Arc::new(PointRegistry::from_configs(
            100,
            &[PointConfig::new(&point).buffer_size(capacity)],
        ));
        let backend = Arc::new(CountingArchive {
            inner: MemoryArchive::new(max_records),
            extracts: AtomicUsize::new(0),
        });
        let archiver = Arc::new(WriteBehindArchiver::new(
            backend.clone(),
            Arc::clone(&registry),
            ArchiverConfig::default(),
        ));
        let history = Arc::new(RecentHistory::new(registry));
        (QueryExecutor::new(Arc::clone(&history), archiver), history, backend, point)
    }

    fn timestamps(samples: &[Sample]) -> Vec<Timestamp> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_merge_prefers_history_on_overlap() {
        let (executor, history, backend, point) = create_test_executor(5, 100);

        // Archive holds 1..=7 with stale values, history holds 6..=10
        let archived: Vec<Sample> = (1..=7).map(|t| Sample::new(t, -1.0)).collect();
        backend.persist(&point, &archived).unwrap();
        for t in 6..=10 {
            history.record(&point, Sample::new(t, t as f64));
        }

        let result = executor.query(&point, TimeRange::new(1, 10), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), (1..=10).collect::<Vec<_>>());
        assert_eq!(result[5].value.as_f64(), Some(6.0));
        assert_eq!(result[6].value.as_f64(), Some(7.0));
        assert_eq!(result[4].value.as_f64(), Some(-1.0));
    }

    #[test]
    fn test_late_archive_records_trimmed_and_ordered() {
        let (executor, history, backend, point) = create_test_executor(2, 100);

        // Stored in arrival order, 9 arrived late
        let archived: Vec<Sample> = [1, 9, 3, 5, 10].iter().map(|&t| Sample::new(t, -1.0)).collect();
        backend.persist(&point, &archived).unwrap();
        history.record(&point, Sample::new(5, 5.0));
        history.record(&point, Sample::new(10, 10.0));

        let result = executor.query(&point, TimeRange::new(0, 10), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), vec![1, 3, 5, 10]);
        assert_eq!(result[2].value.as_f64(), Some(5.0));
    }

    #[test]
    fn test_history_covering_range_skips_archive() {
        let (executor, history, backend, point) = create_test_executor(10, 100);
        for t in 0..10 {
            history.record(&point, Sample::new(t, t as f64));
        }

        let result = executor.query(&point, TimeRange::new(3, 6), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), vec![3, 4, 5, 6]);
        assert_eq!(backend.extracts.load(Ordering::SeqCst), 0);

        // Window starting after the range start needs the archive
        executor.query(&point, TimeRange::new(-5, 6), 0).unwrap();
        assert_eq!(backend.extracts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_truncated_archive_omits_history() {
        let (executor, history, backend, point) = create_test_executor(3, 4);
        let archived: Vec<Sample> = (0..8).map(|t| Sample::new(t, t as f64)).collect();
        backend.persist(&point, &archived).unwrap();
        for t in 8..11 {
            history.record(&point, Sample::new(t, t as f64));
        }

        let result = executor.query(&point, TimeRange::new(0, 10), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_archive_exactly_at_cap_still_merges() {
        let (executor, history, backend, point) = create_test_executor(3, 4);
        let archived: Vec<Sample> = (0..4).map(|t| Sample::new(t, t as f64)).collect();
        backend.persist(&point, &archived).unwrap();
        for t in 4..7 {
            history.record(&point, Sample::new(t, t as f64));
        }

        let result = executor.query(&point, TimeRange::new(0, 10), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_and_decimated() {
        let (executor, history, _backend, point) = create_test_executor(1000, 100);
        assert!(executor.query(&point, TimeRange::new(0, 10), 0).unwrap().is_none());
        assert!(executor.query(&point, TimeRange::new(10, 0), 0).unwrap().is_none());

        for t in 0..1000 {
            history.record(&point, Sample::new(t, t as f64));
        }
        let result = executor.query(&point, TimeRange::new(0, 999), 10).unwrap().unwrap();
        assert_eq!(result.len(), 10);
        assert_eq!(result[0].timestamp, 0);
    }

    #[test]
    fn test_queued_samples_visible() {
        let (executor, _history, _backend, point) = create_test_executor(3, 100);
        executor
            .archiver
            .archive_batch(&point, (0..5).map(|t| Sample::new(t, t as f64)));

        let result = executor.query(&point, TimeRange::new(0, 4), 0).unwrap().unwrap();
        assert_eq!(timestamps(&result), vec![0, 1, 2, 3, 4]);
    }
}
