//! Non-durable backends
//!
//! `MemoryArchive` keeps every persisted sample in process memory and loses
//! it on exit. `NullArchive` accepts writes and keeps nothing. Both satisfy
//! the same contract as the on-disk backends.

use crate::storage::archiver::ArchiveBackend;
use crate::storage::error::StorageResult;
use crate::storage::types::{duration_micros, now_micros, PointId, Sample, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Archive held entirely in memory
#[derive(Debug)]
pub struct MemoryArchive {
    points: RwLock<HashMap<PointId, Vec<Sample>>>,
    max_records: usize,
}

impl MemoryArchive {
    pub fn new(max_records: usize) -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            max_records: max_records.max(1),
        }
    }

    /// Stored samples for a point
    pub fn len(&self, point: &PointId) -> usize {
        self.points.read().get(point).map_or(0, |v| v.len())
    }
}

impl ArchiveBackend for MemoryArchive {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn persist(&self, point: &PointId, batch: &[Sample]) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.points
            .write()
            .entry(point.clone())
            .or_default()
            .extend_from_slice(batch);
        Ok(())
    }

    fn extract(&self, point: &PointId, range: TimeRange) -> StorageResult<Vec<Sample>> {
        let points = self.points.read();
        let samples: Vec<Sample> = match points.get(point) {
            Some(stored) => stored
                .iter()
                .filter(|s| range.contains(s.timestamp))
                .take(self.max_records)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        if samples.len() >= self.max_records {
            tracing::warn!("Extract for {} truncated at {} records", point, self.max_records);
        }
        Ok(samples)
    }

    fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        Ok(self.points.read().get(point).and_then(|stored| {
            stored
                .iter()
                .filter(|s| s.timestamp <= ts)
                .max_by_key(|s| s.timestamp)
                .cloned()
        }))
    }

    fn following_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        Ok(self.points.read().get(point).and_then(|stored| {
            stored
                .iter()
                .filter(|s| s.timestamp >= ts)
                .min_by_key(|s| s.timestamp)
                .cloned()
        }))
    }

    fn purge_older_than(&self, point: &PointId, age: Duration) -> StorageResult<usize> {
        let cutoff = now_micros().saturating_sub(duration_micros(age));
        let mut points = self.points.write();
        let removed = match points.get_mut(point) {
            Some(stored) => {
                let before = stored.len();
                stored.retain(|s| s.timestamp >= cutoff);
                before - stored.len()
            }
            None => 0,
        };
        Ok(removed)
    }

    fn max_records(&self) -> usize {
        self.max_records
    }
}

/// Backend that discards every write
#[derive(Debug)]
pub struct NullArchive {
    max_records: usize,
}

impl NullArchive {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
        }
    }
}

impl ArchiveBackend for NullArchive {
    fn name(&self) -> &'static str {
        "none"
    }

    fn persist(&self, _point: &PointId, _batch: &[Sample]) -> StorageResult<()> {
        Ok(())
    }

    fn extract(&self, _point: &PointId, _range: TimeRange) -> StorageResult<Vec<Sample>> {
        Ok(Vec::new())
    }

    fn preceding_or_at(&self, _point: &PointId, _ts: Timestamp) -> StorageResult<Option<Sample>> {
        Ok(None)
    }

    fn following_or_at(&self, _point: &PointId, _ts: Timestamp) -> StorageResult<Option<Sample>> {
        Ok(None)
    }

    fn purge_older_than(&self, _point: &PointId, _age: Duration) -> StorageResult<usize> {
        Ok(0)
    }

    fn max_records(&self) -> usize {
        self.max_records
    }
}
