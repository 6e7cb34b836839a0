//! Recent-history buffer
//!
//! A bounded, insertion-ordered history of the latest samples for every point,
//! held entirely in memory.
//!
//! - One lock guards the whole point → history map; every operation,
//!   including eviction, runs inside it.
//! - One condition variable is shared by all points. Each insert wakes every
//!   blocked reader, and readers re-check their own point after waking.
//! - Sequence numbers are re-assigned on insert so each point's counter is
//!   gap-free regardless of upstream numbering.

use crate::storage::registry::PointRegistry;
use crate::storage::types::{PointId, Sample, TimeRange, Timestamp};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory recent history, keyed by point
pub struct RecentHistory {
    registry: Arc<PointRegistry>,
    histories: Mutex<HashMap<PointId, VecDeque<Sample>>>,
    arrived: Condvar,
}

impl RecentHistory {
    pub fn new(registry: Arc<PointRegistry>) -> Self {
        Self {
            registry,
            histories: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        }
    }

    /// Append a sample, evicting the oldest entries beyond the point's capacity
    ///
    /// Returns the sample as stored, carrying its final sequence number.
    pub fn record(&self, point: &PointId, mut sample: Sample) -> Sample {
        let capacity = self.registry.capacity(point);

        let mut histories = self.histories.lock();
        let history = histories.entry(point.clone()).or_default();

        if let Some(last) = history.back() {
            sample.sequence = last.sequence.wrapping_add(1);
        }
        history.push_back(sample.clone());
        while history.len() > capacity {
            history.pop_front();
        }
        drop(histories);

        self.arrived.notify_all();
        sample
    }

    /// Most recent sample, if the point was ever recorded
    pub fn latest(&self, point: &PointId) -> Option<Sample> {
        self.histories
            .lock()
            .get(point)
            .and_then(|h| h.back().cloned())
    }

    /// Buffered samples with `start <= timestamp <= end`
    ///
    /// `None` when the point has no buffer or nothing falls in range.
    pub fn window(&self, point: &PointId, range: TimeRange) -> Option<Vec<Sample>> {
        let histories = self.histories.lock();
        let samples: Vec<Sample> = histories
            .get(point)?
            .iter()
            .filter(|s| range.contains(s.timestamp))
            .cloned()
            .collect();

        if samples.is_empty() {
            None
        } else {
            Some(samples)
        }
    }

    /// The full buffer for a point
    pub fn all(&self, point: &PointId) -> Option<Vec<Sample>> {
        let histories = self.histories.lock();
        match histories.get(point) {
            Some(h) if !h.is_empty() => Some(h.iter().cloned().collect()),
            _ => None,
        }
    }

    /// Block until the point has data, then return its latest sample
    pub fn blocking_latest(&self, point: &PointId) -> Sample {
        let mut histories = self.histories.lock();
        loop {
            if let Some(sample) = histories.get(point).and_then(|h| h.back()) {
                return sample.clone();
            }
            self.arrived.wait(&mut histories);
        }
    }

    /// Block until the point has data, then return its whole buffer
    pub fn blocking_all(&self, point: &PointId) -> Vec<Sample> {
        let mut histories = self.histories.lock();
        loop {
            if let Some(history) = histories.get(point).filter(|h| !h.is_empty()) {
                return history.iter().cloned().collect();
            }
            self.arrived.wait(&mut histories);
        }
    }

    /// `blocking_latest` giving up after `timeout`
    pub fn blocking_latest_timeout(&self, point: &PointId, timeout: Duration) -> Option<Sample> {
        let deadline = Instant::now() + timeout;
        let mut histories = self.histories.lock();
        loop {
            if let Some(sample) = histories.get(point).and_then(|h| h.back()) {
                return Some(sample.clone());
            }
            if self.arrived.wait_until(&mut histories, deadline).timed_out() {
                return histories.get(point).and_then(|h| h.back().cloned());
            }
        }
    }

    /// `blocking_all` giving up after `timeout`
    pub fn blocking_all_timeout(&self, point: &PointId, timeout: Duration) -> Option<Vec<Sample>> {
        let deadline = Instant::now() + timeout;
        let mut histories = self.histories.lock();
        loop {
            if let Some(history) = histories.get(point).filter(|h| !h.is_empty()) {
                return Some(history.iter().cloned().collect());
            }
            if self.arrived.wait_until(&mut histories, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Earliest buffered timestamp for a point
    pub fn earliest(&self, point: &PointId) -> Option<Timestamp> {
        self.histories
            .lock()
            .get(point)
            .and_then(|h| h.front().map(|s| s.timestamp))
    }

    /// Last buffered sample with `timestamp <= ts`
    pub fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> Option<Sample> {
        self.histories
            .lock()
            .get(point)?
            .iter()
            .rev()
            .find(|s| s.timestamp <= ts)
            .cloned()
    }

    /// First buffered sample with `timestamp >= ts`
    pub fn following_or_at(&self, point: &PointId, ts: Timestamp) -> Option<Sample> {
        self.histories
            .lock()
            .get(point)?
            .iter()
            .find(|s| s.timestamp >= ts)
            .cloned()
    }

    /// Number of buffered samples for a point
    pub fn len(&self, point: &PointId) -> usize {
        self.histories.lock().get(point).map_or(0, |h| h.len())
    }

    /// Number of points with a buffer
    pub fn point_count(&self) -> usize {
        self.histories.lock().len()
    }

    /// Buffered samples across all points
    pub fn total_samples(&self) -> usize {
        self.histories.lock().values().map(|h| h.len()).sum()
    }
}
