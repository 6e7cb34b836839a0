//! Point registry
//!
//! Holds the per-point settings the core consumes: recent-history capacity
//! and archive longevity. Points are registered once at startup; unknown
//! points that show up at ingest time are added with the default capacity.

use crate::storage::types::PointId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Per-point configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointConfig {
    pub source: String,
    pub name: String,

    /// Recent-history capacity, `None` uses the buffer default
    #[serde(default)]
    pub buffer_size: Option<usize>,

    /// Days of archive to keep; 0 or negative never purges
    #[serde(default)]
    pub longevity_days: i64,
}

impl PointConfig {
    pub fn new(point: &PointId) -> Self {
        Self {
            source: point.source.clone(),
            name: point.name.clone(),
            buffer_size: None,
            longevity_days: 0,
        }
    }

    /// Builder method: set the recent-history capacity
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Builder method: set the retention in days
    pub fn longevity_days(mut self, days: i64) -> Self {
        self.longevity_days = days;
        self
    }

    pub fn id(&self) -> PointId {
        PointId::new(self.source.clone(), self.name.clone())
    }

    /// Retention as a duration, `None` when the point is never purged
    pub fn longevity(&self) -> Option<Duration> {
        if self.longevity_days > 0 {
            Some(Duration::from_secs((self.longevity_days as u64).saturating_mul(86_400)))
        } else {
            None
        }
    }
}

/// Registry of known points
#[derive(Debug)]
pub struct PointRegistry {
    points: RwLock<HashMap<PointId, PointConfig>>,
    default_capacity: usize,
}

impl PointRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Build a registry from configured points
    pub fn from_configs(default_capacity: usize, configs: &[PointConfig]) -> Self {
        let registry = Self::new(default_capacity);
        for config in configs {
            registry.register(config.clone());
        }
        registry
    }

    /// Register or replace a point's settings
    pub fn register(&self, config: PointConfig) {
        self.points.write().insert(config.id(), config);
    }

    /// Make sure a point is known, keeping existing settings
    pub fn ensure(&self, point: &PointId) {
        if self.points.read().contains_key(point) {
            return;
        }
        self.points
            .write()
            .entry(point.clone())
            .or_insert_with(|| PointConfig::new(point));
    }

    pub fn get(&self, point: &PointId) -> Option<PointConfig> {
        self.points.read().get(point).cloned()
    }

    /// Recent-history capacity for a point (never zero)
    pub fn capacity(&self, point: &PointId) -> usize {
        self.points
            .read()
            .get(point)
            .and_then(|c| c.buffer_size)
            .unwrap_or(self.default_capacity)
            .max(1)
    }

    pub fn longevity(&self, point: &PointId) -> Option<Duration> {
        self.points.read().get(point).and_then(|c| c.longevity())
    }

    /// All known points, sorted
    pub fn points(&self) -> Vec<PointId> {
        let mut points: Vec<PointId> = self.points.read().keys().cloned().collect();
        points.sort();
        points
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

impl Default for PointRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}
