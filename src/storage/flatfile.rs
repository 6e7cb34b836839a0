//! Flat-file archive backend
//!
//! Layout: one directory per point, `<root>/<name with '.' as '/'>/<source>`,
//! holding time-named segment files (see [`crate::storage::segment`]) of
//! newline-delimited records (see [`crate::storage::record`]).
//!
//! Write path: append each batch to the active (newest) segment. Before
//! appending, the active segment is rotated when it is compressed, larger than
//! `max_segment_size`, or spans more than `max_segment_age`. Rotation
//! compresses the old segment and opens a new one named after the batch's
//! first record.
//!
//! Read path: select candidate segments by name, expand compressed ones into a
//! scratch file, and scan line by line. Unparsable lines and unreadable
//! segments are logged and skipped.
//!
//! The flush loop is the only writer per point; no locking is done here beyond
//! the active-segment cache.

use crate::config::ArchiveConfig;
use crate::storage::archiver::ArchiveBackend;
use crate::storage::compression;
use crate::storage::error::StorageResult;
use crate::storage::record::{decode_line, encode_line};
use crate::storage::segment::{SegmentCatalog, SegmentFile, SegmentName};
use crate::storage::types::{duration_micros, now_micros, PointId, Sample, TimeRange, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tuning for the flat-file backend
#[derive(Debug, Clone)]
pub struct FlatFileConfig {
    /// Archive root
    pub root: PathBuf,
    /// Scratch directory for expanded segments
    pub temp_dir: PathBuf,
    /// Rotate once the active segment is larger than this (bytes)
    pub max_segment_size: u64,
    /// Rotate once a batch starts this long after the segment, in sample time (µs)
    pub max_segment_age: Option<i64>,
    /// Most records returned by one extract
    pub max_records: usize,
}

impl FlatFileConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let archive = ArchiveConfig::default();
        Self {
            root: root.into(),
            temp_dir: archive.temp_dir(),
            max_segment_size: archive.max_segment_size,
            max_segment_age: archive.max_segment_age_micros(),
            max_records: archive.max_records,
        }
    }

    pub fn from_archive_config(archive: &ArchiveConfig) -> Self {
        Self {
            root: archive.archive_dir(),
            temp_dir: archive.temp_dir(),
            max_segment_size: archive.max_segment_size,
            max_segment_age: archive.max_segment_age_micros(),
            max_records: archive.max_records.max(1),
        }
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    pub fn max_segment_age(mut self, micros: Option<i64>) -> Self {
        self.max_segment_age = micros;
        self
    }

    pub fn max_records(mut self, max: usize) -> Self {
        self.max_records = max.max(1);
        self
    }
}

/// Archive of per-point segment files
pub struct FlatFileArchive {
    config: FlatFileConfig,
    /// Active segment per point, rescanned when the file disappears
    active: Mutex<HashMap<PointId, SegmentFile>>,
}

impl FlatFileArchive {
    pub fn open(config: FlatFileConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        tracing::info!("Flat-file archive at {:?}", config.root);
        Ok(Self {
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FlatFileConfig {
        &self.config
    }

    /// Directory holding a point's segments
    pub fn point_dir(&self, point: &PointId) -> PathBuf {
        let mut dir = self.config.root.clone();
        for part in point.name.split('.') {
            dir.push(part);
        }
        dir.push(&point.source);
        dir
    }

    /// Current listing of a point's segments
    pub fn catalog(&self, point: &PointId) -> StorageResult<SegmentCatalog> {
        point.validate()?;
        SegmentCatalog::scan(&self.point_dir(point))
    }

    /// Newest segment, from the cache when it still exists
    fn current_segment(&self, point: &PointId, dir: &Path) -> StorageResult<Option<SegmentFile>> {
        if let Some(cached) = self.active.lock().get(point) {
            if cached.path.exists() {
                return Ok(Some(cached.clone()));
            }
        }
        Ok(SegmentCatalog::scan(dir)?.latest().cloned())
    }

    /// Whether the batch starting at `first` goes to a fresh segment
    ///
    /// Age is measured in sample time, from the segment's name to the
    /// batch's first record, not against the wall clock. Segment names carry
    /// sample time, so replayed or back-dated data still fills segments of
    /// `max_segment_age` instead of rotating on every batch.
    fn needs_rotation(&self, segment: &SegmentFile, first: Timestamp) -> bool {
        if segment.is_compressed() {
            return true;
        }
        if segment.size() > self.config.max_segment_size {
            return true;
        }
        match self.config.max_segment_age {
            Some(max_age) => first.saturating_sub(segment.start()) > max_age,
            None => false,
        }
    }

    /// Pick the segment the batch starting at `first` is appended to
    fn segment_for_batch(
        &self,
        point: &PointId,
        dir: &Path,
        first: Timestamp,
    ) -> StorageResult<SegmentFile> {
        let current = self.current_segment(point, dir)?;

        let previous = match current {
            Some(segment) if !self.needs_rotation(&segment, first) => return Ok(segment),
            Some(segment) => {
                if !segment.is_compressed() {
                    tracing::debug!("Rotating {:?} ({} bytes)", segment.path, segment.size());
                    if let Err(e) = compression::compress_in_place(&segment.path) {
                        tracing::error!("Failed to compress {:?}: {}", segment.path, e);
                    }
                }
                Some(segment.name)
            }
            None => None,
        };

        let name = SegmentName::next_after(previous.as_ref(), first)?;
        let path = dir.join(name.file_name());
        File::create(&path)?;
        tracing::debug!("Started segment {:?}", path);
        Ok(SegmentFile { name, path })
    }

    /// Feed every parsable record of a segment to `visit` until it breaks
    ///
    /// Segments that cannot be opened or expanded are logged and skipped.
    fn scan_segment<F>(&self, segment: &SegmentFile, mut visit: F) -> ControlFlow<()>
    where
        F: FnMut(Sample) -> ControlFlow<()>,
    {
        // The scratch copy lives until the scan is done
        let (file, _scratch) = if segment.is_compressed() {
            match compression::decompress_to_scratch(&segment.path, &self.config.temp_dir) {
                Ok(scratch) => (scratch.reopen(), Some(scratch)),
                Err(e) => {
                    tracing::warn!("Skipping unreadable segment {:?}: {}", segment.path, e);
                    return ControlFlow::Continue(());
                }
            }
        } else {
            (File::open(&segment.path), None)
        };

        let file = match file {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Skipping segment {:?}: {}", segment.path, e);
                return ControlFlow::Continue(());
            }
        };

        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Read error in {:?}: {}", segment.path, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_line(&line) {
                Ok(sample) => {
                    if visit(sample).is_break() {
                        return ControlFlow::Break(());
                    }
                }
                Err(e) => {
                    tracing::warn!("{:?} line {}: {}", segment.path, number + 1, e);
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Expand a compressed segment back to plain text (CLI maintenance)
    pub fn decompress_segment(&self, segment: &SegmentFile) -> StorageResult<PathBuf> {
        compression::decompress_in_place(&segment.path)
    }

    /// Compress a segment that is not the active one (CLI maintenance)
    pub fn compress_segment(&self, point: &PointId, segment: &SegmentFile) -> StorageResult<PathBuf> {
        self.active.lock().remove(point);
        compression::compress_in_place(&segment.path)
    }
}

impl ArchiveBackend for FlatFileArchive {
    fn name(&self) -> &'static str {
        "flatfile"
    }

    fn persist(&self, point: &PointId, batch: &[Sample]) -> StorageResult<()> {
        let first = match batch.first() {
            Some(sample) => sample.timestamp,
            None => return Ok(()),
        };
        point.validate()?;

        let dir = self.point_dir(point);
        std::fs::create_dir_all(&dir)?;

        let segment = self.segment_for_batch(point, &dir, first)?;

        let file = OpenOptions::new().append(true).create(true).open(&segment.path)?;
        let mut writer = BufWriter::new(file);
        for sample in batch {
            writer.write_all(encode_line(sample).as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        tracing::debug!("Persisted {} samples for {} to {:?}", batch.len(), point, segment.path);
        self.active.lock().insert(point.clone(), segment);
        Ok(())
    }

    fn extract(&self, point: &PointId, range: TimeRange) -> StorageResult<Vec<Sample>> {
        let catalog = self.catalog(point)?;
        let max = self.config.max_records;
        let mut out = Vec::new();
        let mut truncated = false;

        for segment in catalog.select_range(range) {
            let _ = self.scan_segment(segment, |sample| {
                if sample.timestamp > range.end {
                    return ControlFlow::Break(());
                }
                if sample.timestamp >= range.start {
                    if out.len() >= max {
                        truncated = true;
                        return ControlFlow::Break(());
                    }
                    out.push(sample);
                }
                ControlFlow::Continue(())
            });
            if truncated {
                break;
            }
        }

        if truncated {
            tracing::warn!(
                "Extract for {} over [{}, {}] truncated at {} records",
                point,
                range.start,
                range.end,
                max
            );
        }
        Ok(out)
    }

    fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        let catalog = self.catalog(point)?;

        for segment in catalog.select_preceding(ts) {
            let mut found = None;
            let _ = self.scan_segment(segment, |sample| {
                if sample.timestamp > ts {
                    return ControlFlow::Break(());
                }
                found = Some(sample);
                ControlFlow::Continue(())
            });
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn following_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        let catalog = self.catalog(point)?;

        for segment in catalog.select_following(ts) {
            let mut found = None;
            let _ = self.scan_segment(segment, |sample| {
                if sample.timestamp >= ts {
                    found = Some(sample);
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            });
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn purge_older_than(&self, point: &PointId, age: Duration) -> StorageResult<usize> {
        let catalog = self.catalog(point)?;
        let cutoff = now_micros().saturating_sub(duration_micros(age));

        let mut removed = 0;
        for segment in catalog.older_than(cutoff) {
            match std::fs::remove_file(&segment.path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Could not purge {:?}: {}", segment.path, e),
            }
        }

        if removed > 0 {
            tracing::info!("Purged {} segments of {}", removed, point);
        }
        Ok(removed)
    }

    fn max_records(&self) -> usize {
        self.config.max_records
    }
}
