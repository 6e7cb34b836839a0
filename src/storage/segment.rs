//! Segment naming and selection for the flat-file archive
//!
//! Each point's archive directory holds a series of segment files. A segment
//! is named after the timestamp of the first record it holds, so a sorted
//! listing of names is also a time index:
//!
//! ```text
//! siteA/temp/
//!   20240301-000000.000000.zip   rotated, compressed
//!   20240302-061500.250000.zip
//!   20240303-120000.000000       active, appended to
//! ```
//!
//! Names from older archives carry minute resolution (`YYYYMMDD-HHMM`) and
//! are accepted when reading. A segment is not a closed interval: its last
//! record may be later than the next segment's name, and records of a range
//! may begin in the segment preceding it.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{TimeRange, Timestamp};
use chrono::{DateTime, NaiveDateTime};
use std::fmt;
use std::path::{Path, PathBuf};

/// Suffix marking a compressed segment
pub const COMPRESSED_SUFFIX: &str = ".zip";

const NAME_FORMAT: &str = "%Y%m%d-%H%M%S%.6f";
const PARSE_FORMAT: &str = "%Y%m%d-%H%M%S%.f";
const LEGACY_FORMAT: &str = "%Y%m%d-%H%M";

/// Decoded segment file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    /// Timestamp the name encodes
    pub start: Timestamp,
    /// Name without the compression suffix
    pub stem: String,
    pub compressed: bool,
}

impl SegmentName {
    /// Name for a new, uncompressed segment starting at `start`
    pub fn for_start(start: Timestamp) -> StorageResult<Self> {
        let stem = DateTime::from_timestamp_micros(start)
            .ok_or_else(|| StorageError::InvalidSegmentName(format!("timestamp {}", start)))?
            .format(NAME_FORMAT)
            .to_string();
        Ok(Self {
            start,
            stem,
            compressed: false,
        })
    }

    /// Decode a file name, with or without the compression suffix
    pub fn parse(file_name: &str) -> StorageResult<Self> {
        let (stem, compressed) = match file_name.strip_suffix(COMPRESSED_SUFFIX) {
            Some(stem) => (stem, true),
            None => (file_name, false),
        };

        let parsed = NaiveDateTime::parse_from_str(stem, PARSE_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(stem, LEGACY_FORMAT))
            .map_err(|_| StorageError::InvalidSegmentName(file_name.to_string()))?;

        Ok(Self {
            start: parsed.and_utc().timestamp_micros(),
            stem: stem.to_string(),
            compressed,
        })
    }

    /// Name for the segment following `previous`, first record at `first`
    pub fn next_after(previous: Option<&SegmentName>, first: Timestamp) -> StorageResult<Self> {
        let start = match previous {
            Some(prev) if prev.start >= first => prev.start + 1,
            _ => first,
        };
        Self::for_start(start)
    }

    /// File name on disk
    pub fn file_name(&self) -> String {
        if self.compressed {
            format!("{}{}", self.stem, COMPRESSED_SUFFIX)
        } else {
            self.stem.clone()
        }
    }

    /// The same segment after compression
    pub fn to_compressed(&self) -> Self {
        Self {
            compressed: true,
            ..self.clone()
        }
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// A segment file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub name: SegmentName,
    pub path: PathBuf,
}

impl SegmentFile {
    pub fn start(&self) -> Timestamp {
        self.name.start
    }

    pub fn is_compressed(&self) -> bool {
        self.name.compressed
    }

    /// Current size on disk (0 if it vanished)
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Sorted listing of one point's segments
#[derive(Debug, Clone, Default)]
pub struct SegmentCatalog {
    segments: Vec<SegmentFile>,
}

impl SegmentCatalog {
    /// List the segments in `dir`; a missing directory is an empty catalog
    ///
    /// Hidden files are ignored, other names that do not decode are logged
    /// and skipped.
    pub fn scan(dir: &Path) -> StorageResult<Self> {
        let mut segments = Vec::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with('.') {
                continue;
            }

            match SegmentName::parse(&file_name) {
                Ok(name) => segments.push(SegmentFile {
                    name,
                    path: entry.path(),
                }),
                Err(e) => tracing::warn!("Skipping {:?} in {:?}: {}", file_name, dir, e),
            }
        }

        Ok(Self::from_files(segments))
    }

    /// Build a catalog from already-decoded files
    pub fn from_files(mut segments: Vec<SegmentFile>) -> Self {
        segments.sort_by(|a, b| {
            a.name
                .start
                .cmp(&b.name.start)
                .then_with(|| a.name.compressed.cmp(&b.name.compressed).reverse())
        });
        Self { segments }
    }

    pub fn segments(&self) -> &[SegmentFile] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Most recently started segment
    pub fn latest(&self) -> Option<&SegmentFile> {
        self.segments.last()
    }

    /// Index of the last segment starting at or before `ts`
    fn last_starting_at_or_before(&self, ts: Timestamp) -> Option<usize> {
        let after = self.segments.partition_point(|s| s.name.start <= ts);
        after.checked_sub(1)
    }

    /// Segments that may hold records in `range`, oldest first
    ///
    /// Every segment whose name falls inside the range, plus the one segment
    /// immediately before it.
    pub fn select_range(&self, range: TimeRange) -> Vec<&SegmentFile> {
        if range.is_empty() {
            return Vec::new();
        }

        let first_inside = self.segments.partition_point(|s| s.name.start < range.start);
        let past_end = self.segments.partition_point(|s| s.name.start <= range.end);
        let from = first_inside.saturating_sub(1);

        self.segments[from..past_end.max(from)].iter().collect()
    }

    /// Segments to scan for the last record at or before `ts`, newest first
    pub fn select_preceding(&self, ts: Timestamp) -> Vec<&SegmentFile> {
        match self.last_starting_at_or_before(ts) {
            Some(idx) => self.segments[..=idx].iter().rev().collect(),
            None => Vec::new(),
        }
    }

    /// Segments to scan for the first record at or after `ts`, oldest first
    pub fn select_following(&self, ts: Timestamp) -> Vec<&SegmentFile> {
        let from = self.last_starting_at_or_before(ts).unwrap_or(0);
        self.segments[from..].iter().collect()
    }

    /// Segments whose every record is older than `cutoff`
    ///
    /// A segment ends where the next one starts, so a segment qualifies only
    /// when its successor starts at or before the cutoff. The newest segment
    /// never qualifies.
    pub fn older_than(&self, cutoff: Timestamp) -> Vec<&SegmentFile> {
        self.segments
            .windows(2)
            .filter(|pair| pair[1].name.start <= cutoff)
            .map(|pair| &pair[0])
            .collect()
    }

    /// Name for a new segment whose first record is at `first`
    ///
    /// Names never go backwards: a segment opened for late data still sorts
    /// after every existing segment.
    pub fn next_name(&self, first: Timestamp) -> StorageResult<SegmentName> {
        SegmentName::next_after(self.latest().map(|s| &s.name), first)
    }
}
