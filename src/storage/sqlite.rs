//! SQLite archive backend
//!
//! An alternative to the flat-file archive implementing the same contract.
//! All points share one table indexed on (source, name, timestamp); values are
//! stored as tag + text using the archive record codec, so every value type
//! round-trips exactly.
//!
//! Retention is exact here: `purge_older_than` deletes individual rows.

use crate::storage::archiver::ArchiveBackend;
use crate::storage::error::StorageResult;
use crate::storage::record::{decode_value, encode_value, type_tag};
use crate::storage::types::{duration_micros, now_micros, PointId, Sample, TimeRange, Timestamp};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SAMPLE_COLUMNS: &str = "ts, value_tag, value, raw_tag, raw, alarm";

/// Columns of one stored sample, in `SAMPLE_COLUMNS` order
type StoredRow = (i64, String, String, Option<String>, Option<String>, bool);

/// Archive stored in a single SQLite database
pub struct SqliteArchive {
    // Connection is not Sync; every call takes the lock
    conn: Mutex<Connection>,
    path: PathBuf,
    max_records: usize,
}

impl SqliteArchive {
    /// Create or open the database at `path`
    pub fn open(path: &Path, max_records: usize) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                name TEXT NOT NULL,
                ts INTEGER NOT NULL,
                value_tag TEXT NOT NULL,
                value TEXT NOT NULL,
                raw_tag TEXT,
                raw TEXT,
                alarm INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_samples_point_ts ON samples(source, name, ts);
            ",
        )?;

        tracing::info!("SQLite archive at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            max_records: max_records.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    /// Turn stored columns back into a sample, skipping rows that no longer decode
    fn decode_rows(
        point: &PointId,
        rows: Vec<StoredRow>,
    ) -> Vec<Sample> {
        let mut samples = Vec::with_capacity(rows.len());
        for (ts, tag, text, raw_tag, raw_text, alarm) in rows {
            let value = match decode_value(&tag, &text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Skipping row of {} at {}: {}", point, ts, e);
                    continue;
                }
            };
            let mut sample = Sample::new(ts, value).alarm(alarm);
            if let (Some(raw_tag), Some(raw_text)) = (raw_tag, raw_text) {
                match decode_value(&raw_tag, &raw_text) {
                    Ok(raw) => sample = sample.raw(raw),
                    Err(e) => tracing::warn!("Dropping raw value of {} at {}: {}", point, ts, e),
                }
            }
            samples.push(sample);
        }
        samples
    }

    fn query_one(&self, point: &PointId, sql: &str, ts: Timestamp) -> StorageResult<Option<Sample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params![point.source, point.name, ts], Self::read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::decode_rows(point, rows).into_iter().next())
    }
}

impl ArchiveBackend for SqliteArchive {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn persist(&self, point: &PointId, batch: &[Sample]) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO samples (source, name, ts, value_tag, value, raw_tag, raw, alarm)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for sample in batch {
                let raw = sample.raw.as_ref().filter(|raw| *raw != &sample.value);
                stmt.execute(params![
                    point.source,
                    point.name,
                    sample.timestamp,
                    type_tag(&sample.value),
                    encode_value(&sample.value),
                    raw.map(type_tag),
                    raw.map(encode_value),
                    sample.alarm,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn extract(&self, point: &PointId, range: TimeRange) -> StorageResult<Vec<Sample>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM samples
                 WHERE source = ? AND name = ? AND ts >= ? AND ts <= ?
                 ORDER BY ts, id LIMIT ?",
                SAMPLE_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![point.source, point.name, range.start, range.end, self.max_records as i64],
                Self::read_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        if rows.len() >= self.max_records {
            tracing::warn!("Extract for {} truncated at {} records", point, self.max_records);
        }
        Ok(Self::decode_rows(point, rows))
    }

    fn preceding_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        self.query_one(
            point,
            &format!(
                "SELECT {} FROM samples WHERE source = ? AND name = ? AND ts <= ?
                 ORDER BY ts DESC, id DESC LIMIT 1",
                SAMPLE_COLUMNS
            ),
            ts,
        )
    }

    fn following_or_at(&self, point: &PointId, ts: Timestamp) -> StorageResult<Option<Sample>> {
        self.query_one(
            point,
            &format!(
                "SELECT {} FROM samples WHERE source = ? AND name = ? AND ts >= ?
                 ORDER BY ts, id LIMIT 1",
                SAMPLE_COLUMNS
            ),
            ts,
        )
    }

    fn purge_older_than(&self, point: &PointId, age: Duration) -> StorageResult<usize> {
        let cutoff = now_micros().saturating_sub(duration_micros(age));
        let removed = self.conn.lock().execute(
            "DELETE FROM samples WHERE source = ? AND name = ? AND ts < ?",
            params![point.source, point.name, cutoff],
        )?;
        if removed > 0 {
            tracing::info!("Purged {} rows of {}", removed, point);
        }
        Ok(removed)
    }

    fn max_records(&self) -> usize {
        self.max_records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Value, MICROS_PER_DAY};
    use tempfile::tempdir;

    #[test]
    fn test_sqlite_round_trip() {
        let dir = tempdir().unwrap();
        let archive = SqliteArchive::open(&dir.path().join("archive.db"), 100).unwrap();
        let point = PointId::new("siteA", "temp");

        let batch = vec![
            Sample::new(10, 1.5).raw(300i32),
            Sample::new(20, "open").alarm(true),
            Sample::new(30, Value::Null),
        ];
        archive.persist(&point, &batch).unwrap();

        let restored = archive.extract(&point, TimeRange::new(0, 100)).unwrap();
        assert_eq!(restored, batch);

        let other = PointId::new("siteB", "temp");
        assert!(archive.extract(&other, TimeRange::new(0, 100)).unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_neighbours_and_cap() {
        let dir = tempdir().unwrap();
        let archive = SqliteArchive::open(&dir.path().join("archive.db"), 2).unwrap();
        let point = PointId::new("s", "p");
        let batch: Vec<Sample> = (0..5).map(|i| Sample::new(i * 10, i)).collect();
        archive.persist(&point, &batch).unwrap();

        assert_eq!(archive.extract(&point, TimeRange::new(0, 100)).unwrap().len(), 2);
        assert_eq!(archive.preceding_or_at(&point, 25).unwrap().unwrap().timestamp, 20);
        assert_eq!(archive.following_or_at(&point, 25).unwrap().unwrap().timestamp, 30);
        assert!(archive.preceding_or_at(&point, -1).unwrap().is_none());
    }

    #[test]
    fn test_sqlite_purge() {
        let dir = tempdir().unwrap();
        let archive = SqliteArchive::open(&dir.path().join("archive.db"), 100).unwrap();
        let point = PointId::new("s", "p");
        let now = now_micros();
        archive
            .persist(&point, &[Sample::new(now - 9 * MICROS_PER_DAY, 1.0), Sample::new(now, 2.0)])
            .unwrap();

        let removed = archive
            .purge_older_than(&point, Duration::from_secs(7 * 86_400))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(archive.extract(&point, TimeRange::new(0, now)).unwrap().len(), 1);
    }
}
