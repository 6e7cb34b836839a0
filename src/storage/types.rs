//! Core data types for the point-history engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `PointId`: The (source, name) identity of a telemetry point
//! - `Sample`: One timestamped, sequenced value for a point
//! - `Value`: The typed payload carried by a sample
//! - `TimeRange`: An inclusive time interval for queries

use crate::storage::error::{StorageError, StorageResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Microseconds since the Unix epoch
pub type Timestamp = i64;

/// Microseconds per second
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Microseconds per day
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SEC;

/// Current wall-clock time in microseconds
pub fn now_micros() -> Timestamp {
    Utc::now().timestamp_micros()
}

/// A duration in microseconds, saturating at `i64::MAX`
pub fn duration_micros(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Identity of a telemetry point: a (source, name) pair
///
/// Rendered as `source.name`. The source never contains a `.`, the name may
/// (dots in the name map to nested archive directories).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointId {
    pub source: String,
    pub name: String,
}

impl PointId {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }

    /// Parse `source.name`, splitting at the first dot
    pub fn parse(full: &str) -> StorageResult<Self> {
        let (source, name) = full
            .split_once('.')
            .ok_or_else(|| StorageError::InvalidPoint(full.to_string()))?;
        let point = Self::new(source, name);
        point.validate()?;
        Ok(point)
    }

    /// Check that both components are usable as directory names
    pub fn validate(&self) -> StorageResult<()> {
        let bad_component = |s: &str| {
            s.is_empty()
                || s == "."
                || s == ".."
                || s.contains('/')
                || s.contains('\\')
                || s.contains('\0')
        };

        if bad_component(&self.source) || self.source.contains('.') {
            return Err(StorageError::InvalidPoint(self.to_string()));
        }
        if self.name.is_empty() || self.name.split('.').any(bad_component) {
            return Err(StorageError::InvalidPoint(self.to_string()));
        }
        Ok(())
    }

    /// Full dotted name
    pub fn full_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.name)
    }
}

impl FromStr for PointId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Arbitrary-precision signed decimal integer
///
/// Stored in canonical decimal form (no leading zeros, no `+`, `0` never
/// negative). Arithmetic is not needed by the archive, only exact transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BigInteger(String);

impl BigInteger {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BigInteger {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, digits) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StorageError::InvalidValue(format!(
                "not an integer: {:?}",
                s
            )));
        }

        let trimmed = digits.trim_start_matches('0');
        let canonical = if trimmed.is_empty() {
            "0".to_string()
        } else if negative {
            format!("-{}", trimmed)
        } else {
            trimmed.to_string()
        };
        Ok(Self(canonical))
    }
}

impl From<i64> for BigInteger {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for BigInteger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed payload of a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Double(f64),
    Float(f32),
    Short(i16),
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(String),
    Big(BigInteger),
    /// Absolute time, microseconds since the epoch
    AbsTime(Timestamp),
    /// Relative time, microseconds
    RelTime(i64),
    /// Angle in radians
    Angle(f64),
    /// Hour angle in radians
    HourAngle(f64),
}

impl Value {
    /// Numeric view of the value, where one exists
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) | Value::Angle(v) | Value::HourAngle(v) => Some(*v),
            Value::Float(v) => Some(*v as f64),
            Value::Short(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) | Value::AbsTime(v) | Value::RelTime(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Big(b) => b.as_str().parse().ok(),
            Value::Null | Value::Str(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Double(v) | Value::Angle(v) | Value::HourAngle(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) | Value::RelTime(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(s) => f.write_str(s),
            Value::Big(b) => write!(f, "{}", b),
            Value::AbsTime(v) => write!(f, "{:#x}", v),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// A single timestamped, sequenced value for one point
///
/// The point itself is implicit: samples always live inside a structure keyed
/// by `PointId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Microseconds since the epoch
    pub timestamp: Timestamp,
    /// Translated value
    pub value: Value,
    /// Untranslated value, `None` when identical to `value`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    /// Per-point sequence number
    #[serde(default)]
    pub sequence: u64,
    /// Alarm flag
    #[serde(default)]
    pub alarm: bool,
}

impl Sample {
    /// Create a sample with a specific timestamp
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
            raw: None,
            sequence: 0,
            alarm: false,
        }
    }

    /// Create a sample stamped with the current time
    pub fn now(value: impl Into<Value>) -> Self {
        Self::new(now_micros(), value)
    }

    /// Builder method: attach the untranslated value
    pub fn raw(mut self, raw: impl Into<Value>) -> Self {
        let raw = raw.into();
        self.raw = if raw == self.value { None } else { Some(raw) };
        self
    }

    /// Builder method: set the sequence seed
    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Builder method: set the alarm flag
    pub fn alarm(mut self, alarm: bool) -> Self {
        self.alarm = alarm;
        self
    }

    /// The untranslated value (falls back to the translated one)
    pub fn raw_value(&self) -> &Value {
        self.raw.as_ref().unwrap_or(&self.value)
    }
}

/// Time range for queries (closed interval: [start, end])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in microseconds
    pub start: Timestamp,
    /// End timestamp (inclusive), in microseconds
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// A range covering a single instant
    pub fn at(ts: Timestamp) -> Self {
        Self { start: ts, end: ts }
    }

    /// Everything up to and including `end`
    pub fn until(end: Timestamp) -> Self {
        Self {
            start: Timestamp::MIN,
            end,
        }
    }

    /// Create a range for the last N seconds from now
    pub fn last_secs(secs: i64) -> Self {
        let end = now_micros();
        Self {
            start: end - secs * MICROS_PER_SEC,
            end,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// True when the range covers no instant at all
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Duration in microseconds
    pub fn duration_micros(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}
