//! Archive record codec
//!
//! One sample per line, tab separated:
//!
//! ```text
//! 0x<hex micros> \t <tag> \t <value> [\t <tag> \t <raw>] [\t A]
//! ```
//!
//! The raw pair is present only when the raw value differs from the value;
//! a trailing `A` marks an alarm. Empty trailing fields written by older
//! archivers are ignored.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Sample, Timestamp, Value};

/// Every tag the codec understands
pub const TYPE_TAGS: &[&str] = &[
    "dbl", "flt", "int", "short", "long", "bool", "str", "big", "abst", "relt", "ang", "hr",
    "null",
];

const ALARM_FLAG: &str = "A";

/// Type tag for a value
pub fn type_tag(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Double(_) => "dbl",
        Value::Float(_) => "flt",
        Value::Short(_) => "short",
        Value::Int(_) => "int",
        Value::Long(_) => "long",
        Value::Bool(_) => "bool",
        Value::Str(_) => "str",
        Value::Big(_) => "big",
        Value::AbsTime(_) => "abst",
        Value::RelTime(_) => "relt",
        Value::Angle(_) => "ang",
        Value::HourAngle(_) => "hr",
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" | "nan" => Some(f64::NAN),
        "Infinity" | "inf" => Some(f64::INFINITY),
        "-Infinity" | "-inf" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

/// Text form of a value (without its tag)
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Double(v) | Value::Angle(v) | Value::HourAngle(v) => format_float(*v),
        Value::Float(v) => {
            if v.is_finite() {
                v.to_string()
            } else {
                format_float(*v as f64)
            }
        }
        Value::Short(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Long(v) | Value::RelTime(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Str(s) => s.replace(['\t', '\n', '\r'], " "),
        Value::Big(b) => b.to_string(),
        Value::AbsTime(v) => format!("0x{:x}", *v as u64),
    }
}

/// Rebuild a value from its tag and text
pub fn decode_value(tag: &str, text: &str) -> StorageResult<Value> {
    let invalid = || StorageError::InvalidValue(format!("{} {:?}", tag, text));

    let value = match tag {
        "dbl" => Value::Double(parse_float(text).ok_or_else(invalid)?),
        "flt" => Value::Float(match parse_float(text) {
            Some(v) if !v.is_finite() => v as f32,
            _ => text.parse().map_err(|_| invalid())?,
        }),
        "ang" => Value::Angle(parse_float(text).ok_or_else(invalid)?),
        "hr" => Value::HourAngle(parse_float(text).ok_or_else(invalid)?),
        "int" => Value::Int(text.parse().map_err(|_| invalid())?),
        "short" => Value::Short(text.parse().map_err(|_| invalid())?),
        "long" => Value::Long(text.parse().map_err(|_| invalid())?),
        "relt" => Value::RelTime(text.parse().map_err(|_| invalid())?),
        "abst" => Value::AbsTime(parse_hex(text).ok_or_else(invalid)?),
        "bool" => {
            if text.eq_ignore_ascii_case("true") {
                Value::Bool(true)
            } else if text.eq_ignore_ascii_case("false") {
                Value::Bool(false)
            } else {
                return Err(invalid());
            }
        }
        "str" => Value::Str(text.to_string()),
        "big" => Value::Big(text.parse()?),
        "null" => Value::Null,
        other => return Err(StorageError::UnknownTypeTag(other.to_string())),
    };
    Ok(value)
}

fn parse_hex(text: &str) -> Option<i64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).ok().map(|v| v as i64)
}

/// Decode the leading timestamp field
pub fn decode_timestamp(field: &str) -> StorageResult<Timestamp> {
    parse_hex(field.trim())
        .ok_or_else(|| StorageError::MalformedRecord(format!("bad timestamp {:?}", field)))
}

/// Encode a sample as one archive line, without the newline
pub fn encode_line(sample: &Sample) -> String {
    let mut line = format!(
        "0x{:x}\t{}\t{}",
        sample.timestamp as u64,
        type_tag(&sample.value),
        encode_value(&sample.value)
    );

    if let Some(raw) = &sample.raw {
        if raw != &sample.value {
            line.push('\t');
            line.push_str(type_tag(raw));
            line.push('\t');
            line.push_str(&encode_value(raw));
        }
    }

    if sample.alarm {
        line.push('\t');
        line.push_str(ALARM_FLAG);
    }
    line
}

/// Decode one archive line
///
/// The sequence number is not stored; decoded samples carry 0.
pub fn decode_line(line: &str) -> StorageResult<Sample> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields: Vec<&str> = line.split('\t').collect();

    if fields.len() < 2 {
        return Err(StorageError::MalformedRecord(line.to_string()));
    }

    let timestamp = decode_timestamp(fields[0])?;
    let tag = fields[1];
    let text = fields.get(2).copied().unwrap_or("");
    if text.is_empty() && tag != "str" {
        return Err(StorageError::MalformedRecord(line.to_string()));
    }
    let value = decode_value(tag, text)?;

    // Trailing empty fields come from legacy writers
    while fields.len() > 3 && fields.last().map_or(false, |f| f.is_empty()) {
        fields.pop();
    }
    let rest = fields.get(3..).unwrap_or(&[]);

    let (raw, flags) = match rest {
        [] => (None, &[][..]),
        [flag] if *flag == ALARM_FLAG => (None, rest),
        ["str"] => (Some(Value::Str(String::new())), &[][..]),
        [raw_tag, raw_text, flags @ ..] if TYPE_TAGS.contains(raw_tag) => {
            (Some(decode_value(raw_tag, raw_text)?), flags)
        }
        _ => return Err(StorageError::MalformedRecord(line.to_string())),
    };

    let alarm = match flags {
        [] => false,
        [flag] if *flag == ALARM_FLAG => true,
        _ => return Err(StorageError::MalformedRecord(line.to_string())),
    };

    let mut sample = Sample::new(timestamp, value).alarm(alarm);
    if let Some(raw) = raw {
        sample = sample.raw(raw);
    }
    Ok(sample)
}
