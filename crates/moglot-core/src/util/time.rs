//! Timestamp parsing for MongoDB log lines.
//!
//! Structured lines carry `t: {"$date": "..."}` in RFC 3339 with an
//! offset; extended-JSON variants wrap epoch millis in `$numberLong`.
//! Legacy text lines embed a bare ISO timestamp somewhere in the line.
//! Everything normalizes to UTC-aware instants; source offsets are
//! converted, never discarded.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Parse a `$date`-style string: RFC 3339 first, then offset-free ISO
/// (assumed UTC), then a bare epoch number in seconds or millis.
pub fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Legacy text logs write the offset without a colon ("+0000").
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(secs) = s.parse::<f64>() {
        return from_epoch_guess(secs);
    }
    None
}

/// Parse the `t` attribute of a structured log entry. Accepts
/// `{"$date": "<rfc3339>"}`, `{"$date": {"$numberLong": "<millis>"}}`,
/// a plain string, or a plain number.
pub fn parse_date_attr(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_date_str(s),
        Value::Number(n) => from_epoch_guess(n.as_f64()?),
        Value::Object(map) => {
            let inner = map.get("$date")?;
            match inner {
                Value::String(s) => parse_date_str(s),
                Value::Number(n) => from_epoch_guess(n.as_f64()?),
                Value::Object(wrapped) => {
                    let millis = wrapped.get("$numberLong")?.as_str()?.parse::<i64>().ok()?;
                    DateTime::from_timestamp_millis(millis)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Epoch seconds for a log entry's `t` attribute, if parseable.
pub fn epoch_from_entry(entry: &Value) -> Option<i64> {
    entry
        .get("t")
        .and_then(parse_date_attr)
        .map(|dt| dt.timestamp())
}

/// Scan a raw line for an embedded ISO timestamp (`T` or space
/// separated). Used by legacy-text extraction and search.
pub fn scan_text_timestamp(line: &str) -> Option<DateTime<Utc>> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)")
            .expect("timestamp pattern")
    });
    let m = re.captures(line)?;
    parse_date_str(m.get(1)?.as_str())
}

/// Timestamp for any raw line: structured `t.$date` when the line is
/// JSON, embedded ISO text otherwise.
pub fn timestamp_from_line(line: &str) -> Option<DateTime<Utc>> {
    if line.starts_with('{')
        && let Ok(entry) = serde_json::from_str::<Value>(line)
        && let Some(t) = entry.get("t")
        && let Some(dt) = parse_date_attr(t)
    {
        return Some(dt);
    }
    scan_text_timestamp(line)
}

// Epoch values above this are taken as millis rather than seconds
// (year 2603 in seconds, 1970-08 in millis).
const EPOCH_MILLIS_CUTOVER: f64 = 20_000_000_000.0;

fn from_epoch_guess(value: f64) -> Option<DateTime<Utc>> {
    if value > EPOCH_MILLIS_CUTOVER {
        DateTime::from_timestamp_millis(value as i64)
    } else {
        DateTime::from_timestamp(value as i64, 0)
    }
}
