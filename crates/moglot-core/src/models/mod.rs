//! Typed records extracted from MongoDB server logs.
//!
//! One log line yields at most one [`LogRecord`] (routed to storage by the
//! batch accumulator with exhaustive matching) plus, for command events,
//! an in-session [`AccessSample`] feeding session access statistics.
//! Records are immutable after extraction except for
//! `SlowQueryRecord::username`, which authentication correlation may
//! back-fill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionAction {
    Accepted,
    Ended,
}

impl ConnectionAction {
    /// Stable string stored in the `connections.action` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "connection_accepted",
            Self::Ended => "connection_ended",
        }
    }
}

/// Authentication attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthOutcome {
    Success,
    Failure,
}

impl AuthOutcome {
    /// Stable string stored in the `authentications.result` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "auth_success",
            Self::Failure => "auth_failed",
        }
    }
}

/// Optional OS resource metrics attached to newer-generation slow-query
/// log lines (`storage.data` attributes). Absent entirely on older logs;
/// the storage layer writes NULLs for a record without them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_nanos: Option<i64>,
    pub bytes_read: Option<i64>,
    pub bytes_written: Option<i64>,
    pub time_reading_micros: Option<i64>,
    pub time_writing_micros: Option<i64>,
}

impl ResourceMetrics {
    /// True when no metric is present; such a record is stored as the
    /// base-generation row shape.
    pub fn is_empty(&self) -> bool {
        self.cpu_nanos.is_none()
            && self.bytes_read.is_none()
            && self.bytes_written.is_none()
            && self.time_reading_micros.is_none()
            && self.time_writing_micros.is_none()
    }
}

/// One execution of a slow operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryRecord {
    pub timestamp: DateTime<Utc>,
    /// Epoch-seconds mirror of `timestamp` for fast range comparison.
    pub ts_epoch: i64,
    pub database: String,
    pub collection: String,
    pub duration_ms: i64,
    pub docs_examined: i64,
    pub docs_returned: i64,
    pub keys_examined: i64,
    /// Hash from the source log line; `None` until a synthetic hash is
    /// derived during aggregation.
    pub query_hash: Option<String>,
    pub plan_summary: String,
    /// Raw query text: the command document re-serialized, or free text.
    pub query_text: String,
    pub file_path: String,
    pub line_number: u64,
    pub connection_id: String,
    /// Back-filled by authentication correlation; `None` until then.
    pub username: Option<String>,
    pub resource: ResourceMetrics,
}

impl SlowQueryRecord {
    /// `database.collection`.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Connection accepted/ended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub ts_epoch: i64,
    pub connection_id: String,
    pub action: ConnectionAction,
    pub ip: String,
    pub port: Option<u16>,
}

/// Authentication success/failure event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationEvent {
    pub timestamp: DateTime<Utc>,
    pub ts_epoch: i64,
    pub username: Option<String>,
    pub database: String,
    pub outcome: AuthOutcome,
    pub connection_id: String,
    /// IP only (port stripped).
    pub remote: String,
    pub mechanism: String,
}

/// Tagged record produced by the line classifier and consumed by the
/// batch accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    SlowQuery(SlowQueryRecord),
    Connection(ConnectionEvent),
    Authentication(AuthenticationEvent),
}

/// Session-local database-access sample emitted for every recognized
/// command event, including those below the slow-query threshold. Not
/// persisted; feeds session access statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessSample {
    pub timestamp: DateTime<Utc>,
    pub database: String,
    pub connection_id: String,
}

/// Per-file ingest counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub total_lines: u64,
    pub json_lines: u64,
    pub text_lines: u64,
    pub error_lines: u64,
    pub slow_query_events: u64,
    pub connection_events: u64,
    pub auth_events: u64,
    /// Files or chunks that could not be opened or read to the end.
    /// The affected source contributes whatever was parsed before the
    /// failure; the rest of the batch is unaffected.
    pub io_errors: u64,
}

impl FileSummary {
    /// Fold another summary into this one. Commutative, so parallel
    /// chunk results can merge in any order.
    pub fn absorb(&mut self, other: &FileSummary) {
        self.total_lines += other.total_lines;
        self.json_lines += other.json_lines;
        self.text_lines += other.text_lines;
        self.error_lines += other.error_lines;
        self.slow_query_events += other.slow_query_events;
        self.connection_events += other.connection_events;
        self.auth_events += other.auth_events;
        self.io_errors += other.io_errors;
    }
}

/// Running counters for one ingestion session, plus a per-file breakdown.
/// Reset at the start of each new session; read-only afterward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsingSummary {
    pub totals: FileSummary,
    pub files: Vec<(String, FileSummary)>,
}

impl ParsingSummary {
    /// Record one finished file.
    pub fn add_file(&mut self, path: &str, summary: FileSummary) {
        self.totals.absorb(&summary);
        self.files.push((path.to_string(), summary));
    }

    /// True when at least one event of any type was extracted.
    pub fn any_events(&self) -> bool {
        self.totals.slow_query_events > 0
            || self.totals.connection_events > 0
            || self.totals.auth_events > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_absorb_is_commutative() {
        let a = FileSummary {
            total_lines: 10,
            json_lines: 8,
            slow_query_events: 3,
            error_lines: 1,
            ..Default::default()
        };
        let b = FileSummary {
            total_lines: 5,
            text_lines: 5,
            connection_events: 2,
            ..Default::default()
        };

        let mut ab = a.clone();
        ab.absorb(&b);
        let mut ba = b.clone();
        ba.absorb(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.total_lines, 15);
        assert_eq!(ab.slow_query_events, 3);
        assert_eq!(ab.connection_events, 2);
    }

    #[test]
    fn test_resource_metrics_empty_detection() {
        assert!(ResourceMetrics::default().is_empty());
        let with_cpu = ResourceMetrics {
            cpu_nanos: Some(1_000),
            ..Default::default()
        };
        assert!(!with_cpu.is_empty());
    }
}
