//! MongoDB log line classifier and extractor.
//!
//! Handles both structured JSON lines (4.4+) and legacy free-text lines
//! (3.x). Classification is a pure function of the line plus its file
//! position; no shared state. Cheap substring pre-filters keep the
//! JSON decoder off lines that can never produce a tracked event, which
//! is most of a busy server's log.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::models::{
    AccessSample, AuthOutcome, AuthenticationEvent, ConnectionAction, ConnectionEvent, LogRecord,
    ResourceMetrics, SlowQueryRecord,
};
use crate::util;

/// ACCESS-component messages that mark an authentication event.
const AUTH_SUCCESS_MESSAGES: &[&str] = &["Successfully authenticated", "Authentication succeeded"];
const AUTH_FAILURE_MESSAGE: &str = "Authentication failed";

/// Result of classifying one line.
#[derive(Debug, Default)]
pub struct Classified {
    /// The extracted record, if the line matched a tracked event type.
    pub record: Option<LogRecord>,
    /// Session-local access sample, emitted for every command event
    /// (including ones below the slow-query threshold).
    pub access: Option<AccessSample>,
    /// Line looked structured but failed JSON decode.
    pub decode_error: bool,
    /// Line was JSON-structured (`{`...`}`).
    pub structured: bool,
}

impl Classified {
    fn structured() -> Self {
        Self {
            structured: true,
            ..Default::default()
        }
    }
}

/// Compiled classifier. One instance per ingestion session; safe to
/// share across chunk workers by reference.
pub struct Classifier {
    slow_threshold_ms: i64,
    // Fallback extraction for malformed-but-recognizable JSON lines.
    ns_re: Regex,
    duration_re: Regex,
    plan_re: Regex,
    date_re: Regex,
    ctx_re: Regex,
    // Legacy free-text patterns.
    text_accept_re: Regex,
    text_end_re: Regex,
    text_auth_ok_re: Regex,
    text_auth_fail_re: Regex,
    text_command_re: Regex,
    text_trailing_ms_re: Regex,
    text_plan_re: Regex,
    text_docs_re: Regex,
    text_keys_re: Regex,
    text_returned_re: Regex,
}

impl Classifier {
    pub fn new(slow_threshold_ms: i64) -> Self {
        Self {
            slow_threshold_ms,
            ns_re: Regex::new(r#""ns":"([^"]+)""#).expect("ns pattern"),
            duration_re: Regex::new(r#""durationMillis":(\d+)"#).expect("duration pattern"),
            plan_re: Regex::new(r#""planSummary":"([^"]+)""#).expect("plan pattern"),
            date_re: Regex::new(r#""\$date":"([^"]+)""#).expect("date pattern"),
            ctx_re: Regex::new(r#""ctx":"([^"]+)""#).expect("ctx pattern"),
            text_accept_re: Regex::new(r"connection accepted from (\S+?):(\d+) #(\d+)")
                .expect("accept pattern"),
            text_end_re: Regex::new(r"end connection (\S+?):(\d+)").expect("end pattern"),
            text_auth_ok_re: Regex::new(
                r"Successfully authenticated as principal (\S+) on (\S+)(?: from client (\S+?):\d+)?",
            )
            .expect("auth ok pattern"),
            text_auth_fail_re: Regex::new(r"Failed to authenticate (\S+)@(\S+)")
                .expect("auth fail pattern"),
            text_command_re: Regex::new(r"command (\S+\.\S+) (?:command: (\w+) )?(.*)")
                .expect("command pattern"),
            text_trailing_ms_re: Regex::new(r"(\d+)ms\s*$").expect("trailing ms pattern"),
            text_plan_re: Regex::new(r"planSummary: (\S+)").expect("text plan pattern"),
            text_docs_re: Regex::new(r"docsExamined:(\d+)").expect("docs pattern"),
            text_keys_re: Regex::new(r"keysExamined:(\d+)").expect("keys pattern"),
            text_returned_re: Regex::new(r"n(?:R|r)eturned:(\d+)").expect("returned pattern"),
        }
    }

    /// Classify one trimmed line. `line_number` is 1-based.
    pub fn classify(&self, line: &str, file_path: &str, line_number: u64) -> Classified {
        let line = line.trim();
        if line.is_empty() {
            return Classified::default();
        }
        if line.starts_with('{') && line.ends_with('}') {
            self.classify_json(line, file_path, line_number)
        } else {
            self.classify_text(line, file_path, line_number)
        }
    }

    // -----------------------------------------------------------------
    // Structured (JSON) lines
    // -----------------------------------------------------------------

    fn classify_json(&self, line: &str, file_path: &str, line_number: u64) -> Classified {
        // Substring pre-filter: skip the decoder entirely for lines that
        // cannot carry a tracked event.
        let interesting = line.contains("\"Slow query\"")
            || line.contains("\"c\":\"COMMAND\"")
            || line.contains("connection accepted")
            || line.contains("Connection accepted")
            || line.contains("connection ended")
            || line.contains("Connection ended")
            || line.contains("\"c\":\"ACCESS\"");
        if !interesting {
            return Classified::structured();
        }

        let entry: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                let mut out = self.fallback_extract(line, file_path, line_number);
                out.structured = true;
                out.decode_error = true;
                return out;
            }
        };

        let component = entry.get("c").and_then(Value::as_str).unwrap_or("");
        let msg = entry.get("msg").and_then(Value::as_str).unwrap_or("");

        match component {
            "COMMAND" if msg == "Slow query" || msg == "command" => {
                self.extract_command(&entry, file_path, line_number)
            }
            "NETWORK" => {
                let msg_lower = msg.to_ascii_lowercase();
                let action = if msg_lower.contains("connection accepted") {
                    Some(ConnectionAction::Accepted)
                } else if msg_lower.contains("connection ended") {
                    Some(ConnectionAction::Ended)
                } else {
                    None
                };
                match action {
                    Some(action) => extract_connection(&entry, action),
                    None => Classified::structured(),
                }
            }
            "ACCESS" => extract_auth(&entry, msg),
            _ => Classified::structured(),
        }
    }

    fn extract_command(&self, entry: &Value, file_path: &str, line_number: u64) -> Classified {
        let attr = entry.get("attr").cloned().unwrap_or(Value::Null);
        let timestamp = entry_timestamp(entry);
        let ns = attr.get("ns").and_then(Value::as_str).unwrap_or("");
        let (database, collection) = split_namespace(ns);
        let connection_id = ctx_connection_id(entry);

        let mut out = Classified::structured();
        out.access = Some(AccessSample {
            timestamp,
            database: database.clone(),
            connection_id: connection_id.clone(),
        });

        let duration_ms = int_chain(&attr, None, &["durationMillis"]);
        if duration_ms <= self.slow_threshold_ms {
            return out;
        }

        let command = attr.get("command");
        let query_text = match command {
            Some(c) if !c.is_null() => c.to_string(),
            _ => format!(r#"{{"find": "{}", "filter": {{}}}}"#, collection),
        };

        let storage = attr.pointer("/storage/data").cloned().unwrap_or(Value::Null);
        let resource = ResourceMetrics {
            cpu_nanos: opt_int(&attr, "cpuNanos"),
            bytes_read: opt_int(&storage, "bytesRead").or_else(|| opt_int(&attr, "bytesRead")),
            bytes_written: opt_int(&storage, "bytesWritten")
                .or_else(|| opt_int(&attr, "bytesWritten")),
            time_reading_micros: opt_int(&storage, "timeReadingMicros")
                .or_else(|| opt_int(&attr, "timeReadingMicros")),
            time_writing_micros: opt_int(&storage, "timeWritingMicros")
                .or_else(|| opt_int(&attr, "timeWritingMicros")),
        };

        out.record = Some(LogRecord::SlowQuery(SlowQueryRecord {
            timestamp,
            ts_epoch: timestamp.timestamp(),
            database,
            collection,
            duration_ms,
            docs_examined: int_chain(
                &attr,
                command,
                &["docsExamined", "docs_examined", "totalDocsExamined"],
            ),
            docs_returned: int_chain(&attr, command, &["nReturned", "nreturned", "numReturned"]),
            keys_examined: int_chain(
                &attr,
                command,
                &["keysExamined", "keys_examined", "totalKeysExamined"],
            ),
            query_hash: attr
                .get("queryHash")
                .and_then(Value::as_str)
                .map(str::to_string),
            plan_summary: attr
                .get("planSummary")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            query_text,
            file_path: file_path.to_string(),
            line_number,
            connection_id,
            username: None,
            resource,
        }));
        out
    }

    // -----------------------------------------------------------------
    // Fallback for malformed JSON
    // -----------------------------------------------------------------

    /// Regex extraction for lines that look like a structured slow query
    /// but fail JSON decode (truncated writes, interleaved output).
    fn fallback_extract(&self, line: &str, file_path: &str, line_number: u64) -> Classified {
        let mut out = Classified::default();
        if !line.contains("Slow query") {
            return out;
        }

        let duration_ms = match self
            .duration_re
            .captures(line)
            .and_then(|c| c[1].parse::<i64>().ok())
        {
            Some(d) => d,
            None => return out,
        };
        let ns = self
            .ns_re
            .captures(line)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        let (database, collection) = split_namespace(&ns);
        let timestamp = self
            .date_re
            .captures(line)
            .and_then(|c| util::parse_date_str(&c[1]))
            .unwrap_or_else(Utc::now);
        let connection_id = self
            .ctx_re
            .captures(line)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown".to_string());

        out.access = Some(AccessSample {
            timestamp,
            database: database.clone(),
            connection_id: connection_id.clone(),
        });
        if duration_ms > self.slow_threshold_ms {
            out.record = Some(LogRecord::SlowQuery(SlowQueryRecord {
                timestamp,
                ts_epoch: timestamp.timestamp(),
                database,
                collection,
                duration_ms,
                docs_examined: 0,
                docs_returned: 0,
                keys_examined: 0,
                query_hash: None,
                plan_summary: self
                    .plan_re
                    .captures(line)
                    .map(|c| c[1].to_string())
                    .unwrap_or_default(),
                query_text: line.to_string(),
                file_path: file_path.to_string(),
                line_number,
                connection_id,
                username: None,
                resource: ResourceMetrics::default(),
            }));
        }
        out
    }

    // -----------------------------------------------------------------
    // Legacy free-text lines
    // -----------------------------------------------------------------

    fn classify_text(&self, line: &str, file_path: &str, line_number: u64) -> Classified {
        let mut out = Classified::default();

        if line.contains("connection accepted from") {
            if let Some(caps) = self.text_accept_re.captures(line) {
                let timestamp = text_timestamp(line);
                out.record = Some(LogRecord::Connection(ConnectionEvent {
                    timestamp,
                    ts_epoch: timestamp.timestamp(),
                    connection_id: format!("conn{}", &caps[3]),
                    action: ConnectionAction::Accepted,
                    ip: caps[1].to_string(),
                    port: caps[2].parse().ok(),
                }));
            }
            return out;
        }

        if line.contains("end connection") {
            if let Some(caps) = self.text_end_re.captures(line) {
                let timestamp = text_timestamp(line);
                out.record = Some(LogRecord::Connection(ConnectionEvent {
                    timestamp,
                    ts_epoch: timestamp.timestamp(),
                    connection_id: text_ctx(line).unwrap_or_else(|| "unknown".to_string()),
                    action: ConnectionAction::Ended,
                    ip: caps[1].to_string(),
                    port: caps[2].parse().ok(),
                }));
            }
            return out;
        }

        if line.contains("Successfully authenticated") {
            if let Some(caps) = self.text_auth_ok_re.captures(line) {
                let timestamp = text_timestamp(line);
                out.record = Some(LogRecord::Authentication(AuthenticationEvent {
                    timestamp,
                    ts_epoch: timestamp.timestamp(),
                    username: Some(caps[1].to_string()),
                    database: caps[2].to_string(),
                    outcome: AuthOutcome::Success,
                    connection_id: text_ctx(line).unwrap_or_else(|| "unknown".to_string()),
                    remote: caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
                    mechanism: "SCRAM-SHA-256".to_string(),
                }));
            }
            return out;
        }

        if line.contains("Failed to authenticate") {
            if let Some(caps) = self.text_auth_fail_re.captures(line) {
                let timestamp = text_timestamp(line);
                out.record = Some(LogRecord::Authentication(AuthenticationEvent {
                    timestamp,
                    ts_epoch: timestamp.timestamp(),
                    username: Some(caps[1].to_string()),
                    database: caps[2].to_string(),
                    outcome: AuthOutcome::Failure,
                    connection_id: text_ctx(line).unwrap_or_else(|| "unknown".to_string()),
                    remote: String::new(),
                    mechanism: "SCRAM-SHA-256".to_string(),
                }));
            }
            return out;
        }

        if line.contains(" command ") {
            if let Some(caps) = self.text_command_re.captures(line) {
                let timestamp = text_timestamp(line);
                let (database, collection) = split_namespace(&caps[1]);
                let connection_id = text_ctx(line).unwrap_or_else(|| "unknown".to_string());
                out.access = Some(AccessSample {
                    timestamp,
                    database: database.clone(),
                    connection_id: connection_id.clone(),
                });
                let duration_ms = self
                    .text_trailing_ms_re
                    .captures(line)
                    .and_then(|c| c[1].parse::<i64>().ok())
                    .unwrap_or(0);
                if duration_ms > self.slow_threshold_ms {
                    let verb = caps.get(2).map(|m| m.as_str()).unwrap_or("command");
                    let body = caps.get(3).map(|m| m.as_str()).unwrap_or("");
                    out.record = Some(LogRecord::SlowQuery(SlowQueryRecord {
                        timestamp,
                        ts_epoch: timestamp.timestamp(),
                        database,
                        collection,
                        duration_ms,
                        docs_examined: self.text_capture_int(&self.text_docs_re, line),
                        docs_returned: self.text_capture_int(&self.text_returned_re, line),
                        keys_examined: self.text_capture_int(&self.text_keys_re, line),
                        query_hash: None,
                        plan_summary: self
                            .text_plan_re
                            .captures(line)
                            .map(|c| c[1].to_string())
                            .unwrap_or_default(),
                        query_text: format!("{} {}", verb, body).trim().to_string(),
                        file_path: file_path.to_string(),
                        line_number,
                        connection_id,
                        username: None,
                        resource: ResourceMetrics::default(),
                    }));
                }
            }
        }
        out
    }

    fn text_capture_int(&self, re: &Regex, line: &str) -> i64 {
        re.captures(line)
            .and_then(|c| c[1].parse::<i64>().ok())
            .unwrap_or(0)
    }
}

/// Split `database.collection` on the first dot; `unknown`/`unknown`
/// when no dot is present.
fn split_namespace(ns: &str) -> (String, String) {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() => (db.to_string(), coll.to_string()),
        _ => ("unknown".to_string(), "unknown".to_string()),
    }
}

/// The `ctx` field carried through whole ("conn1234", "listener", ...).
fn ctx_connection_id(entry: &Value) -> String {
    match entry.get("ctx").and_then(Value::as_str) {
        Some(ctx) if !ctx.is_empty() => ctx.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Timestamp from the entry's `t` attribute; falls back to now (UTC)
/// with a warning so one undated line cannot kill ingestion.
fn entry_timestamp(entry: &Value) -> DateTime<Utc> {
    match entry.get("t").and_then(util::parse_date_attr) {
        Some(dt) => dt,
        None => {
            warn!("log entry has no parseable timestamp, using current time");
            Utc::now()
        }
    }
}

fn text_timestamp(line: &str) -> DateTime<Utc> {
    util::scan_text_timestamp(line).unwrap_or_else(|| {
        warn!("text line has no parseable timestamp, using current time");
        Utc::now()
    })
}

/// Bracketed context in legacy lines: `[conn42]`.
fn text_ctx(line: &str) -> Option<String> {
    let start = line.find('[')?;
    let end = line[start..].find(']')? + start;
    let ctx = &line[start + 1..end];
    if ctx.is_empty() {
        None
    } else {
        Some(ctx.to_string())
    }
}

/// First present key wins, even when its value is zero; `command` is
/// consulted after every spelling on `attr` misses.
fn int_chain(attr: &Value, command: Option<&Value>, keys: &[&str]) -> i64 {
    for key in keys {
        if let Some(v) = opt_int(attr, key) {
            return v;
        }
    }
    if let Some(cmd) = command {
        for key in keys {
            if let Some(v) = opt_int(cmd, key) {
                return v;
            }
        }
    }
    0
}

fn opt_int(obj: &Value, key: &str) -> Option<i64> {
    let v = obj.get(key)?;
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

fn extract_connection(entry: &Value, action: ConnectionAction) -> Classified {
    let attr = entry.get("attr").cloned().unwrap_or(Value::Null);
    let remote = attr.get("remote").and_then(Value::as_str).unwrap_or("");

    // No ip:port in remote means no event, silently.
    let Some((ip, port)) = remote.rsplit_once(':') else {
        return Classified::structured();
    };

    let timestamp = entry_timestamp(entry);
    let connection_id = match opt_int(&attr, "connectionId") {
        Some(n) => format!("conn{}", n),
        None => ctx_connection_id(entry),
    };
    let mut out = Classified::structured();
    out.record = Some(LogRecord::Connection(ConnectionEvent {
        timestamp,
        ts_epoch: timestamp.timestamp(),
        connection_id,
        action,
        ip: ip.to_string(),
        port: port.parse().ok(),
    }));
    out
}

fn extract_auth(entry: &Value, msg: &str) -> Classified {
    let outcome = if AUTH_SUCCESS_MESSAGES.contains(&msg) {
        AuthOutcome::Success
    } else if msg == AUTH_FAILURE_MESSAGE {
        AuthOutcome::Failure
    } else {
        return Classified::structured();
    };

    let attr = entry.get("attr").cloned().unwrap_or(Value::Null);
    let username = attr
        .get("user")
        .or_else(|| attr.get("principalName"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            // Rare dict form: {"user": ..., "db": ...}
            Value::Object(m) => m
                .get("user")
                .or_else(|| m.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        });
    let database = attr
        .get("db")
        .or_else(|| attr.get("authenticationDatabase"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let remote_raw = attr
        .get("remote")
        .or_else(|| attr.get("client"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let remote = remote_raw
        .rsplit_once(':')
        .map(|(ip, _)| ip.to_string())
        .unwrap_or_else(|| remote_raw.to_string());

    let timestamp = entry_timestamp(entry);
    let mut out = Classified::structured();
    out.record = Some(LogRecord::Authentication(AuthenticationEvent {
        timestamp,
        ts_epoch: timestamp.timestamp(),
        username,
        database,
        outcome,
        connection_id: ctx_connection_id(entry),
        remote,
        mechanism: attr
            .get("mechanism")
            .and_then(Value::as_str)
            .unwrap_or("SCRAM-SHA-256")
            .to_string(),
    }));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(100)
    }

    fn slow_query_line(duration: i64) -> String {
        format!(
            r#"{{"t":{{"$date":"2024-01-15T14:30:00.123Z"}},"s":"I","c":"COMMAND","id":51803,"ctx":"conn42","msg":"Slow query","attr":{{"type":"command","ns":"shop.orders","command":{{"find":"orders","filter":{{"status":"pending"}},"sort":{{"createdAt":-1}}}},"planSummary":"COLLSCAN","keysExamined":0,"docsExamined":10000,"nreturned":5,"queryHash":"0CB3DF78","durationMillis":{}}}}}"#,
            duration
        )
    }

    #[test]
    fn test_slow_query_extracted() {
        let out = classifier().classify(&slow_query_line(500), "/logs/m.log", 7);
        let Some(LogRecord::SlowQuery(q)) = out.record else {
            panic!("expected slow query record");
        };
        assert_eq!(q.database, "shop");
        assert_eq!(q.collection, "orders");
        assert_eq!(q.duration_ms, 500);
        assert_eq!(q.docs_examined, 10000);
        assert_eq!(q.docs_returned, 5);
        assert_eq!(q.keys_examined, 0);
        assert_eq!(q.plan_summary, "COLLSCAN");
        assert_eq!(q.query_hash.as_deref(), Some("0CB3DF78"));
        assert_eq!(q.connection_id, "conn42");
        assert_eq!(q.line_number, 7);
        assert!(q.query_text.contains("pending"));
    }

    #[test]
    fn test_command_below_threshold_yields_access_only() {
        let out = classifier().classify(&slow_query_line(50), "f", 1);
        assert!(out.record.is_none());
        let access = out.access.expect("access sample");
        assert_eq!(access.database, "shop");
        assert_eq!(access.connection_id, "conn42");
    }

    #[test]
    fn test_threshold_is_exclusive() {
        // Exactly 100 ms is not "above" the threshold.
        let out = classifier().classify(&slow_query_line(100), "f", 1);
        assert!(out.record.is_none());
        assert!(out.access.is_some());
    }

    #[test]
    fn test_returned_fallback_chain() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"COMMAND","ctx":"conn1","msg":"Slow query","attr":{"ns":"a.b","command":{"find":"b"},"numReturned":9,"durationMillis":200}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::SlowQuery(q)) = out.record else {
            panic!("expected record");
        };
        assert_eq!(q.docs_returned, 9);
    }

    #[test]
    fn test_missing_command_gets_placeholder_query() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"COMMAND","ctx":"conn1","msg":"Slow query","attr":{"ns":"a.b","durationMillis":200}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::SlowQuery(q)) = out.record else {
            panic!("expected record");
        };
        assert_eq!(q.query_text, r#"{"find": "b", "filter": {}}"#);
    }

    #[test]
    fn test_resource_metrics_from_storage_data() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"COMMAND","ctx":"conn1","msg":"Slow query","attr":{"ns":"a.b","command":{"find":"b"},"durationMillis":200,"cpuNanos":1500000,"storage":{"data":{"bytesRead":4096,"timeReadingMicros":88}}}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::SlowQuery(q)) = out.record else {
            panic!("expected record");
        };
        assert_eq!(q.resource.bytes_read, Some(4096));
        assert_eq!(q.resource.time_reading_micros, Some(88));
        assert_eq!(q.resource.cpu_nanos, Some(1_500_000));
        assert_eq!(q.resource.bytes_written, None);
    }

    #[test]
    fn test_namespace_without_dot_is_unknown() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"COMMAND","ctx":"conn1","msg":"Slow query","attr":{"ns":"admin","durationMillis":200}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::SlowQuery(q)) = out.record else {
            panic!("expected record");
        };
        assert_eq!(q.database, "unknown");
        assert_eq!(q.collection, "unknown");
    }

    #[test]
    fn test_connection_accepted() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"NETWORK","ctx":"listener","msg":"Connection accepted","attr":{"remote":"10.1.2.3:54321","connectionId":77,"connectionCount":3}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Connection(c)) = out.record else {
            panic!("expected connection event");
        };
        assert_eq!(c.action, ConnectionAction::Accepted);
        assert_eq!(c.ip, "10.1.2.3");
        assert_eq!(c.port, Some(54321));
        assert_eq!(c.connection_id, "conn77");
    }

    #[test]
    fn test_connection_remote_without_port_dropped() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"NETWORK","ctx":"listener","msg":"Connection accepted","attr":{"remote":"badvalue"}}"#;
        let out = classifier().classify(line, "f", 1);
        assert!(out.record.is_none());
        assert!(!out.decode_error);
    }

    #[test]
    fn test_connection_ended() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"NETWORK","ctx":"conn77","msg":"Connection ended","attr":{"remote":"10.1.2.3:54321","connectionId":77}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Connection(c)) = out.record else {
            panic!("expected connection event");
        };
        assert_eq!(c.action, ConnectionAction::Ended);
    }

    #[test]
    fn test_auth_success() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"ACCESS","ctx":"conn77","msg":"Successfully authenticated","attr":{"user":"svc_reader","db":"admin","mechanism":"SCRAM-SHA-1","remote":"10.1.2.3:54321"}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Authentication(a)) = out.record else {
            panic!("expected auth event");
        };
        assert_eq!(a.outcome, AuthOutcome::Success);
        assert_eq!(a.username.as_deref(), Some("svc_reader"));
        assert_eq!(a.database, "admin");
        assert_eq!(a.mechanism, "SCRAM-SHA-1");
        assert_eq!(a.remote, "10.1.2.3");
    }

    #[test]
    fn test_auth_failure_with_auth_db_fallback() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"ACCESS","ctx":"conn78","msg":"Authentication failed","attr":{"principalName":"eve","authenticationDatabase":"admin","client":"10.9.9.9:1111"}}"#;
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Authentication(a)) = out.record else {
            panic!("expected auth event");
        };
        assert_eq!(a.outcome, AuthOutcome::Failure);
        assert_eq!(a.username.as_deref(), Some("eve"));
        assert_eq!(a.database, "admin");
        assert_eq!(a.mechanism, "SCRAM-SHA-256");
        assert_eq!(a.remote, "10.9.9.9");
    }

    #[test]
    fn test_access_other_message_ignored() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"ACCESS","ctx":"conn78","msg":"Checking authorization","attr":{}}"#;
        let out = classifier().classify(line, "f", 1);
        assert!(out.record.is_none());
    }

    #[test]
    fn test_uninteresting_json_not_decoded() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"STORAGE","ctx":"x","msg":"WiredTiger message"}"#;
        let out = classifier().classify(line, "f", 1);
        assert!(out.structured);
        assert!(out.record.is_none());
        assert!(!out.decode_error);
    }

    #[test]
    fn test_malformed_json_slow_query_recovered() {
        // Truncated line: decode fails, regex fallback still extracts it.
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"COMMAND","ctx":"conn5","msg":"Slow query","attr":{"ns":"shop.orders","planSummary":"COLLSCAN","durationMillis":900,"command":{"find":"orders","filter"#;
        let out = classifier().classify(line, "f", 3);
        assert!(out.decode_error);
        let Some(LogRecord::SlowQuery(q)) = out.record else {
            panic!("expected recovered record");
        };
        assert_eq!(q.duration_ms, 900);
        assert_eq!(q.database, "shop");
        assert_eq!(q.plan_summary, "COLLSCAN");
        assert_eq!(q.connection_id, "conn5");
    }

    #[test]
    fn test_malformed_json_without_slow_query_counts_error() {
        let line = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"NETWORK","msg":"Connection accepted","attr":{"remote":"1.2.3.4:5"#;
        let out = classifier().classify(line, "f", 1);
        assert!(out.decode_error);
        assert!(out.record.is_none());
    }

    #[test]
    fn test_legacy_text_connection_accepted() {
        let line = "2019-06-13T10:11:12.000+0000 I NETWORK  [listener] connection accepted from 10.0.0.5:54321 #42 (1 connection now open)";
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Connection(c)) = out.record else {
            panic!("expected connection event");
        };
        assert_eq!(c.action, ConnectionAction::Accepted);
        assert_eq!(c.ip, "10.0.0.5");
        assert_eq!(c.port, Some(54321));
        assert_eq!(c.connection_id, "conn42");
        assert!(!out.structured);
    }

    #[test]
    fn test_legacy_text_end_connection() {
        let line = "2019-06-13T10:11:12.000+0000 I NETWORK  [conn42] end connection 10.0.0.5:54321 (0 connections now open)";
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Connection(c)) = out.record else {
            panic!("expected connection event");
        };
        assert_eq!(c.action, ConnectionAction::Ended);
        assert_eq!(c.connection_id, "conn42");
    }

    #[test]
    fn test_legacy_text_auth_success() {
        let line = "2019-06-13T10:11:12.000+0000 I ACCESS  [conn42] Successfully authenticated as principal svc_reader on admin from client 10.0.0.5:54321";
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Authentication(a)) = out.record else {
            panic!("expected auth event");
        };
        assert_eq!(a.outcome, AuthOutcome::Success);
        assert_eq!(a.username.as_deref(), Some("svc_reader"));
        assert_eq!(a.database, "admin");
        assert_eq!(a.remote, "10.0.0.5");
    }

    #[test]
    fn test_legacy_text_auth_failure() {
        let line = "2019-06-13T10:11:12.000+0000 I ACCESS  [conn43] Failed to authenticate eve@admin with mechanism SCRAM-SHA-256";
        let out = classifier().classify(line, "f", 1);
        let Some(LogRecord::Authentication(a)) = out.record else {
            panic!("expected auth event");
        };
        assert_eq!(a.outcome, AuthOutcome::Failure);
        assert_eq!(a.username.as_deref(), Some("eve"));
    }

    #[test]
    fn test_legacy_text_slow_command() {
        let line = "2019-06-13T10:11:12.000+0000 I COMMAND  [conn42] command shop.orders command: find { find: \"orders\", filter: { status: \"pending\" } } planSummary: COLLSCAN keysExamined:0 docsExamined:10000 nreturned:5 protocol:op_msg 500ms";
        let out = classifier().classify(line, "f", 9);
        let Some(LogRecord::SlowQuery(q)) = out.record else {
            panic!("expected slow query");
        };
        assert_eq!(q.database, "shop");
        assert_eq!(q.collection, "orders");
        assert_eq!(q.duration_ms, 500);
        assert_eq!(q.plan_summary, "COLLSCAN");
        assert_eq!(q.docs_examined, 10000);
        assert_eq!(q.docs_returned, 5);
        assert_eq!(q.connection_id, "conn42");
        assert!(out.access.is_some());
    }

    #[test]
    fn test_legacy_text_fast_command_access_only() {
        let line = "2019-06-13T10:11:12.000+0000 I COMMAND  [conn42] command shop.orders command: find { find: \"orders\" } planSummary: IXSCAN 3ms";
        let out = classifier().classify(line, "f", 1);
        assert!(out.record.is_none());
        assert!(out.access.is_some());
    }

    #[test]
    fn test_unrecognized_text_is_not_an_error() {
        let out = classifier().classify("some random text line", "f", 1);
        assert!(out.record.is_none());
        assert!(out.access.is_none());
        assert!(!out.decode_error);
    }

    #[test]
    fn test_empty_line() {
        let out = classifier().classify("   ", "f", 1);
        assert!(out.record.is_none());
        assert!(!out.structured);
    }
}
