//! SQLite-backed store for extracted records.
//!
//! A [`LogStore`] is either in normal mode (every batch commits on its
//! own for read-after-write consistency) or in bulk-load mode (one
//! session-wide transaction, relaxed pragmas, zero secondary indexes).
//! The mode transitions are explicit; calling an operation in the wrong
//! mode is an [`MoglotError::InvalidMode`] rather than silent
//! misbehavior.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use tracing::{debug, error, info};

use crate::analysis::shape;
use crate::models::{AuthenticationEvent, ConnectionEvent, LogRecord, SlowQueryRecord};
use crate::{MoglotError, Result};

use super::schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Normal,
    BulkLoad,
}

impl StoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::BulkLoad => "bulk-load",
        }
    }
}

/// Username/database binding derived from authentication events,
/// applied to already-stored slow queries by connection id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBinding {
    pub connection_id: String,
    pub username: Option<String>,
    pub database: String,
}

pub struct LogStore {
    conn: Connection,
    /// `None` for an in-memory database.
    path: Option<PathBuf>,
    mode: StoreMode,
}

impl LogStore {
    /// Open (or create) the database at `path` with operational pragmas
    /// and the base schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::prepare(&conn)?;
        info!(db = %path.display(), "analysis database opened");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            mode: StoreMode::Normal,
        })
    }

    /// Open a private in-memory database. Heavy indexes for such a
    /// store must be built inline since no second connection can see it.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn,
            path: None,
            mode: StoreMode::Normal,
        })
    }

    fn prepare(conn: &Connection) -> Result<()> {
        conn.execute_batch(schema::OPERATIONAL_PRAGMAS)?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Backing file, if disk-based.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn require_mode(&self, expected: StoreMode) -> Result<()> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(MoglotError::InvalidMode {
                expected: expected.as_str(),
                actual: self.mode.as_str(),
            })
        }
    }

    /// Enter bulk-load mode: relaxed pragmas and one session-wide
    /// transaction. Batches written until [`finish_bulk_load`] share it
    /// and nothing is durable before that commit.
    ///
    /// [`finish_bulk_load`]: LogStore::finish_bulk_load
    pub fn begin_bulk_load(&mut self) -> Result<()> {
        self.require_mode(StoreMode::Normal)?;
        self.conn.execute_batch(schema::BULK_LOAD_PRAGMAS)?;
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        self.mode = StoreMode::BulkLoad;
        debug!("bulk load started");
        Ok(())
    }

    /// Commit the bulk transaction, restore operational pragmas, build
    /// essential indexes and the full-text index synchronously, and
    /// return the heavy index statements for deferred construction.
    pub fn finish_bulk_load(&mut self) -> Result<&'static [&'static str]> {
        self.require_mode(StoreMode::BulkLoad)?;
        self.conn.execute_batch("COMMIT;")?;
        self.conn.execute_batch(schema::OPERATIONAL_PRAGMAS)?;
        self.mode = StoreMode::Normal;

        for stmt in schema::ESSENTIAL_INDEXES {
            self.conn.execute(stmt, [])?;
        }
        self.conn.execute_batch(schema::FTS_SCHEMA)?;
        self.conn.execute_batch(schema::FTS_REBUILD)?;
        info!(
            essential = schema::ESSENTIAL_INDEXES.len(),
            deferred = schema::HEAVY_INDEXES.len(),
            "bulk load finished, essential indexes ready"
        );
        Ok(schema::HEAVY_INDEXES)
    }

    /// Build the heavy composite indexes on this connection, skipping
    /// (with a log line) any statement that fails. Used for in-memory
    /// stores and as a synchronous fallback.
    pub fn build_heavy_indexes_inline(&mut self) -> Result<()> {
        for stmt in schema::HEAVY_INDEXES {
            if let Err(e) = self.conn.execute(stmt, []) {
                error!(statement = stmt, error = %e, "index build failed, skipping");
            }
        }
        Ok(())
    }

    /// Store one batch of records, routing each to its table. A failed
    /// batch is logged with context and dropped; ingestion of later
    /// batches continues.
    pub fn write_batch(&mut self, records: Vec<LogRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let size = records.len();
        if let Err(e) = self.insert_records(&records) {
            error!(
                batch_size = size,
                error = %e,
                sample = %describe(&records[0]),
                "dropping batch after storage error"
            );
        }
        Ok(())
    }

    fn insert_records(&mut self, records: &[LogRecord]) -> rusqlite::Result<()> {
        match self.mode {
            StoreMode::Normal => {
                let tx = self.conn.unchecked_transaction()?;
                insert_all(&tx, records)?;
                tx.commit()
            }
            // Part of the open session transaction; no commit here.
            StoreMode::BulkLoad => insert_all(&self.conn, records),
        }
    }

    /// Apply authentication-derived usernames to stored slow queries.
    /// The database is only back-filled where it is unknown; the
    /// username always follows the latest authentication on the
    /// connection. Returns the number of updated rows.
    pub fn apply_auth_bindings(&mut self, bindings: &[AuthBinding]) -> Result<usize> {
        self.require_mode(StoreMode::Normal)?;
        if bindings.is_empty() {
            return Ok(0);
        }
        let mut updated = 0usize;
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut set_user = tx.prepare_cached(
                "UPDATE slow_queries SET username = ?1 WHERE connection_id = ?2",
            )?;
            let mut set_db = tx.prepare_cached(
                "UPDATE slow_queries
                 SET database = ?1, namespace = ?1 || '.' || collection
                 WHERE connection_id = ?2
                   AND (database IS NULL OR database = '' OR database = 'unknown')",
            )?;
            for binding in bindings {
                if let Some(user) = &binding.username {
                    updated += set_user.execute(params![user, binding.connection_id])?;
                }
                if !binding.database.is_empty() && binding.database != "unknown" {
                    updated += set_db.execute(params![binding.database, binding.connection_id])?;
                }
            }
        }
        tx.commit()?;
        debug!(bindings = bindings.len(), updated, "auth correlation applied");
        Ok(updated)
    }

    /// Drop and recreate all tables. Indexes and the full-text index go
    /// with them, leaving the store in the zero-index state a bulk load
    /// expects.
    pub fn clear(&mut self) -> Result<()> {
        self.require_mode(StoreMode::Normal)?;
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS query_fts;
             DROP TABLE IF EXISTS slow_queries;
             DROP TABLE IF EXISTS connections;
             DROP TABLE IF EXISTS authentications;",
        )?;
        self.conn.execute_batch(schema::SCHEMA)?;
        info!("store cleared, all tables recreated without indexes");
        Ok(())
    }
}

impl crate::ingest::RecordSink for LogStore {
    fn write_batch(&mut self, records: Vec<LogRecord>) -> Result<()> {
        LogStore::write_batch(self, records)
    }
}

fn insert_all(conn: &Connection, records: &[LogRecord]) -> rusqlite::Result<()> {
    for record in records {
        match record {
            LogRecord::SlowQuery(q) => insert_slow_query(conn, q)?,
            LogRecord::Connection(c) => insert_connection(conn, c)?,
            LogRecord::Authentication(a) => insert_authentication(conn, a)?,
        }
    }
    Ok(())
}

const INSERT_SLOW_BASE: &str = "
    INSERT INTO slow_queries
    (timestamp, ts_epoch, database, collection, duration, docs_examined, docs_returned,
     keys_examined, query_hash, plan_summary, file_path,
     line_number, namespace, query_text, connection_id, username)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)";

const INSERT_SLOW_EXTENDED: &str = "
    INSERT INTO slow_queries
    (timestamp, ts_epoch, database, collection, duration, docs_examined, docs_returned,
     keys_examined, query_hash, plan_summary, file_path,
     line_number, namespace, query_text, connection_id, username,
     cpu_nanos, bytes_read, bytes_written, time_reading_micros, time_writing_micros)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
            ?17, ?18, ?19, ?20, ?21)";

/// Routes to the row shape matching the record's generation: records
/// without resource metrics take the base insert, leaving those
/// columns NULL.
fn insert_slow_query(conn: &Connection, q: &SlowQueryRecord) -> rusqlite::Result<()> {
    let query_hash = match &q.query_hash {
        Some(h) => h.clone(),
        None => shape::synthetic_query_hash(&q.database, &q.collection, &q.query_text),
    };
    if q.resource.is_empty() {
        let mut stmt = conn.prepare_cached(INSERT_SLOW_BASE)?;
        stmt.execute(params![
            q.timestamp.to_rfc3339(),
            q.ts_epoch,
            q.database,
            q.collection,
            q.duration_ms,
            q.docs_examined,
            q.docs_returned,
            q.keys_examined,
            query_hash,
            q.plan_summary,
            q.file_path,
            q.line_number,
            q.namespace(),
            q.query_text,
            q.connection_id,
            q.username,
        ])?;
    } else {
        let mut stmt = conn.prepare_cached(INSERT_SLOW_EXTENDED)?;
        stmt.execute(params![
            q.timestamp.to_rfc3339(),
            q.ts_epoch,
            q.database,
            q.collection,
            q.duration_ms,
            q.docs_examined,
            q.docs_returned,
            q.keys_examined,
            query_hash,
            q.plan_summary,
            q.file_path,
            q.line_number,
            q.namespace(),
            q.query_text,
            q.connection_id,
            q.username,
            q.resource.cpu_nanos,
            q.resource.bytes_read,
            q.resource.bytes_written,
            q.resource.time_reading_micros,
            q.resource.time_writing_micros,
        ])?;
    }
    Ok(())
}

fn insert_connection(conn: &Connection, c: &ConnectionEvent) -> rusqlite::Result<()> {
    let details = serde_json::json!({ "ip": c.ip, "port": c.port }).to_string();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO connections (conn_id, timestamp, timestamp_str, action, details)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    stmt.execute(params![
        c.connection_id,
        c.ts_epoch,
        c.timestamp.to_rfc3339(),
        c.action.as_str(),
        details,
    ])?;
    Ok(())
}

fn insert_authentication(conn: &Connection, a: &AuthenticationEvent) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO authentications
         (timestamp, timestamp_str, user, database, result, connection_id, remote, mechanism)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    stmt.execute(params![
        a.ts_epoch,
        a.timestamp.to_rfc3339(),
        a.username,
        a.database,
        a.outcome.as_str(),
        a.connection_id,
        a.remote,
        a.mechanism,
    ])?;
    Ok(())
}

fn describe(record: &LogRecord) -> String {
    match record {
        LogRecord::SlowQuery(q) => format!("slow_query {} {}ms", q.namespace(), q.duration_ms),
        LogRecord::Connection(c) => format!("connection {} {}", c.connection_id, c.action.as_str()),
        LogRecord::Authentication(a) => {
            format!("auth {} {}", a.connection_id, a.outcome.as_str())
        }
    }
}
