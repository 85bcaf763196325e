//! Table definitions, pragma sets, and index DDL.
//!
//! Tables are created without secondary indexes; only primary keys
//! exist during bulk load. Essential single-column indexes are built
//! synchronously when a load finishes, heavy composite indexes go to
//! the background build service.

/// Base tables. `slow_queries` carries two generations of row shape:
/// the resource-metric columns stay NULL for records extracted from
/// logs that predate them.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS slow_queries (
    id INTEGER PRIMARY KEY,
    timestamp TEXT,
    ts_epoch INTEGER DEFAULT NULL,
    database TEXT,
    collection TEXT,
    duration INTEGER,
    docs_examined INTEGER,
    docs_returned INTEGER,
    keys_examined INTEGER,
    query_hash TEXT,
    plan_summary TEXT,
    file_path TEXT,
    line_number INTEGER,
    namespace TEXT,
    query_text TEXT,
    connection_id TEXT,
    username TEXT,
    cpu_nanos INTEGER DEFAULT NULL,
    bytes_read INTEGER DEFAULT NULL,
    bytes_written INTEGER DEFAULT NULL,
    time_reading_micros INTEGER DEFAULT NULL,
    time_writing_micros INTEGER DEFAULT NULL
);

CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY,
    conn_id TEXT,
    timestamp INTEGER NOT NULL,
    timestamp_str TEXT,
    action TEXT,
    details TEXT
);

CREATE TABLE IF NOT EXISTS authentications (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    timestamp_str TEXT,
    user TEXT,
    database TEXT,
    result TEXT,
    connection_id TEXT,
    remote TEXT,
    mechanism TEXT
);
"#;

/// External-content full-text index over query text and namespace.
pub const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS query_fts USING fts5(
    query_text, namespace,
    content='slow_queries',
    content_rowid='id'
);
"#;

pub const FTS_REBUILD: &str = "INSERT INTO query_fts(query_fts) VALUES('rebuild');";

/// Relaxed durability for bulk loading. WAL stays on (configured at
/// open) to avoid lock churn; everything else trades safety for
/// throughput inside the session transaction.
pub const BULK_LOAD_PRAGMAS: &str = "
    PRAGMA synchronous=OFF;
    PRAGMA cache_size=200000;
    PRAGMA temp_store=MEMORY;
    PRAGMA busy_timeout=30000;
    PRAGMA wal_autocheckpoint=10000;
    PRAGMA mmap_size=1073741824;
";

/// Normal operational settings.
pub const OPERATIONAL_PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA locking_mode=NORMAL;
    PRAGMA cache_size=50000;
    PRAGMA temp_store=MEMORY;
    PRAGMA mmap_size=536870912;
    PRAGMA page_size=4096;
";

/// Settings for the dedicated background index-build connection. Long
/// busy-timeout because index creation contends with reads.
pub const INDEX_BUILD_PRAGMAS: &str = "
    PRAGMA busy_timeout=60000;
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
";

/// Cheap single-column indexes built synchronously at the end of a
/// bulk load so aggregate queries work immediately.
pub const ESSENTIAL_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_basic_timestamp ON slow_queries(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_duration_desc ON slow_queries(duration DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ts_epoch ON slow_queries(ts_epoch)",
    "CREATE INDEX IF NOT EXISTS idx_conn_timestamp ON connections(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_auth_timestamp ON authentications(timestamp)",
];

/// Composite indexes deferred to the background build service. Queries
/// run without them, just slower.
pub const HEAVY_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_db_plan_dur_ts ON slow_queries(database, plan_summary, duration DESC, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_db_coll_dur_ts ON slow_queries(database, collection, duration DESC, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ts_db_dur ON slow_queries(timestamp DESC, database, duration DESC)",
    "CREATE INDEX IF NOT EXISTS idx_namespace ON slow_queries(namespace)",
    "CREATE INDEX IF NOT EXISTS idx_plan_summary ON slow_queries(plan_summary)",
    "CREATE INDEX IF NOT EXISTS idx_hash_dur ON slow_queries(query_hash, duration DESC)",
    "CREATE INDEX IF NOT EXISTS idx_timestamp_desc ON slow_queries(timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_auth_user ON authentications(user)",
];

/// Databases excluded from user-facing aggregates.
pub const SYSTEM_DATABASES: &[&str] = &["admin", "local", "config", "$external", "unknown"];

/// `NOT IN (...)` fragment matching [`SYSTEM_DATABASES`].
pub const SYSTEM_DB_FILTER: &str =
    "database NOT IN ('admin', 'local', 'config', '$external', 'unknown')";
