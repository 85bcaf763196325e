//! Read-side SQL: pattern aggregation, dashboard statistics, paginated
//! listing, full-text search, and resource workload summaries.
//!
//! All aggregates run against whatever indexes currently exist; before
//! the heavy composite indexes land they are simply slower.

use std::collections::HashMap;

use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::Result;

use super::schema;
use super::store::{AuthBinding, LogStore};

/// Grouping strategy for pattern aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternGrouping {
    /// `query_hash + database + collection`, the finest grain.
    #[default]
    PatternKey,
    /// `database.collection`; hash and plan become "MIXED".
    Namespace,
    /// Hash alone, grouping across namespaces.
    QueryHash,
}

impl PatternGrouping {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PatternKey => "pattern_key",
            Self::Namespace => "namespace",
            Self::QueryHash => "query_hash",
        }
    }
}

/// Plan-summary filter. `Other` selects rows that are neither COLLSCAN
/// nor IXSCAN, including NULL plans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanFilter {
    Exact(String),
    Other,
}

/// Shared filter set for slow-query aggregates.
#[derive(Debug, Clone)]
pub struct QueryFilters {
    /// Minimum duration (inclusive).
    pub threshold_ms: i64,
    pub database: Option<String>,
    pub plan_summary: Option<PlanFilter>,
    pub namespace: Option<String>,
    pub start_epoch: Option<i64>,
    pub end_epoch: Option<i64>,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            threshold_ms: 100,
            database: None,
            plan_summary: None,
            namespace: None,
            start_epoch: None,
            end_epoch: None,
        }
    }
}

impl QueryFilters {
    /// WHERE clause plus bound parameters, always ending with the
    /// system-database exclusion.
    fn to_sql(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conds: Vec<String> = vec!["duration >= ?".into()];
        let mut binds: Vec<Box<dyn ToSql>> = vec![Box::new(self.threshold_ms)];
        if let Some(db) = &self.database {
            conds.push("database = ?".into());
            binds.push(Box::new(db.clone()));
        }
        match &self.plan_summary {
            Some(PlanFilter::Exact(plan)) => {
                conds.push("plan_summary = ?".into());
                binds.push(Box::new(plan.clone()));
            }
            Some(PlanFilter::Other) => {
                conds.push(
                    "(plan_summary NOT IN ('COLLSCAN', 'IXSCAN') OR plan_summary IS NULL)".into(),
                );
            }
            None => {}
        }
        if let Some(ns) = &self.namespace {
            conds.push("namespace = ?".into());
            binds.push(Box::new(ns.clone()));
        }
        if let Some(start) = self.start_epoch {
            conds.push("ts_epoch >= ?".into());
            binds.push(Box::new(start));
        }
        if let Some(end) = self.end_epoch {
            conds.push("ts_epoch <= ?".into());
            binds.push(Box::new(end));
        }
        conds.push(schema::SYSTEM_DB_FILTER.into());
        (format!("WHERE {}", conds.join(" AND ")), binds)
    }
}

/// One aggregated group from the fact table. Derived analysis metrics
/// (selectivity, scoring) are layered on by the pattern aggregator.
#[derive(Debug, Clone)]
pub struct PatternRow {
    pub query_hash: String,
    pub database: String,
    pub collection: String,
    pub namespace: String,
    pub plan_summary: String,
    pub execution_count: i64,
    pub avg_duration: f64,
    pub min_duration: i64,
    pub max_duration: i64,
    pub total_duration: i64,
    pub sum_docs_examined: i64,
    pub sum_docs_returned: i64,
    pub sum_keys_examined: i64,
    pub avg_docs_examined: f64,
    pub avg_docs_returned: f64,
    pub avg_keys_examined: f64,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    /// Text of the slowest execution in the group (ties broken toward
    /// the more recent sample).
    pub sample_query: Option<String>,
}

/// A stored slow-query row, as listed or returned from search.
#[derive(Debug, Clone, Serialize)]
pub struct SlowQueryRow {
    pub id: i64,
    pub timestamp: Option<String>,
    pub ts_epoch: Option<i64>,
    pub database: String,
    pub collection: String,
    pub duration_ms: i64,
    pub docs_examined: i64,
    pub docs_returned: i64,
    pub keys_examined: i64,
    pub query_hash: Option<String>,
    pub plan_summary: Option<String>,
    pub file_path: String,
    pub line_number: u64,
    pub namespace: String,
    pub query_text: String,
    pub connection_id: String,
    pub username: Option<String>,
    pub cpu_nanos: Option<i64>,
    pub bytes_read: Option<i64>,
    pub bytes_written: Option<i64>,
    pub time_reading_micros: Option<i64>,
    pub time_writing_micros: Option<i64>,
}

/// One page of rows plus the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn pages(&self) -> usize {
        self.total.div_ceil(self.per_page.max(1))
    }

    pub fn has_next(&self) -> bool {
        self.page * self.per_page < self.total
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopOperation {
    pub database: String,
    pub collection: String,
    pub avg_duration: f64,
    pub count: i64,
}

/// Client address aggregated from authentication events.
#[derive(Debug, Clone, Serialize)]
pub struct TopSource {
    pub ip: String,
    pub connection_count: i64,
    pub unique_users: i64,
    pub auth_count: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardStats {
    pub total_slow_queries: i64,
    pub avg_duration: f64,
    pub max_duration: i64,
    pub avg_docs_examined: f64,
    pub unique_namespaces: i64,
    pub unique_databases: i64,
    pub unique_patterns: i64,
    pub collscan_count: i64,
    pub total_connections: i64,
    pub total_authentications: i64,
    pub top_operations: Vec<TopOperation>,
    pub top_sources: Vec<TopSource>,
}

/// One group in a resource top list.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceTopRow {
    pub database: String,
    pub collection: String,
    pub plan_summary: String,
    pub query_count: i64,
    pub metric_total: i64,
    pub metric_avg: i64,
    pub avg_duration_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceTotals {
    pub total_queries: i64,
    pub with_bytes_read: i64,
    pub with_bytes_written: i64,
    pub with_cpu_data: i64,
    pub total_bytes_read: i64,
    pub total_bytes_written: i64,
    pub total_cpu_nanos: i64,
}

/// Top operations by storage and CPU load, from the resource-metric
/// columns of the extended row generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceWorkload {
    pub top_bytes_read: Vec<ResourceTopRow>,
    pub top_bytes_written: Vec<ResourceTopRow>,
    pub top_io_time: Vec<ResourceTopRow>,
    pub top_cpu: Vec<ResourceTopRow>,
    pub totals: ResourceTotals,
}

const SLOW_QUERY_COLUMNS: &str = "id, timestamp, ts_epoch, database, collection, duration, \
     docs_examined, docs_returned, keys_examined, query_hash, plan_summary, file_path, \
     line_number, namespace, query_text, connection_id, username, \
     cpu_nanos, bytes_read, bytes_written, time_reading_micros, time_writing_micros";

fn slow_query_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SlowQueryRow> {
    Ok(SlowQueryRow {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        ts_epoch: row.get(2)?,
        database: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        collection: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        duration_ms: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
        docs_examined: row.get::<_, Option<i64>>(6)?.unwrap_or_default(),
        docs_returned: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
        keys_examined: row.get::<_, Option<i64>>(8)?.unwrap_or_default(),
        query_hash: row.get(9)?,
        plan_summary: row.get(10)?,
        file_path: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        line_number: row.get::<_, Option<u64>>(12)?.unwrap_or_default(),
        namespace: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
        query_text: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        connection_id: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
        username: row.get(16)?,
        cpu_nanos: row.get(17)?,
        bytes_read: row.get(18)?,
        bytes_written: row.get(19)?,
        time_reading_micros: row.get(20)?,
        time_writing_micros: row.get(21)?,
    })
}

impl LogStore {
    /// Aggregate slow queries into pattern groups. The slowest-sample
    /// subquery orders by duration, then recency, so an equal-duration
    /// but newer execution wins the tie.
    pub fn pattern_rows(
        &self,
        grouping: PatternGrouping,
        filters: &QueryFilters,
        limit: usize,
    ) -> Result<Vec<PatternRow>> {
        let (select_fields, group_by, join) = match grouping {
            PatternGrouping::Namespace => (
                "'MIXED' as query_hash, sq.database, sq.collection, sq.namespace, \
                 'MIXED' as plan_summary",
                "sq.database, sq.collection",
                "sq2.database = sq.database AND sq2.collection = sq.collection",
            ),
            PatternGrouping::QueryHash => (
                "sq.query_hash, 'MIXED' as database, 'MIXED' as collection, \
                 'MIXED' as namespace, 'MIXED' as plan_summary",
                "sq.query_hash",
                "sq2.query_hash = sq.query_hash",
            ),
            PatternGrouping::PatternKey => (
                "sq.query_hash, sq.database, sq.collection, sq.namespace, sq.plan_summary",
                "sq.query_hash, sq.database, sq.collection",
                "sq2.query_hash = sq.query_hash AND sq2.database = sq.database \
                 AND sq2.collection = sq.collection",
            ),
        };
        let (where_clause, mut binds) = filters.to_sql();
        let sql = format!(
            "SELECT {select_fields},
                COUNT(*) as execution_count,
                COALESCE(AVG(sq.duration), 0) as avg_duration,
                COALESCE(MIN(sq.duration), 0) as min_duration,
                COALESCE(MAX(sq.duration), 0) as max_duration,
                COALESCE(SUM(sq.duration), 0) as total_duration,
                COALESCE(SUM(sq.docs_examined), 0) as sum_docs_examined,
                COALESCE(SUM(sq.docs_returned), 0) as sum_docs_returned,
                COALESCE(SUM(sq.keys_examined), 0) as sum_keys_examined,
                COALESCE(AVG(sq.docs_examined), 0) as avg_docs_examined,
                COALESCE(AVG(sq.docs_returned), 0) as avg_docs_returned,
                COALESCE(AVG(sq.keys_examined), 0) as avg_keys_examined,
                MIN(sq.timestamp) as first_seen,
                MAX(sq.timestamp) as last_seen,
                (SELECT sq2.query_text FROM slow_queries sq2
                 WHERE {join}
                 ORDER BY sq2.duration DESC, sq2.ts_epoch DESC LIMIT 1) as sample_query
             FROM slow_queries sq
             {where_clause}
             GROUP BY {group_by}
             ORDER BY avg_duration DESC, execution_count DESC
             LIMIT ?"
        );
        binds.push(Box::new(limit as i64));

        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), |row| {
            Ok(PatternRow {
                query_hash: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                database: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                collection: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                namespace: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                plan_summary: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                execution_count: row.get(5)?,
                avg_duration: row.get(6)?,
                min_duration: row.get(7)?,
                max_duration: row.get(8)?,
                total_duration: row.get(9)?,
                sum_docs_examined: row.get(10)?,
                sum_docs_returned: row.get(11)?,
                sum_keys_examined: row.get(12)?,
                avg_docs_examined: row.get(13)?,
                avg_docs_returned: row.get(14)?,
                avg_keys_examined: row.get(15)?,
                first_seen: row.get(16)?,
                last_seen: row.get(17)?,
                sample_query: row.get(18)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Combined headline numbers for the dashboard.
    pub fn dashboard_stats(
        &self,
        start_epoch: Option<i64>,
        end_epoch: Option<i64>,
    ) -> Result<DashboardStats> {
        let mut date_conds = String::new();
        let mut binds: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(start) = start_epoch {
            date_conds.push_str(" AND ts_epoch >= ?");
            binds.push(Box::new(start));
        }
        if let Some(end) = end_epoch {
            date_conds.push_str(" AND ts_epoch <= ?");
            binds.push(Box::new(end));
        }

        let sql = format!(
            "SELECT COUNT(*),
                COALESCE(AVG(duration), 0),
                COALESCE(MAX(duration), 0),
                COALESCE(AVG(docs_examined), 0),
                COUNT(DISTINCT database || '.' || collection),
                COUNT(DISTINCT database),
                COUNT(DISTINCT query_hash),
                COUNT(CASE WHEN plan_summary = 'COLLSCAN' THEN 1 END)
             FROM slow_queries
             WHERE {}{}",
            schema::SYSTEM_DB_FILTER,
            date_conds
        );
        let mut stats = self.connection().query_row(
            &sql,
            params_from_iter(binds.iter().map(|b| b.as_ref())),
            |row| {
                Ok(DashboardStats {
                    total_slow_queries: row.get(0)?,
                    avg_duration: row.get(1)?,
                    max_duration: row.get(2)?,
                    avg_docs_examined: row.get(3)?,
                    unique_namespaces: row.get(4)?,
                    unique_databases: row.get(5)?,
                    unique_patterns: row.get(6)?,
                    collscan_count: row.get(7)?,
                    ..Default::default()
                })
            },
        )?;

        // Event tables index epoch seconds directly in `timestamp`.
        let event_range = |table: &str| -> Result<i64> {
            let mut conds = String::from("1=1");
            let mut binds: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(start) = start_epoch {
                conds.push_str(" AND timestamp >= ?");
                binds.push(Box::new(start));
            }
            if let Some(end) = end_epoch {
                conds.push_str(" AND timestamp <= ?");
                binds.push(Box::new(end));
            }
            let n = self.connection().query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE {}", table, conds),
                params_from_iter(binds),
                |row| row.get(0),
            )?;
            Ok(n)
        };
        stats.total_connections = event_range("connections")?;
        stats.total_authentications = event_range("authentications")?;

        let sql = format!(
            "SELECT database, collection, AVG(duration) as avg_dur, COUNT(*)
             FROM slow_queries
             WHERE database IS NOT NULL AND collection IS NOT NULL
               AND {}{}
             GROUP BY database, collection
             ORDER BY avg_dur DESC
             LIMIT 5",
            schema::SYSTEM_DB_FILTER,
            date_conds
        );
        let mut stmt = self.connection().prepare(&sql)?;
        stats.top_operations = stmt
            .query_map(params_from_iter(binds.iter().map(|b| b.as_ref())), |row| {
                Ok(TopOperation {
                    database: row.get(0)?,
                    collection: row.get(1)?,
                    avg_duration: row.get(2)?,
                    count: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        stats.top_sources = self.top_auth_sources(start_epoch, end_epoch, 10)?;
        Ok(stats)
    }

    /// Client addresses ranked by authentication volume.
    pub fn top_auth_sources(
        &self,
        start_epoch: Option<i64>,
        end_epoch: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TopSource>> {
        let mut conds = String::from("remote IS NOT NULL AND remote != ''");
        let mut binds: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(start) = start_epoch {
            conds.push_str(" AND timestamp >= ?");
            binds.push(Box::new(start));
        }
        if let Some(end) = end_epoch {
            conds.push_str(" AND timestamp <= ?");
            binds.push(Box::new(end));
        }
        binds.push(Box::new(limit as i64));
        let sql = format!(
            "SELECT remote,
                COUNT(DISTINCT connection_id),
                COUNT(DISTINCT user),
                COUNT(*) as auth_count
             FROM authentications
             WHERE {}
             GROUP BY remote
             ORDER BY auth_count DESC
             LIMIT ?",
            conds
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), |row| {
            Ok(TopSource {
                ip: row.get(0)?,
                connection_count: row.get(1)?,
                unique_users: row.get(2)?,
                auth_count: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Earliest and latest event epoch across all tables, or `None`
    /// when the store holds nothing dated.
    pub fn date_range(&self) -> Result<Option<(i64, i64)>> {
        let range: (Option<i64>, Option<i64>) = self.connection().query_row(
            "SELECT MIN(low), MAX(high) FROM (
                SELECT MIN(ts_epoch) AS low, MAX(ts_epoch) AS high
                    FROM slow_queries WHERE ts_epoch IS NOT NULL
                UNION ALL
                SELECT MIN(timestamp), MAX(timestamp) FROM connections WHERE timestamp > 0
                UNION ALL
                SELECT MIN(timestamp), MAX(timestamp) FROM authentications WHERE timestamp > 0
             )",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match range {
            (Some(low), Some(high)) => Some((low, high)),
            _ => None,
        })
    }

    /// Distinct user databases, alphabetically.
    pub fn databases(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT database FROM slow_queries
             WHERE database IS NOT NULL AND {}
             ORDER BY database",
            schema::SYSTEM_DB_FILTER
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// One page of stored slow queries, slowest first.
    pub fn slow_queries_page(
        &self,
        filters: &QueryFilters,
        page: usize,
        per_page: usize,
    ) -> Result<Page<SlowQueryRow>> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let (where_clause, binds) = filters.to_sql();

        let total: i64 = self.connection().query_row(
            &format!("SELECT COUNT(*) FROM slow_queries {}", where_clause),
            params_from_iter(binds.iter().map(|b| b.as_ref())),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {SLOW_QUERY_COLUMNS} FROM slow_queries {where_clause}
             ORDER BY duration DESC
             LIMIT ? OFFSET ?"
        );
        let mut all_binds = binds;
        all_binds.push(Box::new(per_page as i64));
        all_binds.push(Box::new(((page - 1) * per_page) as i64));
        let mut stmt = self.connection().prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(all_binds), slow_query_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            page,
            per_page,
            total: total as usize,
        })
    }

    /// Full-text search over query text and namespace. Empty until a
    /// bulk load has built the index; reports that case as zero hits.
    pub fn search_queries_fts(
        &self,
        term: &str,
        threshold_ms: i64,
        page: usize,
        per_page: usize,
    ) -> Result<Page<SlowQueryRow>> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let empty = Page {
            items: Vec::new(),
            page,
            per_page,
            total: 0,
        };
        let term = term.trim();
        if term.is_empty() {
            return Ok(empty);
        }
        if !self.has_fts_index()? {
            debug!("full-text index not built yet, returning no hits");
            return Ok(empty);
        }

        let sanitized = term.replace('"', "\"\"");
        let fts_query = format!("query_text:\"{0}\" OR namespace:\"{0}\"", sanitized);

        let total: i64 = self.connection().query_row(
            &format!(
                "SELECT COUNT(*)
                 FROM query_fts
                 JOIN slow_queries ON query_fts.rowid = slow_queries.id
                 WHERE query_fts MATCH ?1
                   AND slow_queries.duration >= ?2
                   AND slow_queries.{}",
                schema::SYSTEM_DB_FILTER
            ),
            params![fts_query, threshold_ms],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {}
             FROM query_fts
             JOIN slow_queries ON query_fts.rowid = slow_queries.id
             WHERE query_fts MATCH ?1
               AND slow_queries.duration >= ?2
               AND slow_queries.{}
             ORDER BY rank, slow_queries.duration DESC
             LIMIT ?3 OFFSET ?4",
            qualified_slow_columns(),
            schema::SYSTEM_DB_FILTER
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let items = stmt
            .query_map(
                params![
                    fts_query,
                    threshold_ms,
                    per_page as i64,
                    ((page - 1) * per_page) as i64
                ],
                slow_query_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            page,
            per_page,
            total: total as usize,
        })
    }

    fn has_fts_index(&self) -> Result<bool> {
        let found: Option<String> = self
            .connection()
            .query_row(
                "SELECT name FROM sqlite_master WHERE name = 'query_fts'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Storage and CPU load summary built from the resource columns.
    /// Rows from the base generation (NULL metrics) never appear in the
    /// top lists.
    pub fn resource_workload(&self) -> Result<ResourceWorkload> {
        let top = |metric: &str, extra_sum: &str| -> Result<Vec<ResourceTopRow>> {
            let sql = format!(
                "SELECT database, collection, plan_summary,
                    COUNT(*),
                    SUM({metric}) as metric_total,
                    COALESCE(AVG({metric}), 0),
                    COALESCE(AVG(duration), 0){extra_sum}
                 FROM slow_queries
                 WHERE {metric} > 0
                 GROUP BY database, collection, plan_summary
                 ORDER BY metric_total DESC
                 LIMIT 10"
            );
            let mut stmt = self.connection().prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(ResourceTopRow {
                    database: row.get::<_, Option<String>>(0)?.unwrap_or_else(|| "unknown".into()),
                    collection: row
                        .get::<_, Option<String>>(1)?
                        .unwrap_or_else(|| "unknown".into()),
                    plan_summary: row
                        .get::<_, Option<String>>(2)?
                        .unwrap_or_else(|| "unknown".into()),
                    query_count: row.get(3)?,
                    metric_total: row.get(4)?,
                    metric_avg: row.get::<_, f64>(5)? as i64,
                    avg_duration_ms: row.get::<_, f64>(6)? as i64,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        };

        let totals = self.connection().query_row(
            "SELECT COUNT(*),
                COUNT(CASE WHEN bytes_read > 0 THEN 1 END),
                COUNT(CASE WHEN bytes_written > 0 THEN 1 END),
                COUNT(CASE WHEN cpu_nanos > 0 THEN 1 END),
                COALESCE(SUM(bytes_read), 0),
                COALESCE(SUM(bytes_written), 0),
                COALESCE(SUM(cpu_nanos), 0)
             FROM slow_queries",
            [],
            |row| {
                Ok(ResourceTotals {
                    total_queries: row.get(0)?,
                    with_bytes_read: row.get(1)?,
                    with_bytes_written: row.get(2)?,
                    with_cpu_data: row.get(3)?,
                    total_bytes_read: row.get(4)?,
                    total_bytes_written: row.get(5)?,
                    total_cpu_nanos: row.get(6)?,
                })
            },
        )?;

        Ok(ResourceWorkload {
            top_bytes_read: top("bytes_read", "")?,
            top_bytes_written: top("bytes_written", "")?,
            top_io_time: top("time_reading_micros", "")?,
            top_cpu: top("cpu_nanos", "")?,
            totals,
        })
    }

    /// All stored rows matching the filters, unpaginated, for the
    /// suggestion engine. Capped to protect memory on huge stores.
    pub fn slow_query_rows(&self, filters: &QueryFilters, cap: usize) -> Result<Vec<SlowQueryRow>> {
        let (where_clause, mut binds) = filters.to_sql();
        let sql = format!(
            "SELECT {SLOW_QUERY_COLUMNS} FROM slow_queries {where_clause}
             ORDER BY duration DESC
             LIMIT ?"
        );
        binds.push(Box::new(cap as i64));
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(binds), slow_query_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest authentication per connection, in log-timestamp order so
    /// parallel-chunk arrival order cannot change which one wins.
    pub fn latest_auth_bindings(&self) -> Result<Vec<AuthBinding>> {
        let mut stmt = self.connection().prepare(
            "SELECT connection_id, user, database FROM authentications
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AuthBinding {
                connection_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                username: row.get(1)?,
                database: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })?;
        let mut latest: HashMap<String, AuthBinding> = HashMap::new();
        for binding in rows {
            let binding = binding?;
            if binding.connection_id.is_empty() {
                continue;
            }
            latest.insert(binding.connection_id.clone(), binding);
        }
        let mut bindings: Vec<AuthBinding> = latest.into_values().collect();
        bindings.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        Ok(bindings)
    }
}

fn qualified_slow_columns() -> String {
    SLOW_QUERY_COLUMNS
        .split(", ")
        .map(|c| format!("slow_queries.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AuthOutcome, AuthenticationEvent, LogRecord, ResourceMetrics, SlowQueryRecord,
    };
    use chrono::{TimeZone, Utc};

    fn record(
        db: &str,
        coll: &str,
        duration: i64,
        plan: &str,
        hash: &str,
        minute: u32,
    ) -> LogRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 14, minute, 0).unwrap();
        LogRecord::SlowQuery(SlowQueryRecord {
            timestamp: ts,
            ts_epoch: ts.timestamp(),
            database: db.into(),
            collection: coll.into(),
            duration_ms: duration,
            docs_examined: 1000,
            docs_returned: 10,
            keys_examined: 5,
            query_hash: Some(hash.into()),
            plan_summary: plan.into(),
            query_text: format!(r#"{{"find": "{coll}", "filter": {{"status": "x"}}}}"#),
            file_path: "t.log".into(),
            line_number: 1,
            connection_id: "conn1".into(),
            username: None,
            resource: ResourceMetrics::default(),
        })
    }

    fn store_with_rows() -> LogStore {
        let mut store = LogStore::open_in_memory().unwrap();
        store
            .write_batch(vec![
                record("shop", "orders", 500, "COLLSCAN", "AAA", 1),
                record("shop", "orders", 300, "COLLSCAN", "AAA", 2),
                record("shop", "users", 900, "IXSCAN { _id: 1 }", "BBB", 3),
                record("billing", "invoices", 1200, "COLLSCAN", "CCC", 4),
                record("admin", "system", 5000, "COLLSCAN", "SYS", 5),
            ])
            .unwrap();
        store
    }

    #[test]
    fn test_pattern_rows_group_and_exclude_system() {
        let store = store_with_rows();
        let rows = store
            .pattern_rows(PatternGrouping::PatternKey, &QueryFilters::default(), 100)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.database != "admin"));

        let orders = rows.iter().find(|r| r.collection == "orders").unwrap();
        assert_eq!(orders.execution_count, 2);
        assert_eq!(orders.min_duration, 300);
        assert_eq!(orders.max_duration, 500);
        assert_eq!(orders.total_duration, 800);
        assert_eq!(orders.sum_docs_examined, 2000);
    }

    #[test]
    fn test_pattern_rows_ordered_by_avg_duration() {
        let store = store_with_rows();
        let rows = store
            .pattern_rows(PatternGrouping::PatternKey, &QueryFilters::default(), 100)
            .unwrap();
        let avgs: Vec<f64> = rows.iter().map(|r| r.avg_duration).collect();
        assert!(avgs.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_namespace_grouping_mixes_hash_and_plan() {
        let store = store_with_rows();
        let rows = store
            .pattern_rows(PatternGrouping::Namespace, &QueryFilters::default(), 100)
            .unwrap();
        assert!(rows.iter().all(|r| r.query_hash == "MIXED"));
        assert!(rows.iter().all(|r| r.plan_summary == "MIXED"));
    }

    #[test]
    fn test_sample_query_prefers_slowest_then_newest() {
        let mut store = LogStore::open_in_memory().unwrap();
        let mut a = record("shop", "orders", 500, "COLLSCAN", "AAA", 1);
        if let LogRecord::SlowQuery(q) = &mut a {
            q.query_text = "older".into();
        }
        let mut b = record("shop", "orders", 500, "COLLSCAN", "AAA", 30);
        if let LogRecord::SlowQuery(q) = &mut b {
            q.query_text = "newer".into();
        }
        store.write_batch(vec![a, b]).unwrap();

        let rows = store
            .pattern_rows(PatternGrouping::PatternKey, &QueryFilters::default(), 10)
            .unwrap();
        assert_eq!(rows[0].sample_query.as_deref(), Some("newer"));
    }

    #[test]
    fn test_plan_filter_other_excludes_known_plans() {
        let mut store = store_with_rows();
        store
            .write_batch(vec![record("shop", "misc", 400, "COUNT_SCAN", "DDD", 6)])
            .unwrap();
        let filters = QueryFilters {
            plan_summary: Some(PlanFilter::Other),
            ..Default::default()
        };
        let rows = store
            .pattern_rows(PatternGrouping::PatternKey, &filters, 100)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].collection, "misc");
    }

    #[test]
    fn test_duration_threshold_filters() {
        let store = store_with_rows();
        let filters = QueryFilters {
            threshold_ms: 1000,
            ..Default::default()
        };
        let rows = store
            .pattern_rows(PatternGrouping::PatternKey, &filters, 100)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].database, "billing");
    }

    #[test]
    fn test_dashboard_stats_counts() {
        let store = store_with_rows();
        let stats = store.dashboard_stats(None, None).unwrap();
        assert_eq!(stats.total_slow_queries, 4);
        assert_eq!(stats.unique_databases, 2);
        assert_eq!(stats.unique_namespaces, 3);
        assert_eq!(stats.collscan_count, 3);
        assert!(!stats.top_operations.is_empty());
    }

    #[test]
    fn test_date_range_spans_tables() {
        let store = store_with_rows();
        let (low, high) = store.date_range().unwrap().unwrap();
        assert!(low <= high);
        let expected_low = Utc.with_ymd_and_hms(2024, 1, 15, 14, 1, 0).unwrap().timestamp();
        assert_eq!(low, expected_low);
    }

    #[test]
    fn test_databases_sorted_without_system() {
        let store = store_with_rows();
        assert_eq!(store.databases().unwrap(), vec!["billing", "shop"]);
    }

    #[test]
    fn test_pagination_math() {
        let store = store_with_rows();
        let filters = QueryFilters {
            threshold_ms: 0,
            ..Default::default()
        };
        let page = store.slow_queries_page(&filters, 1, 2).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 4);
        assert_eq!(page.pages(), 2);
        assert!(page.has_next());
        assert!(!page.has_prev());
        // Slowest first.
        assert_eq!(page.items[0].duration_ms, 1200);

        let last = store.slow_queries_page(&filters, 2, 2).unwrap();
        assert_eq!(last.items.len(), 2);
        assert!(!last.has_next());
    }

    #[test]
    fn test_fts_search_before_index_is_empty() {
        let store = store_with_rows();
        let page = store.search_queries_fts("orders", 100, 1, 10).unwrap();
        assert_eq!(page.total, 0);
    }

    #[test]
    fn test_fts_search_finds_terms_after_build() {
        let mut store = LogStore::open_in_memory().unwrap();
        store.begin_bulk_load().unwrap();
        store
            .write_batch(vec![
                record("shop", "orders", 500, "COLLSCAN", "AAA", 1),
                record("shop", "users", 300, "IXSCAN", "BBB", 2),
            ])
            .unwrap();
        store.finish_bulk_load().unwrap();

        let page = store.search_queries_fts("orders", 100, 1, 10).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].collection, "orders");

        let none = store.search_queries_fts("nonexistent", 100, 1, 10).unwrap();
        assert_eq!(none.total, 0);
    }

    fn auth(conn_id: &str, user: Option<&str>, db: &str, minute: u32) -> LogRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 14, minute, 0).unwrap();
        LogRecord::Authentication(AuthenticationEvent {
            timestamp: ts,
            ts_epoch: ts.timestamp(),
            username: user.map(Into::into),
            database: db.into(),
            outcome: AuthOutcome::Success,
            connection_id: conn_id.into(),
            remote: "10.0.0.1".into(),
            mechanism: "SCRAM-SHA-256".into(),
        })
    }

    #[test]
    fn test_latest_auth_binding_wins_by_timestamp() {
        let mut store = LogStore::open_in_memory().unwrap();
        // Later timestamp written first; insertion order must not matter.
        store
            .write_batch(vec![
                auth("conn1", Some("late_user"), "billing", 9),
                auth("conn1", Some("early_user"), "shop", 1),
                auth("conn2", None, "reports", 3),
            ])
            .unwrap();

        let bindings = store.latest_auth_bindings().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].connection_id, "conn1");
        assert_eq!(bindings[0].username.as_deref(), Some("late_user"));
        assert_eq!(bindings[0].database, "billing");
        assert_eq!(bindings[1].connection_id, "conn2");
        assert_eq!(bindings[1].username, None);
    }

    #[test]
    fn test_resource_workload_ignores_base_generation() {
        let mut store = store_with_rows();
        let mut extended = record("shop", "orders", 700, "COLLSCAN", "EEE", 7);
        if let LogRecord::SlowQuery(q) = &mut extended {
            q.resource = ResourceMetrics {
                bytes_read: Some(8192),
                cpu_nanos: Some(2_000_000),
                ..Default::default()
            };
        }
        store.write_batch(vec![extended]).unwrap();

        let workload = store.resource_workload().unwrap();
        assert_eq!(workload.top_bytes_read.len(), 1);
        assert_eq!(workload.top_bytes_read[0].metric_total, 8192);
        assert_eq!(workload.totals.with_bytes_read, 1);
        assert_eq!(workload.totals.total_queries, 6);
        assert!(workload.top_bytes_written.is_empty());
    }
}
