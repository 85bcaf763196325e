//! Analyzer facade: one handle per dataset.
//!
//! Owns the SQLite store, the raw-line buffers, the session access
//! samples and the parsing summary, plus a TTL cache in front of the
//! expensive aggregates. Ingestion runs as an explicit session:
//! [`Analyzer::begin_bulk_session`], any number of
//! [`Analyzer::ingest_file`] calls, then
//! [`Analyzer::finish_bulk_session`], which applies authentication
//! correlation and hands heavy index builds to the shared
//! [`IndexBuildService`]. The single-file [`Analyzer::ingest`] wraps
//! that sequence and closes the session even when the file fails.
//!
//! Raw-line search picks its mode per call: in-memory buffers when the
//! whole session is buffered, otherwise whole-file reads up to the
//! configured size ceiling, otherwise line streaming.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::Result;
use crate::analysis::{self, CollectionIndexReport, QueryPattern};
use crate::cache::{CacheKey, ResultCache};
use crate::config::AnalyzerConfig;
use crate::ingest::FileIngest;
use crate::models::{AccessSample, FileSummary, ParsingSummary};
use crate::search::{self, SearchOutcome, SearchRequest};
use crate::storage::{
    DashboardStats, IndexBuildService, LogStore, Page, PatternGrouping, PlanFilter, QueryFilters,
    ResourceWorkload, SlowQueryRow, TopSource, schema,
};

/// Slowest-first row cap fed to index suggestion analysis.
const SUGGESTION_ROW_CAP: usize = 10_000;

pub struct Analyzer {
    config: AnalyzerConfig,
    store: LogStore,
    index_service: Arc<IndexBuildService>,
    /// Raw lines per source file, present only for files small enough
    /// to take the direct ingest path while retention is enabled.
    raw_lines: HashMap<String, Vec<String>>,
    source_files: Vec<PathBuf>,
    access: Vec<AccessSample>,
    summary: ParsingSummary,
    session_seq: u64,
    patterns_cache: ResultCache<Vec<QueryPattern>>,
    stats_cache: ResultCache<DashboardStats>,
    cache_hits: u64,
    cache_misses: u64,
}

impl Analyzer {
    /// Open a disk-backed analyzer. Heavy index builds after each bulk
    /// session go through `index_service`, so several analyzers can
    /// share one build worker.
    pub fn open(
        config: AnalyzerConfig,
        db_path: impl AsRef<Path>,
        index_service: Arc<IndexBuildService>,
    ) -> Result<Self> {
        let store = LogStore::open(db_path)?;
        Ok(Self::with_store(config, store, index_service))
    }

    /// Open an analyzer over an in-memory database. Heavy indexes are
    /// built inline at session end; the build service is not used.
    pub fn in_memory(config: AnalyzerConfig) -> Result<Self> {
        let store = LogStore::open_in_memory()?;
        let index_service = Arc::new(IndexBuildService::new());
        Ok(Self::with_store(config, store, index_service))
    }

    fn with_store(
        config: AnalyzerConfig,
        store: LogStore,
        index_service: Arc<IndexBuildService>,
    ) -> Self {
        let patterns_cache = ResultCache::new(config.cache_ttl, config.cache_capacity);
        let stats_cache = ResultCache::new(config.cache_ttl, config.cache_capacity);
        Analyzer {
            config,
            store,
            index_service,
            raw_lines: HashMap::new(),
            source_files: Vec::new(),
            access: Vec::new(),
            summary: ParsingSummary::default(),
            session_seq: 0,
            patterns_cache,
            stats_cache,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Parsing summary of the current session.
    pub fn summary(&self) -> &ParsingSummary {
        &self.summary
    }

    pub fn source_files(&self) -> &[PathBuf] {
        &self.source_files
    }

    /// Start a new bulk session. The previous dataset, buffers and
    /// cached aggregates are dropped; the store switches to bulk-load
    /// mode until [`Analyzer::finish_bulk_session`].
    pub fn begin_bulk_session(&mut self) -> Result<()> {
        self.store.clear()?;
        self.store.begin_bulk_load()?;
        self.raw_lines.clear();
        self.source_files.clear();
        self.access.clear();
        self.summary = ParsingSummary::default();
        self.invalidate_caches();
        self.session_seq += 1;
        info!(session = self.session_seq, "bulk session started");
        Ok(())
    }

    /// Ingest one file into the open session.
    pub fn ingest_file(&mut self, path: impl AsRef<Path>) -> Result<FileSummary> {
        let path = path.as_ref();
        let report = FileIngest::new(&self.config).ingest(path, &mut self.store)?;
        let label = path.display().to_string();
        if let Some(lines) = report.lines {
            self.raw_lines.insert(label.clone(), lines);
        }
        self.access.extend(report.access);
        if !self.source_files.iter().any(|p| p.as_path() == path) {
            self.source_files.push(path.to_path_buf());
        }
        self.summary.add_file(&label, report.summary.clone());
        Ok(report.summary)
    }

    /// Close the session: restore normal store mode, apply
    /// authentication correlation, and kick off heavy index builds
    /// (queued for a disk store, inline for an in-memory one).
    pub fn finish_bulk_session(&mut self) -> Result<ParsingSummary> {
        let heavy = self.store.finish_bulk_load()?;
        let bindings = self.store.latest_auth_bindings()?;
        if !bindings.is_empty() {
            let updated = self.store.apply_auth_bindings(&bindings)?;
            debug!(
                bindings = bindings.len(),
                rows = updated,
                "authentication correlation applied"
            );
        }
        match self.store.path().map(Path::to_path_buf) {
            Some(db_path) => {
                let statements: Vec<String> = heavy.iter().map(|s| s.to_string()).collect();
                let session = format!("session-{}", self.session_seq);
                self.index_service
                    .queue_build(db_path, statements, &session)?;
            }
            None => self.store.build_heavy_indexes_inline()?,
        }
        self.invalidate_caches();
        info!(
            session = self.session_seq,
            files = self.summary.files.len(),
            lines = self.summary.totals.total_lines,
            slow_queries = self.summary.totals.slow_query_events,
            connections = self.summary.totals.connection_events,
            authentications = self.summary.totals.auth_events,
            "bulk session finished"
        );
        Ok(self.summary.clone())
    }

    /// Ingest a single file as one whole session. An unreadable file
    /// only shows up as `io_errors` in the summary; the session is
    /// closed even when storage fails mid-file, so the store never
    /// stays in bulk-load mode.
    pub fn ingest(&mut self, path: impl AsRef<Path>) -> Result<ParsingSummary> {
        self.begin_bulk_session()?;
        let outcome = self.ingest_file(path.as_ref());
        let summary = self.finish_bulk_session()?;
        outcome?;
        Ok(summary)
    }

    /// Aggregated query patterns, slowest load first. Results are
    /// cached per argument set until the TTL or the next session.
    pub fn patterns(
        &mut self,
        grouping: PatternGrouping,
        filters: &QueryFilters,
        limit: usize,
    ) -> Result<Vec<QueryPattern>> {
        let key = Self::patterns_key(grouping, filters, limit);
        if let Some(hit) = self.patterns_cache.get(&key) {
            self.cache_hits += 1;
            return Ok(hit);
        }
        self.cache_misses += 1;
        let rows = self.store.pattern_rows(grouping, filters, limit)?;
        let mut patterns: Vec<QueryPattern> = rows.into_iter().map(QueryPattern::from_row).collect();
        analysis::sort_by_impact(&mut patterns);
        debug!(
            grouping = grouping.as_str(),
            patterns = patterns.len(),
            "patterns aggregated"
        );
        self.patterns_cache.put(&key, patterns.clone());
        Ok(patterns)
    }

    fn patterns_key(grouping: PatternGrouping, filters: &QueryFilters, limit: usize) -> CacheKey {
        let mut key = CacheKey::new("patterns")
            .param("group", grouping.as_str())
            .param("threshold", filters.threshold_ms)
            .param("limit", limit);
        if let Some(db) = &filters.database {
            key = key.param("database", db);
        }
        match &filters.plan_summary {
            Some(PlanFilter::Exact(plan)) => key = key.param("plan", plan),
            Some(PlanFilter::Other) => key = key.param("plan", "other"),
            None => {}
        }
        if let Some(ns) = &filters.namespace {
            key = key.param("namespace", ns);
        }
        if let Some(start) = filters.start_epoch {
            key = key.param("start", start);
        }
        if let Some(end) = filters.end_epoch {
            key = key.param("end", end);
        }
        key
    }

    /// Headline dashboard numbers, cached like [`Analyzer::patterns`].
    pub fn dashboard_stats(
        &mut self,
        start_epoch: Option<i64>,
        end_epoch: Option<i64>,
    ) -> Result<DashboardStats> {
        let key = CacheKey::new("dashboard")
            .param("start", start_epoch.map_or(String::new(), |e| e.to_string()))
            .param("end", end_epoch.map_or(String::new(), |e| e.to_string()));
        if let Some(hit) = self.stats_cache.get(&key) {
            self.cache_hits += 1;
            return Ok(hit);
        }
        self.cache_misses += 1;
        let stats = self.store.dashboard_stats(start_epoch, end_epoch)?;
        self.stats_cache.put(&key, stats.clone());
        Ok(stats)
    }

    /// Per-collection compound-index suggestions over the stored slow
    /// queries, slowest rows first.
    pub fn index_suggestions(&self) -> Result<BTreeMap<String, CollectionIndexReport>> {
        let filters = QueryFilters {
            threshold_ms: self.config.slow_query_threshold_ms,
            ..QueryFilters::default()
        };
        let rows = self.store.slow_query_rows(&filters, SUGGESTION_ROW_CAP)?;
        Ok(analysis::suggest_indexes(&rows))
    }

    /// Search raw log lines. Buffers serve the query when every session
    /// file was retained in memory; otherwise the aggregate source size
    /// decides between whole-file reads and line streaming.
    pub fn search(&self, request: &SearchRequest) -> SearchOutcome {
        if !self.source_files.is_empty() && self.raw_lines.len() == self.source_files.len() {
            debug!("searching in-memory buffers");
            return search::search_in_memory(&self.raw_lines, request);
        }
        let total_size: u64 = self
            .source_files
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        if total_size <= self.config.ephemeral_search_limit {
            debug!(total_size, "searching with whole-file reads");
            search::search_ephemeral(&self.source_files, request)
        } else {
            debug!(total_size, "searching with line streaming");
            search::search_streaming(&self.source_files, request)
        }
    }

    /// Raw text of one source line, 1-based. Served from the in-memory
    /// buffer when present, else re-read from disk. Unknown files,
    /// out-of-range numbers and read failures all come back as `None`.
    pub fn original_line(&self, file_path: &str, line_number: u64) -> Option<String> {
        if line_number == 0 {
            return None;
        }
        if let Some(lines) = self.raw_lines.get(file_path)
            && let Some(line) = lines.get(line_number as usize - 1)
        {
            return Some(line.clone());
        }
        let file = File::open(file_path).ok()?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.ok()?;
            if idx as u64 + 1 == line_number {
                return Some(line.trim().to_string());
            }
        }
        None
    }

    /// Databases touched by commands this session, system databases
    /// excluded, busiest first. Counts include commands below the
    /// slow-query threshold.
    pub fn accessed_databases(&self) -> Vec<(String, u64)> {
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for sample in &self.access {
            if schema::SYSTEM_DATABASES.contains(&sample.database.as_str()) {
                continue;
            }
            *counts.entry(sample.database.as_str()).or_insert(0) += 1;
        }
        let mut out: Vec<(String, u64)> = counts
            .into_iter()
            .map(|(db, n)| (db.to_string(), n))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub fn date_range(&self) -> Result<Option<(i64, i64)>> {
        self.store.date_range()
    }

    pub fn databases(&self) -> Result<Vec<String>> {
        self.store.databases()
    }

    /// One page of stored slow queries, slowest first.
    pub fn slow_queries(
        &self,
        filters: &QueryFilters,
        page: usize,
        per_page: usize,
    ) -> Result<Page<SlowQueryRow>> {
        self.store.slow_queries_page(filters, page, per_page)
    }

    /// Full-text search over stored query text and namespaces.
    pub fn search_queries(
        &self,
        term: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Page<SlowQueryRow>> {
        self.store
            .search_queries_fts(term, self.config.slow_query_threshold_ms, page, per_page)
    }

    pub fn resource_workload(&self) -> Result<ResourceWorkload> {
        self.store.resource_workload()
    }

    pub fn top_auth_sources(
        &self,
        start_epoch: Option<i64>,
        end_epoch: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TopSource>> {
        self.store.top_auth_sources(start_epoch, end_epoch, limit)
    }

    /// Drop the stored dataset, the session state and the caches.
    pub fn clear(&mut self) -> Result<()> {
        self.store.clear()?;
        self.raw_lines.clear();
        self.source_files.clear();
        self.access.clear();
        self.summary = ParsingSummary::default();
        self.invalidate_caches();
        Ok(())
    }

    /// Lifetime count of aggregate calls served from cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Lifetime count of aggregate calls that had to compute.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses
    }

    fn invalidate_caches(&mut self) {
        self.patterns_cache.clear();
        self.stats_cache.clear();
    }
}
