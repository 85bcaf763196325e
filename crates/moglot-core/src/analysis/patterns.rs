//! Pattern aggregation: folds raw slow-query executions into per-shape
//! statistics with an optimization-potential score.
//!
//! Two producers feed the same [`QueryPattern`] shape. The SQL path
//! (`LogStore::pattern_rows`) aggregates in the database and is the one
//! used for large stores; the in-memory path here merges records
//! directly and additionally keeps a duration sample for a true median.
//! Merge operations are commutative (min, max, sum, timestamp
//! tie-break), so parallel chunk order never changes the outcome.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::SlowQueryRecord;
use crate::storage::{PatternGrouping, PatternRow};

use super::shape;

/// Upper bound on retained per-pattern duration samples. The mean is
/// exact regardless; only the median degrades to a sample median past
/// this point.
const DURATION_SAMPLE_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationPotential {
    Low,
    Medium,
    High,
}

impl OptimizationPotential {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Aggregated statistics for one group of executions.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPattern {
    pub query_hash: String,
    pub database: String,
    pub collection: String,
    pub namespace: String,
    pub plan_summary: String,
    /// Readable shape label, e.g. `find(status, user_id)`.
    pub query_pattern: String,
    pub operation_type: String,
    pub execution_count: u64,
    pub avg_duration: f64,
    pub min_duration: i64,
    pub max_duration: i64,
    pub median_duration: f64,
    pub total_duration: i64,
    pub total_docs_examined: i64,
    pub total_docs_returned: i64,
    pub total_keys_examined: i64,
    pub avg_docs_examined: f64,
    pub avg_docs_returned: f64,
    pub avg_keys_examined: f64,
    /// `returned / examined * 100`; `None` when nothing was examined.
    pub selectivity_pct: Option<f64>,
    /// `keysExamined / docsExamined * 100`; `None` when nothing was examined.
    pub index_efficiency_pct: Option<f64>,
    pub complexity_score: f64,
    pub optimization_potential: OptimizationPotential,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    /// Query text of the slowest execution in the group.
    pub sample_query: String,
}

impl QueryPattern {
    /// Impact used for final ordering: load, not raw latency or raw
    /// frequency alone.
    pub fn impact(&self) -> f64 {
        self.avg_duration * self.execution_count as f64
    }

    /// Derive the analysis metrics from a SQL aggregate row. The SQL
    /// path carries no duration sample, so the median falls back to
    /// the mean.
    pub fn from_row(row: PatternRow) -> Self {
        let selectivity = ratio_pct(row.sum_docs_returned, row.sum_docs_examined);
        let index_efficiency = ratio_pct(row.sum_keys_examined, row.sum_docs_examined);
        let count = row.execution_count.max(0) as u64;
        let complexity = complexity_score(row.avg_duration, selectivity, count);
        let potential = optimization_potential(
            &row.plan_summary,
            selectivity,
            row.avg_duration,
            row.min_duration,
            row.max_duration,
            count,
            complexity,
        );
        let sample = row.sample_query.unwrap_or_default();
        QueryPattern {
            query_hash: row.query_hash,
            database: row.database,
            collection: row.collection,
            namespace: row.namespace,
            plan_summary: row.plan_summary,
            query_pattern: shape::query_pattern_label(&sample),
            operation_type: shape::operation_type(&sample),
            execution_count: count,
            avg_duration: row.avg_duration,
            min_duration: row.min_duration,
            max_duration: row.max_duration,
            median_duration: row.avg_duration,
            total_duration: row.total_duration,
            total_docs_examined: row.sum_docs_examined,
            total_docs_returned: row.sum_docs_returned,
            total_keys_examined: row.sum_keys_examined,
            avg_docs_examined: row.avg_docs_examined,
            avg_docs_returned: row.avg_docs_returned,
            avg_keys_examined: row.avg_keys_examined,
            selectivity_pct: selectivity,
            index_efficiency_pct: index_efficiency,
            complexity_score: complexity,
            optimization_potential: potential,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            sample_query: sample,
        }
    }
}

/// Grouping identity of one record under the chosen strategy.
pub fn group_key(grouping: PatternGrouping, record: &SlowQueryRecord, hash: &str) -> String {
    match grouping {
        PatternGrouping::PatternKey => {
            format!("{}_{}_{}", record.namespace(), hash, record.plan_summary)
        }
        PatternGrouping::Namespace => record.namespace(),
        PatternGrouping::QueryHash => hash.to_string(),
    }
}

/// Running merge state for one pattern group.
#[derive(Debug, Clone)]
pub struct PatternAccumulator {
    query_hash: String,
    database: String,
    collection: String,
    plan_summary: String,
    count: u64,
    min_duration: i64,
    max_duration: i64,
    total_duration: i64,
    durations: Vec<i64>,
    sum_docs_examined: i64,
    sum_docs_returned: i64,
    sum_keys_examined: i64,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    slowest_duration: i64,
    slowest_timestamp: Option<DateTime<Utc>>,
    slowest_text: String,
}

impl PatternAccumulator {
    pub fn new() -> Self {
        PatternAccumulator {
            query_hash: String::new(),
            database: String::new(),
            collection: String::new(),
            plan_summary: String::new(),
            count: 0,
            min_duration: 0,
            max_duration: 0,
            total_duration: 0,
            durations: Vec::new(),
            sum_docs_examined: 0,
            sum_docs_returned: 0,
            sum_keys_examined: 0,
            first_seen: None,
            last_seen: None,
            slowest_duration: 0,
            slowest_timestamp: None,
            slowest_text: String::new(),
        }
    }

    /// Fold one execution in. Identity fields that disagree with what
    /// the group already holds collapse to "MIXED" instead of silently
    /// keeping the first value.
    pub fn observe(&mut self, record: &SlowQueryRecord, hash: &str) {
        if self.count == 0 {
            self.query_hash = hash.to_string();
            self.database = record.database.clone();
            self.collection = record.collection.clone();
            self.plan_summary = record.plan_summary.clone();
            self.min_duration = record.duration_ms;
            self.max_duration = record.duration_ms;
            self.slowest_duration = record.duration_ms;
            self.slowest_timestamp = Some(record.timestamp);
            self.slowest_text = record.query_text.clone();
        } else {
            coerce_mixed(&mut self.query_hash, hash);
            coerce_mixed(&mut self.database, &record.database);
            coerce_mixed(&mut self.collection, &record.collection);
            coerce_mixed(&mut self.plan_summary, &record.plan_summary);
            self.min_duration = self.min_duration.min(record.duration_ms);
            self.max_duration = self.max_duration.max(record.duration_ms);
            // Strictly slower wins; an equal duration wins only when
            // more recent. This keeps the chosen sample stable across
            // merge order.
            let newer = self
                .slowest_timestamp
                .is_none_or(|prev| record.timestamp > prev);
            if record.duration_ms > self.slowest_duration
                || (record.duration_ms == self.slowest_duration && newer)
            {
                self.slowest_duration = record.duration_ms;
                self.slowest_timestamp = Some(record.timestamp);
                self.slowest_text = record.query_text.clone();
            }
        }
        self.count += 1;
        self.total_duration += record.duration_ms;
        if self.durations.len() < DURATION_SAMPLE_CAP {
            self.durations.push(record.duration_ms);
        }
        self.sum_docs_examined += record.docs_examined;
        self.sum_docs_returned += record.docs_returned;
        self.sum_keys_examined += record.keys_examined;
        self.first_seen = Some(match self.first_seen {
            Some(seen) => seen.min(record.timestamp),
            None => record.timestamp,
        });
        self.last_seen = Some(match self.last_seen {
            Some(seen) => seen.max(record.timestamp),
            None => record.timestamp,
        });
    }

    pub fn finish(mut self) -> QueryPattern {
        let avg = if self.count > 0 {
            self.total_duration as f64 / self.count as f64
        } else {
            0.0
        };
        let median = median(&mut self.durations).unwrap_or(avg);
        let selectivity = ratio_pct(self.sum_docs_returned, self.sum_docs_examined);
        let index_efficiency = ratio_pct(self.sum_keys_examined, self.sum_docs_examined);
        let complexity = complexity_score(avg, selectivity, self.count);
        let potential = optimization_potential(
            &self.plan_summary,
            selectivity,
            avg,
            self.min_duration,
            self.max_duration,
            self.count,
            complexity,
        );
        let namespace = if self.database == "MIXED" || self.collection == "MIXED" {
            "MIXED".to_string()
        } else {
            format!("{}.{}", self.database, self.collection)
        };
        QueryPattern {
            query_hash: self.query_hash,
            database: self.database,
            collection: self.collection,
            namespace,
            plan_summary: self.plan_summary,
            query_pattern: shape::query_pattern_label(&self.slowest_text),
            operation_type: shape::operation_type(&self.slowest_text),
            execution_count: self.count,
            avg_duration: avg,
            min_duration: self.min_duration,
            max_duration: self.max_duration,
            median_duration: median,
            total_duration: self.total_duration,
            total_docs_examined: self.sum_docs_examined,
            total_docs_returned: self.sum_docs_returned,
            total_keys_examined: self.sum_keys_examined,
            avg_docs_examined: self.sum_docs_examined as f64 / self.count.max(1) as f64,
            avg_docs_returned: self.sum_docs_returned as f64 / self.count.max(1) as f64,
            avg_keys_examined: self.sum_keys_examined as f64 / self.count.max(1) as f64,
            selectivity_pct: selectivity,
            index_efficiency_pct: index_efficiency,
            complexity_score: complexity,
            optimization_potential: potential,
            first_seen: self.first_seen.map(|t| t.to_rfc3339()),
            last_seen: self.last_seen.map(|t| t.to_rfc3339()),
            sample_query: self.slowest_text,
        }
    }
}

impl Default for PatternAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Group records in memory and return patterns in impact order. Records
/// without a source hash get a synthetic one from their query shape.
pub fn aggregate_records(
    grouping: PatternGrouping,
    records: &[SlowQueryRecord],
) -> Vec<QueryPattern> {
    let mut groups: HashMap<String, PatternAccumulator> = HashMap::new();
    for record in records {
        let hash = record.query_hash.clone().unwrap_or_else(|| {
            shape::synthetic_query_hash(&record.database, &record.collection, &record.query_text)
        });
        let key = group_key(grouping, record, &hash);
        groups.entry(key).or_default().observe(record, &hash);
    }
    let mut patterns: Vec<QueryPattern> = groups.into_values().map(|acc| acc.finish()).collect();
    sort_by_impact(&mut patterns);
    patterns
}

/// Impact ordering: `avgDuration x executionCount` descending.
pub fn sort_by_impact(patterns: &mut [QueryPattern]) {
    patterns.sort_by(|a, b| b.impact().total_cmp(&a.impact()));
}

fn coerce_mixed(slot: &mut String, value: &str) {
    if slot != value {
        *slot = "MIXED".to_string();
    }
}

fn ratio_pct(numerator: i64, denominator: i64) -> Option<f64> {
    if denominator > 0 {
        Some(numerator as f64 / denominator as f64 * 100.0)
    } else {
        None
    }
}

/// Rough effort score, capped at 100. An undefined selectivity counts
/// as fully unselective here so zero-examined patterns do not look
/// artificially cheap.
fn complexity_score(avg_duration: f64, selectivity: Option<f64>, count: u64) -> f64 {
    let score = avg_duration / 10.0 + (100.0 - selectivity.unwrap_or(0.0)) + count as f64 / 10.0;
    score.min(100.0)
}

/// Weighted optimization-potential rubric. Full scans, poor selectivity,
/// high latency, unstable latency, hot patterns and complex shapes each
/// add points; 6 points is high, 3 is medium.
fn optimization_potential(
    plan_summary: &str,
    selectivity: Option<f64>,
    avg_duration: f64,
    min_duration: i64,
    max_duration: i64,
    count: u64,
    complexity: f64,
) -> OptimizationPotential {
    let mut score = 0u32;
    if plan_summary == "COLLSCAN" {
        score += 3;
    }
    if selectivity.is_some_and(|s| s < 10.0) {
        score += 2;
    }
    if avg_duration > 1000.0 {
        score += 2;
    }
    let range = (max_duration - min_duration) as f64;
    if avg_duration > 0.0 && range > avg_duration * 0.5 {
        score += 2;
    }
    if count >= 10 {
        score += 1;
    }
    if complexity >= 7.0 {
        score += 1;
    }
    match score {
        s if s >= 6 => OptimizationPotential::High,
        s if s >= 3 => OptimizationPotential::Medium,
        _ => OptimizationPotential::Low,
    }
}

fn median(durations: &mut [i64]) -> Option<f64> {
    if durations.is_empty() {
        return None;
    }
    durations.sort_unstable();
    let mid = durations.len() / 2;
    Some(if durations.len() % 2 == 1 {
        durations[mid] as f64
    } else {
        (durations[mid - 1] + durations[mid]) as f64 / 2.0
    })
}
