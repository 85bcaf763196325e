//! Compound-index suggestions for full-scan and inefficient index-scan
//! queries.
//!
//! Field order inside a suggested key follows the usability rule for
//! compound indexes: equality predicates first, then range predicates,
//! then sort keys with their declared direction. Rows carrying neither
//! an equality nor a range predicate produce no suggestion; they still
//! count toward collection statistics.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::storage::SlowQueryRow;

use super::shape;

/// Operators that disqualify a top-level filter key from direct index
/// coverage.
const SKIPPED_ROOTS: &[&str] = &["$and", "$or", "$nor", "$expr"];

const MAX_SUGGESTIONS_PER_COLLECTION: usize = 10;
const MAX_SAMPLE_QUERIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IndexField {
    pub field: String,
    pub direction: i64,
}

/// One ranked suggestion with a ready-to-run shell command.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSuggestion {
    pub fields: Vec<IndexField>,
    /// Key document rendered for display, e.g. `{status: 1, createdAt: -1}`.
    pub index: String,
    pub reason: String,
    pub confidence: &'static str,
    pub impact_score: i64,
    pub occurrences: u64,
    pub avg_duration_ms: i64,
    /// `docsExamined / docsReturned` over all occurrences.
    pub inefficiency_ratio: f64,
    pub command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleQuery {
    pub query_text: String,
    pub duration_ms: i64,
    pub timestamp: Option<String>,
}

/// Per-collection roll-up: scan counts, volume totals, a few sample
/// query texts, and the surviving ranked suggestions.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CollectionIndexReport {
    pub namespace: String,
    pub collscan_queries: u64,
    pub ixscan_inefficient_queries: u64,
    pub total_docs_examined: i64,
    pub total_docs_returned: i64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: f64,
    pub avg_docs_per_query: f64,
    pub sample_queries: Vec<SampleQuery>,
    pub suggestions: Vec<IndexSuggestion>,
}

#[derive(Debug, Default)]
struct SpecStats {
    occurrences: u64,
    total_duration: i64,
    docs_examined: i64,
    docs_returned: i64,
    reason: String,
    /// Duration load weighted by pattern execution counts; falls back
    /// to `total_duration` when zero.
    patterned_duration: f64,
}

/// Analyze stored rows and emit per-collection suggestion reports,
/// keyed by namespace.
pub fn suggest_indexes(rows: &[SlowQueryRow]) -> BTreeMap<String, CollectionIndexReport> {
    // Pattern totals let one sampled row stand in for every execution
    // of its shape when estimating impact.
    let weights = pattern_weights(rows);

    let mut reports: BTreeMap<String, CollectionIndexReport> = BTreeMap::new();
    let mut per_spec: HashMap<(String, Vec<IndexField>), SpecStats> = HashMap::new();

    for row in rows {
        let plan = row.plan_summary.as_deref().unwrap_or("").to_uppercase();
        let is_collscan = plan == "COLLSCAN";
        let is_ixscan = plan.contains("IXSCAN");
        if !is_collscan && !is_ixscan {
            continue;
        }

        let namespace = format!("{}.{}", row.database, row.collection);
        let report = reports.entry(namespace.clone()).or_insert_with(|| {
            CollectionIndexReport {
                namespace: namespace.clone(),
                ..Default::default()
            }
        });
        if is_collscan {
            report.collscan_queries += 1;
        }
        if is_ixscan {
            report.ixscan_inefficient_queries += 1;
        }
        report.total_docs_examined += row.docs_examined;
        report.total_docs_returned += row.docs_returned;
        report.total_duration_ms += row.duration_ms;
        if report.sample_queries.len() < MAX_SAMPLE_QUERIES {
            report.sample_queries.push(SampleQuery {
                query_text: row.query_text.clone(),
                duration_ms: row.duration_ms,
                timestamp: row.timestamp.clone(),
            });
        }

        let Some(query) = parse_query(&row.query_text) else {
            continue;
        };
        let (eq_fields, range_fields, sort_items) = collect_filters_and_sort(&query);
        if eq_fields.is_empty() && range_fields.is_empty() {
            continue;
        }
        let spec = build_spec(eq_fields, range_fields, sort_items);

        let stats = per_spec.entry((namespace, spec)).or_default();
        stats.occurrences += 1;
        stats.total_duration += row.duration_ms;
        stats.docs_examined += row.docs_examined;
        stats.docs_returned += row.docs_returned;
        stats.reason = if is_collscan {
            "COLLSCAN filter/sort coverage".to_string()
        } else {
            "IXSCAN inefficiency improvement".to_string()
        };
        if let Some(duration) = weights.get(&weight_key(row)) {
            stats.patterned_duration += *duration as f64;
        }
    }

    let mut per_collection: BTreeMap<String, Vec<(Vec<IndexField>, SpecStats, i64)>> =
        BTreeMap::new();
    for ((namespace, spec), stats) in per_spec {
        let inefficiency = stats.docs_examined as f64 / stats.docs_returned.max(1) as f64;
        let base_load = if stats.patterned_duration > 0.0 {
            stats.patterned_duration
        } else {
            stats.total_duration as f64
        };
        let impact = (base_load * inefficiency.max(1.0)) as i64;
        per_collection
            .entry(namespace)
            .or_default()
            .push((spec, stats, impact));
    }

    for (namespace, mut specs) in per_collection {
        specs.sort_by(|a, b| b.2.cmp(&a.2).then(b.0.len().cmp(&a.0.len())));
        let mut kept: Vec<(Vec<IndexField>, SpecStats, i64)> = Vec::new();
        for candidate in specs {
            // At most one spec per prefix chain survives, and ranking
            // decides which: a candidate covered by a kept spec adds
            // nothing, and a candidate extending a kept spec would
            // reintroduce the prefix it was ranked below.
            if kept.iter().any(|(spec, _, _)| {
                spec.starts_with(&candidate.0) || candidate.0.starts_with(spec)
            }) {
                continue;
            }
            kept.push(candidate);
        }

        let suggestions = kept
            .into_iter()
            .take(MAX_SUGGESTIONS_PER_COLLECTION)
            .map(|(spec, stats, impact)| {
                let rendered = render_key(&spec);
                let collection = namespace
                    .split_once('.')
                    .map_or(namespace.as_str(), |(_, coll)| coll);
                let inefficiency =
                    stats.docs_examined as f64 / stats.docs_returned.max(1) as f64;
                IndexSuggestion {
                    command: format!("db.{collection}.createIndex({{{rendered}}})"),
                    index: format!("{{{rendered}}}"),
                    fields: spec,
                    reason: stats.reason,
                    confidence: "high",
                    impact_score: impact,
                    occurrences: stats.occurrences,
                    avg_duration_ms: stats.total_duration / stats.occurrences.max(1) as i64,
                    inefficiency_ratio: (inefficiency * 100.0).round() / 100.0,
                }
            })
            .collect();

        if let Some(report) = reports.get_mut(&namespace) {
            report.suggestions = suggestions;
        }
    }

    for report in reports.values_mut() {
        let contributing = report.collscan_queries + report.ixscan_inefficient_queries;
        if contributing > 0 {
            report.avg_duration_ms = report.total_duration_ms as f64 / contributing as f64;
            report.avg_docs_per_query = report.total_docs_examined as f64 / contributing as f64;
        }
    }

    reports
}

fn pattern_weights(rows: &[SlowQueryRow]) -> HashMap<String, i64> {
    let mut weights: HashMap<String, i64> = HashMap::new();
    for row in rows {
        *weights.entry(weight_key(row)).or_default() += row.duration_ms;
    }
    weights
}

fn weight_key(row: &SlowQueryRow) -> String {
    let hash = match &row.query_hash {
        Some(hash) if !hash.is_empty() => hash.clone(),
        _ => shape::synthetic_query_hash(&row.database, &row.collection, &row.query_text),
    };
    format!(
        "{}.{}_{}_{}",
        row.database,
        row.collection,
        hash,
        row.plan_summary.as_deref().unwrap_or("None")
    )
}

fn parse_query(query_text: &str) -> Option<Value> {
    let trimmed = query_text.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn is_anchored_regex(value: &Value) -> bool {
    value
        .get("$regex")
        .and_then(Value::as_str)
        .is_some_and(|pattern| pattern.starts_with('^'))
}

/// Equality fields, range fields, and sort pairs from a find command or
/// an aggregation's merged `$match`/`$sort` stages.
fn collect_filters_and_sort(query: &Value) -> (Vec<String>, Vec<String>, Vec<(String, i64)>) {
    let mut filter: Map<String, Value> = Map::new();
    let mut sort: Map<String, Value> = Map::new();

    if query.get("find").is_some() {
        if let Some(f) = query.get("filter").and_then(Value::as_object) {
            filter = f.clone();
        }
        if let Some(s) = query.get("sort").and_then(Value::as_object) {
            sort = s.clone();
        }
    } else if query.get("aggregate").is_some() {
        for stage in query
            .get("pipeline")
            .and_then(Value::as_array)
            .map(|p| p.as_slice())
            .unwrap_or_default()
        {
            if let Some(m) = stage.get("$match").and_then(Value::as_object) {
                for (k, v) in m {
                    filter.insert(k.clone(), v.clone());
                }
            }
            if let Some(s) = stage.get("$sort").and_then(Value::as_object) {
                for (k, v) in s {
                    sort.insert(k.clone(), v.clone());
                }
            }
        }
    }

    let mut eq_fields = Vec::new();
    let mut range_fields = Vec::new();
    for (key, value) in &filter {
        if SKIPPED_ROOTS.contains(&key.as_str()) {
            continue;
        }
        match value.as_object() {
            None => eq_fields.push(key.clone()),
            Some(ops) => {
                if ops.keys().all(|op| op == "$eq") {
                    eq_fields.push(key.clone());
                } else if ops.get("$in").is_some_and(Value::is_array) {
                    eq_fields.push(key.clone());
                } else if ["$gt", "$gte", "$lt", "$lte"]
                    .iter()
                    .any(|op| ops.contains_key(*op))
                {
                    range_fields.push(key.clone());
                } else if is_anchored_regex(value) {
                    eq_fields.push(key.clone());
                }
            }
        }
    }

    let sort_items = sort
        .iter()
        .map(|(field, dir)| {
            let direction = dir
                .as_i64()
                .or_else(|| dir.as_f64().map(|f| f as i64))
                .or_else(|| dir.as_str().and_then(|s| s.trim().parse().ok()))
                .unwrap_or(1);
            (field.clone(), if direction >= 0 { 1 } else { -1 })
        })
        .collect();

    (eq_fields, range_fields, sort_items)
}

fn build_spec(
    eq_fields: Vec<String>,
    range_fields: Vec<String>,
    sort_items: Vec<(String, i64)>,
) -> Vec<IndexField> {
    let mut spec: Vec<IndexField> = Vec::new();
    for field in eq_fields {
        spec.push(IndexField { field, direction: 1 });
    }
    for field in range_fields {
        spec.push(IndexField { field, direction: 1 });
    }
    for (field, direction) in sort_items {
        spec.push(IndexField { field, direction });
    }
    spec
}

fn render_key(spec: &[IndexField]) -> String {
    spec.iter()
        .map(|f| format!("{}: {}", f.field, f.direction))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(plan: &str, duration: i64, docs: i64, returned: i64, query: &str) -> SlowQueryRow {
        SlowQueryRow {
            id: 0,
            timestamp: Some("2024-01-15T14:00:00+00:00".into()),
            ts_epoch: Some(1_705_327_200),
            database: "shop".into(),
            collection: "orders".into(),
            duration_ms: duration,
            docs_examined: docs,
            docs_returned: returned,
            keys_examined: 0,
            query_hash: Some("H1".into()),
            plan_summary: Some(plan.into()),
            file_path: "t.log".into(),
            line_number: 1,
            namespace: "shop.orders".into(),
            query_text: query.into(),
            connection_id: "conn1".into(),
            username: None,
            cpu_nanos: None,
            bytes_read: None,
            bytes_written: None,
            time_reading_micros: None,
            time_writing_micros: None,
        }
    }

    #[test]
    fn test_collscan_with_filter_and_sort_yields_one_suggestion() {
        let rows = vec![row(
            "COLLSCAN",
            500,
            10_000,
            5,
            r#"{"find": "orders", "filter": {"status": "pending"}, "sort": {"createdAt": -1}}"#,
        )];
        let reports = suggest_indexes(&rows);
        let report = &reports["shop.orders"];
        assert_eq!(report.collscan_queries, 1);
        assert_eq!(report.suggestions.len(), 1);
        let s = &report.suggestions[0];
        assert_eq!(
            s.fields,
            vec![
                IndexField { field: "status".into(), direction: 1 },
                IndexField { field: "createdAt".into(), direction: -1 },
            ]
        );
        assert_eq!(s.command, "db.orders.createIndex({status: 1, createdAt: -1})");
    }

    #[test]
    fn test_rows_without_predicates_counted_but_not_suggested() {
        let rows = vec![row(
            "COLLSCAN",
            300,
            1000,
            1000,
            r#"{"find": "orders", "sort": {"createdAt": -1}}"#,
        )];
        let reports = suggest_indexes(&rows);
        let report = &reports["shop.orders"];
        assert_eq!(report.collscan_queries, 1);
        assert!(report.suggestions.is_empty());
        assert!((report.avg_duration_ms - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_scan_plans_ignored() {
        let rows = vec![row(
            "EXPRESS_IXSCAN",
            900,
            5,
            5,
            r#"{"find": "orders", "filter": {"_id": 1}}"#,
        )];
        // EXPRESS_IXSCAN contains IXSCAN, so it does participate.
        assert!(!suggest_indexes(&rows).is_empty());

        let rows = vec![row("COUNT_SCAN", 900, 5, 5, r#"{"find": "o", "filter": {"a": 1}}"#)];
        assert!(suggest_indexes(&rows).is_empty());
    }

    #[test]
    fn test_equality_before_range_before_sort() {
        let rows = vec![row(
            "COLLSCAN",
            400,
            1000,
            10,
            r#"{"find": "orders", "filter": {"ts": {"$gte": 1}, "status": {"$in": ["a", "b"]}}, "sort": {"createdAt": -1}}"#,
        )];
        let reports = suggest_indexes(&rows);
        let fields: Vec<&str> = reports["shop.orders"].suggestions[0]
            .fields
            .iter()
            .map(|f| f.field.as_str())
            .collect();
        assert_eq!(fields, vec!["status", "ts", "createdAt"]);
    }

    #[test]
    fn test_operator_classification() {
        let rows = vec![row(
            "COLLSCAN",
            400,
            100,
            10,
            r#"{"find": "c", "filter": {
                "eq": {"$eq": 5},
                "anchored": {"$regex": "^abc"},
                "floating": {"$regex": "abc"},
                "range": {"$lt": 9},
                "$or": [{"x": 1}]
            }}"#,
        )];
        let reports = suggest_indexes(&rows);
        let fields: Vec<&str> = reports["shop.orders"].suggestions[0]
            .fields
            .iter()
            .map(|f| f.field.as_str())
            .collect();
        // eq fields (anchored regex counts), then the range field;
        // floating regex and $or are dropped.
        assert_eq!(fields, vec!["anchored", "eq", "range"]);
    }

    #[test]
    fn test_aggregate_pipeline_stages() {
        let rows = vec![row(
            "COLLSCAN",
            600,
            5000,
            2,
            r#"{"aggregate": "orders", "pipeline": [
                {"$match": {"region": "eu"}},
                {"$sort": {"total": -1}},
                {"$limit": 10}
            ]}"#,
        )];
        let reports = suggest_indexes(&rows);
        let s = &reports["shop.orders"].suggestions[0];
        assert_eq!(s.fields[0].field, "region");
        assert_eq!(s.fields[1], IndexField { field: "total".into(), direction: -1 });
    }

    #[test]
    fn test_prefix_covered_spec_pruned() {
        let short = row(
            "COLLSCAN",
            100,
            10,
            1,
            r#"{"find": "orders", "filter": {"status": "a"}}"#,
        );
        let long = row(
            "COLLSCAN",
            5000,
            100_000,
            1,
            r#"{"find": "orders", "filter": {"status": "a"}, "sort": {"createdAt": -1}}"#,
        );
        let reports = suggest_indexes(&vec![short, long]);
        let suggestions = &reports["shop.orders"].suggestions;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].fields.len(), 2);
    }

    #[test]
    fn test_dominant_short_spec_prunes_its_extensions() {
        // The bare {status} shape carries nearly all the load; the
        // {status, createdAt} extension ranks below it and must not
        // survive alongside its own prefix.
        let mut rows: Vec<SlowQueryRow> = (0..20)
            .map(|_| {
                row(
                    "COLLSCAN",
                    900,
                    50_000,
                    1,
                    r#"{"find": "orders", "filter": {"status": "pending"}}"#,
                )
            })
            .collect();
        rows.push(row(
            "COLLSCAN",
            50,
            10,
            1,
            r#"{"find": "orders", "filter": {"status": "pending"}, "sort": {"createdAt": -1}}"#,
        ));

        let reports = suggest_indexes(&rows);
        let suggestions = &reports["shop.orders"].suggestions;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(
            suggestions[0].fields,
            vec![IndexField { field: "status".into(), direction: 1 }]
        );
    }

    #[test]
    fn test_surviving_specs_are_never_prefixes_of_each_other() {
        let rows = vec![
            row("COLLSCAN", 5000, 100_000, 1, r#"{"find": "orders", "filter": {"status": "a"}}"#),
            row(
                "COLLSCAN",
                100,
                500,
                1,
                r#"{"find": "orders", "filter": {"status": "a"}, "sort": {"createdAt": -1}}"#,
            ),
            row(
                "COLLSCAN",
                3000,
                80_000,
                2,
                r#"{"find": "orders", "filter": {"region": "eu", "total": {"$gte": 100}}}"#,
            ),
            row("COLLSCAN", 50, 200, 1, r#"{"find": "orders", "filter": {"region": "eu"}}"#),
        ];
        let reports = suggest_indexes(&rows);
        let suggestions = &reports["shop.orders"].suggestions;
        assert!(suggestions.len() >= 2);
        for (i, a) in suggestions.iter().enumerate() {
            for b in suggestions.iter().skip(i + 1) {
                assert!(
                    !a.fields.starts_with(&b.fields) && !b.fields.starts_with(&a.fields),
                    "{:?} and {:?} form a prefix chain",
                    a.fields,
                    b.fields
                );
            }
        }
    }

    #[test]
    fn test_pattern_weighting_multiplies_duration_load() {
        // Three identical executions: each occurrence carries the whole
        // pattern's duration, so impact reflects shape-wide load.
        let mk = || row("COLLSCAN", 300, 0, 0, r#"{"find": "orders", "filter": {"a": 1}}"#);
        let reports = suggest_indexes(&vec![mk(), mk(), mk()]);
        let s = &reports["shop.orders"].suggestions[0];
        assert_eq!(s.occurrences, 3);
        // 3 rows x (3 x 300ms pattern load) = 2700.
        assert_eq!(s.impact_score, 2700);
    }

    #[test]
    fn test_inefficiency_scales_impact() {
        let efficient = suggest_indexes(&[row(
            "COLLSCAN",
            100,
            10,
            10,
            r#"{"find": "orders", "filter": {"a": 1}}"#,
        )]);
        let wasteful = suggest_indexes(&[row(
            "COLLSCAN",
            100,
            10_000,
            1,
            r#"{"find": "orders", "filter": {"a": 1}}"#,
        )]);
        let e = efficient["shop.orders"].suggestions[0].impact_score;
        let w = wasteful["shop.orders"].suggestions[0].impact_score;
        assert!(w > e * 1000);
        assert!((wasteful["shop.orders"].suggestions[0].inefficiency_ratio - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_text_queries_contribute_stats_only() {
        let rows = vec![row("COLLSCAN", 250, 400, 4, "command shop.orders find: slow")];
        let reports = suggest_indexes(&rows);
        let report = &reports["shop.orders"];
        assert!(report.suggestions.is_empty());
        assert_eq!(report.sample_queries.len(), 1);
        assert_eq!(report.total_docs_examined, 400);
    }
}
