//! Query-shape normalization and hashing.
//!
//! Server logs only attach a `queryHash` on some versions and some code
//! paths. For everything else we derive a synthetic hash from the shape
//! of the command document: operation, filter field names, pipeline
//! stage structure, sort keys. Two executions that differ only in
//! bound values collapse to the same hash; changing a field name, a
//! regex pattern or a sort direction yields a new one.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use xxhash_rust::xxh3::xxh3_64;

/// Operation keys probed, in order, to label the command. `command` is
/// last so wrapped commands fall through to their envelope.
const OPERATION_KEYS: &[&str] = &["find", "aggregate", "update", "delete", "insert", "command"];

/// Hash of the normalized shape of `query_text`, scoped to the
/// namespace. Unparseable text falls back to a coarse textual
/// normalization so free-form lines still group.
pub fn synthetic_query_hash(database: &str, collection: &str, query_text: &str) -> String {
    let normalized = if query_text.starts_with('{') {
        match serde_json::from_str::<Value>(query_text) {
            Ok(value) => normalized_shape(database, collection, &value),
            Err(_) => format!("{database}.{collection}|{}", normalize_text(query_text)),
        }
    } else {
        format!("{database}.{collection}|{}", normalize_text(query_text))
    };
    format!("{:016x}", xxh3_64(normalized.as_bytes()))
}

fn normalized_shape(database: &str, collection: &str, value: &Value) -> String {
    let mut parts = vec![format!("{database}.{collection}")];

    if let Some(obj) = value.as_object() {
        let op = OPERATION_KEYS.iter().find(|key| obj.contains_key(**key));
        match op {
            Some(key) => parts.push(format!("op:{key}")),
            None => {
                // A bare filter document, as the legacy text parser and
                // some drivers emit.
                parts.push("op:filter".into());
                let mut fields = BTreeSet::new();
                collect_structure(value, 0, &mut fields);
                if !fields.is_empty() {
                    parts.push(format!("filter:{}", join(&fields)));
                }
            }
        }

        if let Some(filter) = obj.get("filter") {
            let mut fields = BTreeSet::new();
            collect_structure(filter, 0, &mut fields);
            if !fields.is_empty() {
                parts.push(format!("filter:{}", join(&fields)));
            }
        }

        if let Some(pipeline) = obj.get("pipeline").and_then(Value::as_array) {
            pipeline_components(pipeline, &mut parts);
        }

        for (list_key, part_name) in [("updates", "updates_filter"), ("deletes", "deletes_filter")]
        {
            if let Some(entries) = obj.get(list_key).and_then(Value::as_array) {
                let mut fields = BTreeSet::new();
                for entry in entries {
                    if let Some(q) = entry.get("q") {
                        collect_structure(q, 0, &mut fields);
                    }
                }
                if !fields.is_empty() {
                    parts.push(format!("{part_name}:{}", join(&fields)));
                }
            }
        }

        if let Some(sort) = obj.get("sort").and_then(Value::as_object) {
            if let Some(part) = sort_component("sort", sort) {
                parts.push(part);
            }
        }
    }

    parts.join("|")
}

/// Pipeline shape: the `$`-operators of each stage in order, all sort
/// keys with directions, and per-`$match` field names plus a value
/// digest so distinct match conditions stay distinct.
fn pipeline_components(pipeline: &[Value], parts: &mut Vec<String>) {
    let mut ops = Vec::new();
    let mut sort_parts = Vec::new();
    let mut match_fields = BTreeSet::new();

    for stage in pipeline {
        let Some(stage) = stage.as_object() else {
            continue;
        };
        for op in stage.keys() {
            if op.starts_with('$') {
                ops.push(op.clone());
            }
        }
        if let Some(sort) = stage.get("$sort").and_then(Value::as_object) {
            for (field, dir) in sort {
                sort_parts.push(format!("{field}:{}", sort_direction(dir)));
            }
        }
        if let Some(matcher) = stage.get("$match")
            && matcher.is_object()
        {
            collect_structure(matcher, 0, &mut match_fields);
            // serde_json renders object keys sorted, so equal match
            // documents digest identically regardless of key order.
            let digest = short_hash(&matcher.to_string());
            match_fields.insert(format!("match_values_{digest}"));
        }
    }

    if !ops.is_empty() {
        parts.push(format!("pipeline:{}", ops.join(",")));
    }
    if !sort_parts.is_empty() {
        parts.push(format!("pipeline_sort:{}", sort_parts.join(",")));
    }
    if !match_fields.is_empty() {
        parts.push(format!("pipeline_match:{}", join(&match_fields)));
    }
}

/// Field names referenced by a filter document, two operator levels
/// deep. Recursion follows `$`-operators only; a field's own value is
/// never descended into, so `{a: {b: 1}}` yields just `a`. Regex
/// conditions additionally contribute a `<field>_regex_<digest>` marker
/// because two regexes on the same field are different shapes.
pub fn collect_structure(filter: &Value, depth: usize, out: &mut BTreeSet<String>) {
    if depth >= 2 {
        return;
    }
    let Some(obj) = filter.as_object() else {
        return;
    };
    for (key, value) in obj {
        if !key.starts_with('$') {
            out.insert(key.clone());
            if let Some(regex) = value.get("$regex") {
                let pattern = regex
                    .pointer("/$regularExpression/pattern")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| match regex.as_str() {
                        Some(s) => s.to_owned(),
                        None => regex.to_string(),
                    });
                out.insert(format!("{key}_regex_{}", short_hash(&pattern)));
            }
        } else if value.is_object() {
            collect_structure(value, depth + 1, out);
        } else if let Some(items) = value.as_array() {
            for item in items {
                if item.is_object() {
                    collect_structure(item, depth + 1, out);
                }
            }
        }
    }
}

/// Human-readable pattern label for a stored query text, e.g.
/// `find(status, user_id)` or `aggregate(region)`.
pub fn query_pattern_label(query_text: &str) -> String {
    if query_text.is_empty() {
        return "Unknown Query Pattern".into();
    }
    let trimmed = query_text.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        let lower = query_text.to_lowercase();
        for op in ["find", "update", "delete", "aggregate"] {
            if lower.contains(op) {
                return format!("{op}(text_query)");
            }
        }
        return "unknown(text_query)".into();
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return "malformed_query".into();
    };
    let Some(obj) = value.as_object() else {
        return "malformed_query".into();
    };

    let (operation, filter) = if obj.contains_key("find") {
        ("find", obj.get("filter").cloned())
    } else if obj.contains_key("aggregate") {
        let first_match = obj
            .get("pipeline")
            .and_then(Value::as_array)
            .and_then(|stages| stages.first())
            .and_then(|stage| stage.get("$match"))
            .cloned();
        ("aggregate", first_match)
    } else if obj.contains_key("findAndModify") {
        ("findAndModify", obj.get("query").cloned())
    } else if obj.contains_key("update") {
        let q = obj
            .get("updates")
            .and_then(Value::as_array)
            .and_then(|u| u.first())
            .and_then(|u| u.get("q"))
            .cloned();
        ("update", q)
    } else if obj.contains_key("delete") {
        let q = obj
            .get("deletes")
            .and_then(Value::as_array)
            .and_then(|d| d.first())
            .and_then(|d| d.get("q"))
            .cloned();
        ("delete", q)
    } else {
        ("unknown", None)
    };

    let mut fields: Vec<&String> = filter
        .as_ref()
        .and_then(Value::as_object)
        .map(|f| f.keys().collect())
        .unwrap_or_default();
    fields.sort();
    if fields.is_empty() {
        format!("{operation}()")
    } else {
        let names: Vec<&str> = fields.iter().map(|s| s.as_str()).collect();
        format!("{operation}({})", names.join(", "))
    }
}

/// Operation verb for a stored query text, lowercased. `findAndModify`
/// reports as `update`; unrecognized documents report `unknown`.
pub fn operation_type(query_text: &str) -> String {
    const CANDIDATES: &[&str] = &[
        "findAndModify",
        "aggregate",
        "find",
        "update",
        "delete",
        "insert",
        "distinct",
        "count",
        "explain",
    ];
    let probe = |obj: &Map<String, Value>| -> Option<String> {
        CANDIDATES.iter().find(|c| obj.contains_key(**c)).map(|c| {
            if *c == "findAndModify" {
                "update".into()
            } else {
                (*c).to_string()
            }
        })
    };

    let Ok(value) = serde_json::from_str::<Value>(query_text) else {
        return "unknown".into();
    };
    let Some(obj) = value.as_object() else {
        return "unknown".into();
    };
    if let Some(op) = probe(obj) {
        return op;
    }
    let command = obj.get("command").and_then(Value::as_object);
    if let Some(command) = command {
        if let Some(op) = probe(command) {
            return op;
        }
        let name = command
            .get("commandName")
            .or_else(|| command.get("operation"))
            .and_then(Value::as_str);
        if let Some(name) = name
            && !name.is_empty()
        {
            return name.to_lowercase();
        }
    }
    if obj.contains_key("saslStart") || command.is_some_and(|c| c.contains_key("saslStart")) {
        return "saslStart".into();
    }
    "unknown".into()
}

/// Coarse pattern for non-JSON query text. `command <verb>` lines keep
/// the verb, slow-query prose collapses to one bucket, anything else
/// keeps a whitespace-normalized 50-character prefix.
fn normalize_text(query_text: &str) -> String {
    static COMMAND_RE: OnceLock<Regex> = OnceLock::new();
    let lower = query_text.to_lowercase();
    if lower.contains("command") {
        let re = COMMAND_RE
            .get_or_init(|| Regex::new(r"(?i)command\s+(\w+)").expect("static regex"));
        if let Some(caps) = re.captures(query_text) {
            return format!("command:{}", &caps[1]);
        }
    }
    if lower.contains("slow query") {
        return "slow_query".into();
    }
    let end = query_text
        .char_indices()
        .nth(50)
        .map_or(query_text.len(), |(i, _)| i);
    query_text[..end]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn sort_component(prefix: &str, spec: &Map<String, Value>) -> Option<String> {
    if spec.is_empty() {
        return None;
    }
    let rendered: Vec<String> = spec
        .iter()
        .map(|(field, dir)| format!("{field}:{}", sort_direction(dir)))
        .collect();
    Some(format!("{prefix}:{}", rendered.join(",")))
}

/// Sort direction as an integer, tolerating string and float spellings.
/// Anything unparseable sorts ascending.
fn sort_direction(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(1)
}

fn short_hash(text: &str) -> String {
    format!("{:08x}", (xxh3_64(text.as_bytes()) & 0xffff_ffff) as u32)
}

fn join(fields: &BTreeSet<String>) -> String {
    fields.iter().cloned().collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_shape_different_values_share_hash() {
        let a = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"find": "orders", "filter": {"status": "pending"}}"#,
        );
        let b = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"find": "orders", "filter": {"status": "shipped"}}"#,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_different_filter_fields_differ() {
        let a = synthetic_query_hash("shop", "orders", r#"{"find": "orders", "filter": {"status": "x"}}"#);
        let b = synthetic_query_hash("shop", "orders", r#"{"find": "orders", "filter": {"user_id": "x"}}"#);
        assert_ne!(a, b);
    }

    #[test]
    fn test_namespace_scopes_hash() {
        let text = r#"{"find": "c", "filter": {"a": 1}}"#;
        assert_ne!(
            synthetic_query_hash("shop", "orders", text),
            synthetic_query_hash("shop", "users", text)
        );
    }

    #[test]
    fn test_sort_direction_changes_hash() {
        let asc = r#"{"find": "orders", "filter": {"status": "x"}, "sort": {"createdAt": 1}}"#;
        let desc = r#"{"find": "orders", "filter": {"status": "x"}, "sort": {"createdAt": -1}}"#;
        assert_ne!(
            synthetic_query_hash("shop", "orders", asc),
            synthetic_query_hash("shop", "orders", desc)
        );
    }

    #[test]
    fn test_bare_filter_document_groups_by_fields() {
        let a = synthetic_query_hash("shop", "orders", r#"{"status": "a", "region": "eu"}"#);
        let b = synthetic_query_hash("shop", "orders", r#"{"status": "b", "region": "us"}"#);
        let c = synthetic_query_hash("shop", "orders", r#"{"status": "a"}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_regex_pattern_participates_in_shape() {
        let a = synthetic_query_hash(
            "shop",
            "users",
            r#"{"find": "users", "filter": {"name": {"$regex": "^al"}}}"#,
        );
        let b = synthetic_query_hash(
            "shop",
            "users",
            r#"{"find": "users", "filter": {"name": {"$regex": "^bo"}}}"#,
        );
        let a2 = synthetic_query_hash(
            "shop",
            "users",
            r#"{"find": "users", "filter": {"name": {"$regex": "^al"}}}"#,
        );
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_extended_json_regex_form() {
        let plain = r#"{"find": "u", "filter": {"n": {"$regex": "^x"}}}"#;
        let wrapped = r#"{"find": "u", "filter": {"n": {"$regex": {"$regularExpression": {"pattern": "^x", "options": ""}}}}}"#;
        assert_eq!(
            synthetic_query_hash("d", "u", plain),
            synthetic_query_hash("d", "u", wrapped)
        );
    }

    #[test]
    fn test_pipeline_match_values_distinguish() {
        let a = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"aggregate": "orders", "pipeline": [{"$match": {"region": "eu"}}, {"$group": {"_id": "$status"}}]}"#,
        );
        let b = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"aggregate": "orders", "pipeline": [{"$match": {"region": "us"}}, {"$group": {"_id": "$status"}}]}"#,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_pipeline_stage_order_matters() {
        let a = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"aggregate": "orders", "pipeline": [{"$sort": {"ts": -1}}, {"$limit": 5}]}"#,
        );
        let b = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"aggregate": "orders", "pipeline": [{"$limit": 5}, {"$sort": {"ts": -1}}]}"#,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_update_filters_pool_across_entries() {
        let a = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"update": "orders", "updates": [{"q": {"status": "a"}, "u": {"$set": {"x": 1}}}]}"#,
        );
        let b = synthetic_query_hash(
            "shop",
            "orders",
            r#"{"update": "orders", "updates": [{"q": {"status": "z"}, "u": {"$set": {"y": 2}}}]}"#,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_text_fallback_groups_slow_query_prose() {
        let a = synthetic_query_hash("db", "c", "warning: slow query detected on primary");
        let b = synthetic_query_hash("db", "c", "another slow query on secondary");
        assert_eq!(a, b);
    }

    #[test]
    fn test_text_fallback_command_verb() {
        let a = synthetic_query_hash("db", "c", "command getMore took long");
        let b = synthetic_query_hash("db", "c", "command getMore something else");
        let c = synthetic_query_hash("db", "c", "command isMaster quick");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_malformed_json_falls_back_to_text() {
        let h = synthetic_query_hash("db", "c", "{not valid json at all");
        assert_eq!(h.len(), 16);
    }

    #[test]
    fn test_collect_structure_depth_limit() {
        let filter: Value = serde_json::from_str(
            r#"{"$and": [{"a": 1}, {"$or": [{"deep": {"$gt": 2}}]}]}"#,
        )
        .unwrap();
        let mut out = BTreeSet::new();
        collect_structure(&filter, 0, &mut out);
        // 'a' at depth 1; the $or at depth 1 recurses to depth 2 and stops.
        assert!(out.contains("a"));
        assert!(!out.contains("deep"));
    }

    #[test]
    fn test_collect_structure_does_not_descend_values() {
        let filter: Value = serde_json::from_str(r#"{"a": {"b": {"c": 1}}}"#).unwrap();
        let mut out = BTreeSet::new();
        collect_structure(&filter, 0, &mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_pattern_label_find() {
        let label =
            query_pattern_label(r#"{"find": "orders", "filter": {"user_id": 7, "status": "x"}}"#);
        assert_eq!(label, "find(status, user_id)");
    }

    #[test]
    fn test_pattern_label_aggregate_first_match() {
        let label = query_pattern_label(
            r#"{"aggregate": "orders", "pipeline": [{"$match": {"region": "eu"}}, {"$sort": {"ts": 1}}]}"#,
        );
        assert_eq!(label, "aggregate(region)");
    }

    #[test]
    fn test_pattern_label_update_first_entry() {
        let label = query_pattern_label(
            r#"{"update": "orders", "updates": [{"q": {"status": "a"}}, {"q": {"other": 1}}]}"#,
        );
        assert_eq!(label, "update(status)");
    }

    #[test]
    fn test_pattern_label_no_filter() {
        assert_eq!(query_pattern_label(r#"{"find": "orders"}"#), "find()");
    }

    #[test]
    fn test_pattern_label_text_and_malformed() {
        assert_eq!(query_pattern_label("query find on orders"), "find(text_query)");
        assert_eq!(query_pattern_label("getmore cursor"), "unknown(text_query)");
        assert_eq!(query_pattern_label("{broken json}"), "malformed_query");
        assert_eq!(query_pattern_label(""), "Unknown Query Pattern");
    }

    #[test]
    fn test_operation_type_direct_and_mapped() {
        assert_eq!(operation_type(r#"{"find": "c"}"#), "find");
        assert_eq!(operation_type(r#"{"findAndModify": "c"}"#), "update");
        assert_eq!(operation_type(r#"{"distinct": "c"}"#), "distinct");
    }

    #[test]
    fn test_operation_type_nested_command() {
        assert_eq!(operation_type(r#"{"command": {"aggregate": "c"}}"#), "aggregate");
        assert_eq!(
            operation_type(r#"{"command": {"commandName": "GetMore"}}"#),
            "getmore"
        );
    }

    #[test]
    fn test_operation_type_sasl_and_unknown() {
        assert_eq!(operation_type(r#"{"saslStart": 1}"#), "saslStart");
        assert_eq!(operation_type(r#"{"mystery": 1}"#), "unknown");
        assert_eq!(operation_type("not json"), "unknown");
    }
}
