//! Raw-line search: AND-chained keyword/field conditions with optional
//! regex, case sensitivity, negation, and an inclusive date window.
//!
//! Three execution modes share one line-evaluation routine. The caller
//! picks the mode from what it knows about the corpus: lines already
//! buffered in memory, small files worth loading whole, or large files
//! that must be streamed. When a date window is active, lines without
//! an extractable timestamp are dropped, never kept.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::TotalCountPolicy;
use crate::util;

/// What one condition matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionTarget {
    /// The raw line text.
    Keyword,
    /// A dot-path into the line's parsed JSON, e.g. `attr.remote`.
    Field(String),
}

/// One condition in an AND chain.
#[derive(Debug, Clone)]
pub struct SearchCondition {
    pub target: ConditionTarget,
    pub value: String,
    pub regex: bool,
    pub case_sensitive: bool,
    pub negate: bool,
}

impl SearchCondition {
    pub fn keyword(value: impl Into<String>) -> Self {
        SearchCondition {
            target: ConditionTarget::Keyword,
            value: value.into(),
            regex: false,
            case_sensitive: false,
            negate: false,
        }
    }

    pub fn field(name: impl Into<String>, value: impl Into<String>) -> Self {
        SearchCondition {
            target: ConditionTarget::Field(name.into()),
            value: value.into(),
            regex: false,
            case_sensitive: false,
            negate: false,
        }
    }

    pub fn regex(mut self, regex: bool) -> Self {
        self.regex = regex;
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn negate(mut self, negate: bool) -> Self {
        self.negate = negate;
        self
    }
}

/// Search parameters shared by all modes.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub conditions: Vec<SearchCondition>,
    pub start_epoch: Option<i64>,
    pub end_epoch: Option<i64>,
    pub limit: usize,
    /// Streaming-mode total policy; the other modes always report
    /// exact totals.
    pub total_count_policy: TotalCountPolicy,
}

impl Default for SearchRequest {
    fn default() -> Self {
        SearchRequest {
            conditions: Vec::new(),
            start_epoch: None,
            end_epoch: None,
            limit: 100,
            total_count_policy: TotalCountPolicy::Exact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub file_path: String,
    pub line_number: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub raw_line: String,
}

/// Matches plus the running total. `total_found` keeps counting past
/// `limit`; `exact` is false only when a streaming scan stopped early
/// under [`TotalCountPolicy::FirstPageOnly`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchHit>,
    pub total_found: usize,
    pub exact: bool,
}

enum Matcher {
    Substring { needle: String, case_sensitive: bool },
    /// `None` when the pattern failed to compile or was empty; such a
    /// condition never matches (negation still applies afterwards).
    Regex(Option<Regex>),
}

struct CompiledCondition {
    target: ConditionTarget,
    matcher: Matcher,
    negate: bool,
}

impl CompiledCondition {
    fn compile(condition: &SearchCondition) -> Self {
        let matcher = if condition.regex {
            let compiled = if condition.value.is_empty() {
                None
            } else {
                RegexBuilder::new(&condition.value)
                    .case_insensitive(!condition.case_sensitive)
                    .build()
                    .map_err(|error| {
                        debug!(pattern = %condition.value, %error, "invalid search regex, condition will never match");
                        error
                    })
                    .ok()
            };
            Matcher::Regex(compiled)
        } else {
            Matcher::Substring {
                needle: condition.value.clone(),
                case_sensitive: condition.case_sensitive,
            }
        };
        CompiledCondition {
            target: condition.target.clone(),
            matcher,
            negate: condition.negate,
        }
    }

    fn matches(&self, raw_line: &str, parsed: Option<&Value>) -> bool {
        let matched = match &self.target {
            ConditionTarget::Keyword => self.matcher.matches(raw_line),
            ConditionTarget::Field(path) => {
                let text = parsed
                    .and_then(|value| nested_field(value, path))
                    .map(field_text)
                    .unwrap_or_default();
                self.matcher.matches(&text)
            }
        };
        matched != self.negate
    }
}

impl Matcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Substring {
                needle,
                case_sensitive: true,
            } => text.contains(needle.as_str()),
            Matcher::Substring {
                needle,
                case_sensitive: false,
            } => text.to_lowercase().contains(&needle.to_lowercase()),
            Matcher::Regex(Some(regex)) => regex.is_match(text),
            Matcher::Regex(None) => false,
        }
    }
}

fn nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct LineFilter {
    conditions: Vec<CompiledCondition>,
    start_epoch: Option<i64>,
    end_epoch: Option<i64>,
}

impl LineFilter {
    fn new(request: &SearchRequest) -> Self {
        LineFilter {
            conditions: request
                .conditions
                .iter()
                .map(CompiledCondition::compile)
                .collect(),
            start_epoch: request.start_epoch,
            end_epoch: request.end_epoch,
        }
    }

    fn date_window_active(&self) -> bool {
        self.start_epoch.is_some() || self.end_epoch.is_some()
    }

    fn keyword_only(&self) -> bool {
        self.conditions
            .iter()
            .all(|c| c.target == ConditionTarget::Keyword)
    }

    /// Evaluate one line. `Some(epoch)` means the line matched; the
    /// epoch is `None` for lines without a parseable timestamp (only
    /// possible when no date window is set).
    fn admit(&self, line: &str) -> Option<Option<i64>> {
        let parsed: Option<Value> = serde_json::from_str(line).ok();
        let epoch = parsed.as_ref().and_then(util::epoch_from_entry);

        if self.date_window_active() {
            let epoch = epoch?;
            if self.start_epoch.is_some_and(|start| epoch < start) {
                return None;
            }
            if self.end_epoch.is_some_and(|end| epoch > end) {
                return None;
            }
        }

        if self
            .conditions
            .iter()
            .all(|c| c.matches(line, parsed.as_ref()))
        {
            Some(epoch)
        } else {
            None
        }
    }
}

struct Collector {
    limit: usize,
    results: Vec<SearchHit>,
    total_found: usize,
}

impl Collector {
    fn new(limit: usize) -> Self {
        Collector {
            limit,
            results: Vec::new(),
            total_found: 0,
        }
    }

    fn note(&mut self, file_path: &str, line_number: u64, epoch: Option<i64>, raw_line: &str) {
        self.total_found += 1;
        if self.results.len() < self.limit {
            self.results.push(SearchHit {
                file_path: file_path.to_string(),
                line_number,
                timestamp: epoch.and_then(|e| Utc.timestamp_opt(e, 0).single()),
                raw_line: raw_line.to_string(),
            });
        }
    }

    fn full(&self) -> bool {
        self.results.len() >= self.limit
    }

    fn finish(self, exact: bool) -> SearchOutcome {
        SearchOutcome {
            results: self.results,
            total_found: self.total_found,
            exact,
        }
    }
}

/// Search lines already buffered from a prior parse, keyed by file
/// path. Files are visited in path order so results are stable.
pub fn search_in_memory(
    lines: &HashMap<String, Vec<String>>,
    request: &SearchRequest,
) -> SearchOutcome {
    let filter = LineFilter::new(request);
    let mut collector = Collector::new(request.limit);
    let mut paths: Vec<&String> = lines.keys().collect();
    paths.sort();
    for path in paths {
        for (idx, line) in lines[path].iter().enumerate() {
            if let Some(epoch) = filter.admit(line) {
                collector.note(path, idx as u64 + 1, epoch, line);
            }
        }
    }
    collector.finish(true)
}

/// Load each file fully, search, and discard. For corpora under the
/// ephemeral size threshold; totals are always exact.
pub fn search_ephemeral(files: &[PathBuf], request: &SearchRequest) -> SearchOutcome {
    let filter = LineFilter::new(request);
    let mut collector = Collector::new(request.limit);
    for path in files {
        let content = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping unreadable file in search");
                continue;
            }
        };
        scan_lines(content.lines(), path, &filter, &mut collector, false);
    }
    collector.finish(true)
}

/// Re-open each file and scan line-by-line without buffering. Under
/// [`TotalCountPolicy::FirstPageOnly`], a pure-keyword request without
/// a date window stops at `limit` hits and reports an inexact total.
pub fn search_streaming(files: &[PathBuf], request: &SearchRequest) -> SearchOutcome {
    let filter = LineFilter::new(request);
    let mut collector = Collector::new(request.limit);
    let may_stop_early = request.total_count_policy == TotalCountPolicy::FirstPageOnly
        && filter.keyword_only()
        && !filter.date_window_active();

    let mut truncated = false;
    for path in files {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping unreadable file in search");
                continue;
            }
        };
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        let lines = std::iter::from_fn(move || {
            bytes.clear();
            match reader.read_until(b'\n', &mut bytes) {
                Ok(0) | Err(_) => None,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&bytes);
                    Some(text.trim_end_matches(['\n', '\r']).to_owned())
                }
            }
        });
        if scan_lines(lines, path, &filter, &mut collector, may_stop_early) {
            truncated = true;
            break;
        }
    }
    collector.finish(!truncated)
}

/// Shared scan loop. Returns true when the scan stopped early.
fn scan_lines<I, S>(
    lines: I,
    path: &Path,
    filter: &LineFilter,
    collector: &mut Collector,
    may_stop_early: bool,
) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let label = path.display().to_string();
    for (idx, line) in lines.into_iter().enumerate() {
        let line = line.as_ref();
        if let Some(epoch) = filter.admit(line) {
            collector.note(&label, idx as u64 + 1, epoch, line);
            if may_stop_early && collector.full() {
                return true;
            }
        }
    }
    false
}
