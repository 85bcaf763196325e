//! moglot - MongoDB server log analyzer CLI.
//!
//! Ingests mongod log files (JSON or legacy text) into an embedded
//! analysis database, then answers pattern, index-suggestion, search
//! and dashboard queries from it. All output is JSON on stdout.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system.
/// Uses jemalloc's arena purge to reduce RSS after bulk ingestion.
fn release_memory_to_os() {
    // SAFETY: We're calling jemalloc's mallctl with valid arguments.
    // arena.0.purge tells jemalloc to return unused pages to the OS.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use clap::{Parser, Subcommand};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use moglot_core::config::TotalCountPolicy;
use moglot_core::search::{self, SearchCondition, SearchRequest};
use moglot_core::storage::{IndexBuildService, PatternGrouping, PlanFilter, QueryFilters};
use moglot_core::{Analyzer, AnalyzerConfig, Result};

/// MongoDB server log analyzer.
#[derive(Parser)]
#[command(name = "moglot", about = "MongoDB server log analyzer", version)]
struct Args {
    /// Analysis database path.
    #[arg(long, global = true, default_value = "./moglot.db")]
    db: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse log files into a fresh dataset, replacing the previous one.
    Ingest {
        /// Log files, processed as one bulk session.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Worker threads for large-file ingestion.
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Slow-query duration threshold in milliseconds.
        #[arg(long, default_value = "100")]
        threshold: i64,
    },

    /// Aggregated slow-query patterns, highest load first.
    Patterns {
        /// Grouping: pattern_key, namespace or query_hash.
        #[arg(long, default_value = "pattern_key", value_parser = parse_grouping)]
        group: PatternGrouping,

        /// Only queries against this database.
        #[arg(long)]
        database: Option<String>,

        /// Plan summary: COLLSCAN, IXSCAN, or "other" for anything else.
        #[arg(long, value_parser = parse_plan)]
        plan: Option<PlanFilter>,

        /// Only queries against this namespace (database.collection).
        #[arg(long)]
        namespace: Option<String>,

        /// Minimum duration in milliseconds.
        #[arg(long, default_value = "100")]
        min_duration: i64,

        /// Window start (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_when)]
        since: Option<i64>,

        /// Window end, inclusive (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_when_end)]
        until: Option<i64>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Per-collection compound-index suggestions.
    Suggest,

    /// Search raw log lines, or stored query text with --queries.
    Search {
        /// Conditions, AND-chained: `keyword`, `field=value` for a
        /// dot-path into the line's JSON, `!`-prefixed to negate.
        #[arg(required = true)]
        terms: Vec<String>,

        /// Log file to scan; repeatable. Ignored with --queries.
        #[arg(long = "in", value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Treat condition values as regular expressions.
        #[arg(long)]
        regex: bool,

        /// Match case-sensitively.
        #[arg(long)]
        case_sensitive: bool,

        /// Window start (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_when)]
        since: Option<i64>,

        /// Window end, inclusive (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_when_end)]
        until: Option<i64>,

        #[arg(long, default_value = "100")]
        limit: usize,

        /// Stop streaming keyword scans once the limit is filled; the
        /// reported total becomes a lower bound.
        #[arg(long)]
        first_page_only: bool,

        /// Full-text search the stored query text instead of scanning files.
        #[arg(long)]
        queries: bool,

        /// Result page for --queries.
        #[arg(long, default_value = "1")]
        page: usize,

        /// Page size for --queries.
        #[arg(long, default_value = "20")]
        per_page: usize,

        /// Aggregate source size up to which whole files are read into
        /// memory; larger corpora are streamed (e.g. "200M", "1G").
        #[arg(long, default_value = "200M", value_parser = parse_size)]
        ephemeral_limit: u64,
    },

    /// Dashboard counters over the stored dataset.
    Stats {
        /// Window start (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_when)]
        since: Option<i64>,

        /// Window end, inclusive (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_when_end)]
        until: Option<i64>,

        /// Include the OS resource workload breakdown.
        #[arg(long)]
        resources: bool,
    },

    /// Print one raw source line, 1-based.
    Line { file: PathBuf, line_number: u64 },
}

/// Parses a human-readable size string (e.g., "1G", "500M", "1024K") into bytes.
fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s, 1)
    };

    num_str
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|e| format!("invalid size '{}': {}", s, e))
}

fn parse_grouping(s: &str) -> std::result::Result<PatternGrouping, String> {
    match s {
        "pattern_key" => Ok(PatternGrouping::PatternKey),
        "namespace" => Ok(PatternGrouping::Namespace),
        "query_hash" => Ok(PatternGrouping::QueryHash),
        other => Err(format!(
            "unknown grouping '{}' (expected pattern_key, namespace or query_hash)",
            other
        )),
    }
}

fn parse_plan(s: &str) -> std::result::Result<PlanFilter, String> {
    if s.eq_ignore_ascii_case("other") {
        Ok(PlanFilter::Other)
    } else {
        Ok(PlanFilter::Exact(s.to_string()))
    }
}

/// Parses an RFC 3339 timestamp or a bare date into epoch seconds.
fn parse_when(s: &str) -> std::result::Result<i64, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.timestamp());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp())
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

/// Like [`parse_when`], but a bare date means the end of that day.
fn parse_when_end(s: &str) -> std::result::Result<i64, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.timestamp());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_hms_opt(23, 59, 59).unwrap().and_utc().timestamp())
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

/// One search-term expression: `keyword`, `field=value`, `!`-prefixed to negate.
fn parse_condition(term: &str, regex: bool, case_sensitive: bool) -> SearchCondition {
    let (negate, term) = match term.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, term),
    };
    let condition = match term.split_once('=') {
        Some((field, value)) if !field.is_empty() => SearchCondition::field(field, value),
        _ => SearchCondition::keyword(term),
    };
    condition
        .regex(regex)
        .case_sensitive(case_sensitive)
        .negate(negate)
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("moglot={}", level).parse().unwrap())
        .add_directive(format!("moglot_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("JSON-serializable output")
    );
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(error) = run(args) {
        error!("{}", error);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let index_service = Arc::new(IndexBuildService::new());

    match args.command {
        Command::Ingest {
            files,
            workers,
            threshold,
        } => {
            let config = AnalyzerConfig {
                workers,
                slow_query_threshold_ms: threshold,
                // The process exits after the session; buffering raw
                // lines for later in-memory search would be wasted.
                store_raw_lines: false,
                ..Default::default()
            };
            let mut analyzer = Analyzer::open(config, &args.db, Arc::clone(&index_service))?;

            analyzer.begin_bulk_session()?;
            for file in &files {
                let summary = analyzer.ingest_file(file)?;
                info!(
                    file = %file.display(),
                    lines = summary.total_lines,
                    slow_queries = summary.slow_query_events,
                    errors = summary.error_lines,
                    io_errors = summary.io_errors,
                    "file parsed"
                );
            }
            let summary = analyzer.finish_bulk_session()?;
            print_json(&summary);

            release_memory_to_os();
            // Deferred index builds die with the process; drain them now.
            index_service.stop();
        }

        Command::Patterns {
            group,
            database,
            plan,
            namespace,
            min_duration,
            since,
            until,
            limit,
        } => {
            let mut analyzer =
                Analyzer::open(AnalyzerConfig::default(), &args.db, index_service)?;
            let filters = QueryFilters {
                threshold_ms: min_duration,
                database,
                plan_summary: plan,
                namespace,
                start_epoch: since,
                end_epoch: until,
            };
            let patterns = analyzer.patterns(group, &filters, limit)?;
            print_json(&patterns);
        }

        Command::Suggest => {
            let analyzer = Analyzer::open(AnalyzerConfig::default(), &args.db, index_service)?;
            print_json(&analyzer.index_suggestions()?);
        }

        Command::Search {
            terms,
            files,
            regex,
            case_sensitive,
            since,
            until,
            limit,
            first_page_only,
            queries,
            page,
            per_page,
            ephemeral_limit,
        } => {
            if queries {
                let analyzer =
                    Analyzer::open(AnalyzerConfig::default(), &args.db, index_service)?;
                let term = terms.join(" ");
                print_json(&analyzer.search_queries(&term, page, per_page)?);
                return Ok(());
            }

            if files.is_empty() {
                eprintln!("search needs at least one --in FILE (or --queries)");
                std::process::exit(2);
            }
            let request = SearchRequest {
                conditions: terms
                    .iter()
                    .map(|t| parse_condition(t, regex, case_sensitive))
                    .collect(),
                start_epoch: since,
                end_epoch: until,
                limit,
                total_count_policy: if first_page_only {
                    TotalCountPolicy::FirstPageOnly
                } else {
                    TotalCountPolicy::Exact
                },
            };
            let total_size: u64 = files
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum();
            let outcome = if total_size <= ephemeral_limit {
                search::search_ephemeral(&files, &request)
            } else {
                search::search_streaming(&files, &request)
            };
            print_json(&outcome);
        }

        Command::Stats {
            since,
            until,
            resources,
        } => {
            let mut analyzer =
                Analyzer::open(AnalyzerConfig::default(), &args.db, index_service)?;
            let mut payload = serde_json::json!({
                "stats": analyzer.dashboard_stats(since, until)?,
                "date_range": analyzer.date_range()?,
                "databases": analyzer.databases()?,
            });
            if resources {
                payload["resources"] =
                    serde_json::to_value(analyzer.resource_workload()?)
                        .expect("JSON-serializable output");
            }
            print_json(&payload);
        }

        Command::Line { file, line_number } => {
            let reader = BufReader::new(File::open(&file)?);
            let mut found = None;
            for (idx, line) in reader.lines().enumerate() {
                if idx as u64 + 1 == line_number {
                    found = Some(line?);
                    break;
                }
            }
            match found {
                Some(line) => println!("{}", line.trim()),
                None => {
                    eprintln!("{}:{} not found", file.display(), line_number);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use moglot_core::search::ConditionTarget;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("200M").unwrap(), 200 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("123").unwrap(), 123);
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn test_parse_when_accepts_date_and_rfc3339() {
        assert_eq!(parse_when("2024-01-15").unwrap(), 1705276800);
        assert_eq!(parse_when_end("2024-01-15").unwrap(), 1705276800 + 86399);
        assert_eq!(
            parse_when("2024-01-15T14:30:00Z").unwrap(),
            parse_when_end("2024-01-15T14:30:00Z").unwrap()
        );
        assert!(parse_when("yesterday").is_err());
    }

    #[test]
    fn test_parse_condition_expressions() {
        let keyword = parse_condition("COLLSCAN", false, false);
        assert_eq!(keyword.target, ConditionTarget::Keyword);
        assert!(!keyword.negate);

        let field = parse_condition("attr.ns=shop.orders", false, true);
        assert_eq!(field.target, ConditionTarget::Field("attr.ns".into()));
        assert_eq!(field.value, "shop.orders");
        assert!(field.case_sensitive);

        let negated = parse_condition("!c=COMMAND", true, false);
        assert_eq!(negated.target, ConditionTarget::Field("c".into()));
        assert!(negated.negate);
        assert!(negated.regex);

        // `=value` with no field name is a keyword, not an empty path.
        let odd = parse_condition("=value", false, false);
        assert_eq!(odd.target, ConditionTarget::Keyword);
    }
}
