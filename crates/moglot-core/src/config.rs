//! Analyzer configuration.
//!
//! All tunables the core honors live here as plain values; the CLI maps
//! its flags onto one [`AnalyzerConfig`]. Defaults match the behavior the
//! analyzer ships with: 4 ingest workers, 100 ms slow-query threshold,
//! 200 MB ephemeral-search ceiling, 5 minute cache TTL.

use std::time::Duration;

/// How streaming search reports its total match count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TotalCountPolicy {
    /// Scan every line and report an exact total, even past the result limit.
    #[default]
    Exact,
    /// For pure-keyword condition sets, stop scanning once the result
    /// limit is filled and report the total as a lower bound
    /// (`exact = false` on the outcome). Field and date conditions
    /// always force a full scan.
    FirstPageOnly,
}

/// Tunables for one analyzer instance.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Worker threads for large-file byte-range ingestion.
    pub workers: usize,
    /// Duration above which a command is recorded as a slow query (ms).
    pub slow_query_threshold_ms: i64,
    /// Lower bound for the dynamically chosen insert batch size.
    pub min_batch_size: usize,
    /// Upper bound for the dynamically chosen insert batch size.
    pub max_batch_size: usize,
    /// Keep raw lines in memory for in-memory search and line retrieval.
    pub store_raw_lines: bool,
    /// Aggregate source size below which ephemeral search may load
    /// whole files into memory (bytes).
    pub ephemeral_search_limit: u64,
    /// Total-count behavior for streaming search.
    pub total_count_policy: TotalCountPolicy,
    /// Result cache entry lifetime.
    pub cache_ttl: Duration,
    /// Result cache capacity (entries).
    pub cache_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            slow_query_threshold_ms: 100,
            min_batch_size: 1_000,
            max_batch_size: 50_000,
            store_raw_lines: true,
            ephemeral_search_limit: 200 * 1024 * 1024,
            total_count_policy: TotalCountPolicy::Exact,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 100,
        }
    }
}

impl AnalyzerConfig {
    /// Insert batch size for a file of `file_size` bytes, clamped to the
    /// configured bounds. Larger files get larger batches to cut
    /// per-statement overhead.
    pub fn batch_size_for(&self, file_size: u64) -> usize {
        const GB: u64 = 1024 * 1024 * 1024;
        const MB: u64 = 1024 * 1024;
        let chosen = if file_size > GB {
            50_000
        } else if file_size > 100 * MB {
            10_000
        } else if file_size > 10 * MB {
            5_000
        } else {
            1_000
        };
        chosen.clamp(self.min_batch_size, self.max_batch_size)
    }
}
