//! moglot-core — MongoDB server-log analytics library.
//!
//! Provides:
//! - `ingest` — line classification, chunked/parallel file parsing, bulk sessions
//! - `storage` — embedded SQLite backend, bulk-load tuning, background index builds
//! - `analysis` — query-pattern aggregation and index suggestions
//! - `search` — keyword/field search over raw log lines (in-memory, ephemeral, streaming)
//! - `models` — typed records extracted from log lines
//! - `cache` — TTL-bounded result cache for expensive aggregates
//! - `util` — timestamp parsing helpers
//! - `fmt` — shared formatting helpers (bytes, counts)
//!
//! The entry point is [`Analyzer`]: one handle per dataset, owning the
//! database connection, the raw-line buffers and the parsing summary.

pub mod analysis;
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod error;
pub mod fmt;
pub mod ingest;
pub mod models;
pub mod search;
pub mod storage;
pub mod util;

pub use analyzer::Analyzer;
pub use config::AnalyzerConfig;
pub use error::{MoglotError, Result};
