//! Per-file ingestion strategies.
//!
//! Strategy is picked from file size: small files are read in one
//! direct pass (optionally retaining raw lines for in-memory search),
//! mid-sized files stream in fixed line chunks with per-chunk stats,
//! and large files are split into byte ranges handled by parallel
//! workers. All three feed extracted records to a [`RecordSink`] in
//! size-bounded batches and produce identical summaries for identical
//! input.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::Result;
use crate::config::AnalyzerConfig;
use crate::models::{AccessSample, FileSummary, LogRecord};

use super::chunk::{ChunkOutput, plan_chunks, process_chunk};
use super::classify::Classifier;

/// Destination for extracted record batches.
pub trait RecordSink {
    fn write_batch(&mut self, records: Vec<LogRecord>) -> Result<()>;
}

/// Below this size a file is read in one direct pass.
const STREAMING_THRESHOLD: u64 = 100 * 1024 * 1024;
/// Above this size chunks are handed to parallel workers.
const PARALLEL_THRESHOLD: u64 = 1024 * 1024 * 1024;
/// Lines per streaming chunk.
const STREAM_CHUNK_LINES: u64 = 50_000;

/// Result of ingesting one file.
#[derive(Debug, Default)]
pub struct FileIngestReport {
    pub summary: FileSummary,
    pub access: Vec<AccessSample>,
    /// Raw lines retained for in-memory search. Only the direct
    /// strategy keeps them; large files fall back to re-reading.
    pub lines: Option<Vec<String>>,
}

/// Drives ingestion of log files for one session.
pub struct FileIngest<'a> {
    classifier: Classifier,
    config: &'a AnalyzerConfig,
}

impl<'a> FileIngest<'a> {
    pub fn new(config: &'a AnalyzerConfig) -> Self {
        Self {
            classifier: Classifier::new(config.slow_query_threshold_ms),
            config,
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Ingest one file, flushing record batches into `sink`. A file
    /// that cannot be opened or read yields whatever was parsed before
    /// the failure, with `io_errors` noted in the summary; only storage
    /// failures return `Err`.
    pub fn ingest(&self, path: &Path, sink: &mut dyn RecordSink) -> Result<FileIngestReport> {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(error) => {
                warn!(file = %path.display(), %error, "source unreadable, skipping");
                return Ok(unreadable_source_report());
            }
        };
        let size = meta.len();
        let batch_size = self.config.batch_size_for(size);
        let label = path.display().to_string();
        let started = Instant::now();

        let report = if size > PARALLEL_THRESHOLD && self.config.workers > 1 {
            info!(
                file = %label,
                size,
                workers = self.config.workers,
                "ingesting with parallel chunk workers"
            );
            self.ingest_parallel(path, &label, batch_size, sink)?
        } else if size >= STREAMING_THRESHOLD {
            info!(file = %label, size, "ingesting with chunked streaming");
            self.ingest_streaming(path, &label, batch_size, sink)?
        } else {
            debug!(file = %label, size, "ingesting directly");
            self.ingest_direct(path, &label, batch_size, sink)?
        };

        info!(
            file = %label,
            lines = report.summary.total_lines,
            slow_queries = report.summary.slow_query_events,
            connections = report.summary.connection_events,
            authentications = report.summary.auth_events,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "file ingested"
        );
        Ok(report)
    }

    fn ingest_direct(
        &self,
        path: &Path,
        label: &str,
        batch_size: usize,
        sink: &mut dyn RecordSink,
    ) -> Result<FileIngestReport> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) => {
                warn!(file = %label, %error, "source unreadable, skipping");
                return Ok(unreadable_source_report());
            }
        };
        let reader = BufReader::with_capacity(1 << 20, file);
        let mut out = ChunkOutput::default();
        let mut lines = self.config.store_raw_lines.then(Vec::new);
        let mut line_number = 0u64;

        for raw in reader.split(b'\n') {
            let bytes = match raw {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(file = %label, line = line_number + 1, %error, "read error, file truncated");
                    out.summary.io_errors += 1;
                    break;
                }
            };
            line_number += 1;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            out.absorb_line(&self.classifier, &text, label, line_number);
            if let Some(buf) = lines.as_mut() {
                buf.push(text);
            }
            if out.records.len() >= batch_size {
                sink.write_batch(std::mem::take(&mut out.records))?;
            }
        }
        flush(sink, &mut out.records)?;
        Ok(FileIngestReport {
            summary: out.summary,
            access: out.access,
            lines,
        })
    }

    fn ingest_streaming(
        &self,
        path: &Path,
        label: &str,
        batch_size: usize,
        sink: &mut dyn RecordSink,
    ) -> Result<FileIngestReport> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) => {
                warn!(file = %label, %error, "source unreadable, skipping");
                return Ok(unreadable_source_report());
            }
        };
        let reader = BufReader::with_capacity(1 << 20, file);
        let mut out = ChunkOutput::default();
        let mut stats = ChunkStats::default();
        let mut chunk_index = 0u64;
        let mut line_number = 0u64;

        for raw in reader.split(b'\n') {
            let bytes = match raw {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(file = %label, line = line_number + 1, %error, "read error, file truncated");
                    out.summary.io_errors += 1;
                    break;
                }
            };
            line_number += 1;
            let text = String::from_utf8_lossy(&bytes);
            let before = out.records.len();
            out.absorb_line(&self.classifier, &text, label, line_number);
            if out.records.len() > before {
                stats.note(&out.records[before..]);
            }
            if out.records.len() >= batch_size {
                sink.write_batch(std::mem::take(&mut out.records))?;
            }
            if line_number % STREAM_CHUNK_LINES == 0 {
                chunk_index += 1;
                stats.log_and_reset(label, chunk_index);
            }
        }
        flush(sink, &mut out.records)?;
        stats.log_and_reset(label, chunk_index + 1);
        Ok(FileIngestReport {
            summary: out.summary,
            access: out.access,
            lines: None,
        })
    }

    fn ingest_parallel(
        &self,
        path: &Path,
        label: &str,
        batch_size: usize,
        sink: &mut dyn RecordSink,
    ) -> Result<FileIngestReport> {
        let chunks = match plan_chunks(path, self.config.workers) {
            Ok(chunks) => chunks,
            Err(error) => {
                warn!(file = %label, %error, "chunk planning failed, skipping file");
                return Ok(unreadable_source_report());
            }
        };
        if chunks.is_empty() {
            return Ok(FileIngestReport::default());
        }

        let mut summary = FileSummary::default();
        let mut access = Vec::new();
        let classifier = &self.classifier;

        thread::scope(|scope| -> Result<()> {
            let (tx, rx) = mpsc::channel::<ChunkOutput>();
            for chunk in chunks {
                let tx = tx.clone();
                scope.spawn(move || {
                    let _ = tx.send(process_chunk(classifier, path, label, chunk));
                });
            }
            drop(tx);

            let mut pending: Vec<LogRecord> = Vec::new();
            for mut part in rx {
                summary.absorb(&part.summary);
                access.append(&mut part.access);
                pending.append(&mut part.records);
                while pending.len() >= batch_size {
                    let rest = pending.split_off(batch_size);
                    sink.write_batch(std::mem::replace(&mut pending, rest))?;
                }
            }
            flush(sink, &mut pending)
        })?;

        Ok(FileIngestReport {
            summary,
            access,
            lines: None,
        })
    }
}

fn unreadable_source_report() -> FileIngestReport {
    FileIngestReport {
        summary: FileSummary {
            io_errors: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn flush(sink: &mut dyn RecordSink, records: &mut Vec<LogRecord>) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    sink.write_batch(std::mem::take(records))
}

/// Per-chunk counters logged by the streaming strategy.
#[derive(Default)]
struct ChunkStats {
    collections: HashMap<String, u64>,
    /// Duration histogram, 100 ms buckets, last bucket open-ended.
    histogram: [u64; 10],
}

impl ChunkStats {
    fn note(&mut self, records: &[LogRecord]) {
        for record in records {
            if let LogRecord::SlowQuery(q) = record {
                *self.collections.entry(q.namespace()).or_default() += 1;
                let bucket = (q.duration_ms / 100).clamp(0, 9) as usize;
                self.histogram[bucket] += 1;
            }
        }
    }

    fn log_and_reset(&mut self, label: &str, chunk_index: u64) {
        if self.collections.is_empty() {
            return;
        }
        let mut top: Vec<(&String, &u64)> = self.collections.iter().collect();
        top.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top = top
            .iter()
            .take(5)
            .map(|(ns, n)| format!("{}={}", ns, n))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(
            file = %label,
            chunk = chunk_index,
            top_collections = %top,
            duration_histogram = ?self.histogram,
            "chunk statistics"
        );
        self.collections.clear();
        self.histogram = [0; 10];
    }
}
