//! Byte-range chunk planning for parallel ingestion.
//!
//! A file is split into one byte range per worker. Every non-final
//! range end is advanced to the next newline so no line straddles two
//! chunks, and each chunk carries the 1-based line number of its first
//! line (from a single newline-counting pre-pass) so records keep
//! correct positions regardless of which worker parsed them.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::warn;

use crate::Result;
use crate::models::{AccessSample, FileSummary, LogRecord};

use super::classify::Classifier;

/// One worker's byte range: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
    /// 1-based line number at `start`.
    pub first_line: u64,
}

/// Everything one chunk produced. Merged commutatively; only the record
/// vectors carry order, and that order is within a single chunk.
#[derive(Debug, Default)]
pub struct ChunkOutput {
    pub records: Vec<LogRecord>,
    pub access: Vec<AccessSample>,
    pub summary: FileSummary,
}

impl ChunkOutput {
    pub fn absorb_line(&mut self, classifier: &Classifier, line: &str, file_path: &str, line_number: u64) {
        self.summary.total_lines += 1;
        let out = classifier.classify(line, file_path, line_number);
        if out.structured {
            self.summary.json_lines += 1;
        } else if !line.trim().is_empty() {
            self.summary.text_lines += 1;
        }
        if out.decode_error {
            self.summary.error_lines += 1;
        }
        if let Some(sample) = out.access {
            self.access.push(sample);
        }
        if let Some(record) = out.record {
            match &record {
                LogRecord::SlowQuery(_) => self.summary.slow_query_events += 1,
                LogRecord::Connection(_) => self.summary.connection_events += 1,
                LogRecord::Authentication(_) => self.summary.auth_events += 1,
            }
            self.records.push(record);
        }
    }
}

/// Plan `workers` chunks over `path`. Returns an empty plan for an
/// empty file and a single chunk when the file is too small to split.
pub fn plan_chunks(path: &Path, workers: usize) -> Result<Vec<Chunk>> {
    let size = std::fs::metadata(path)?.len();
    if size == 0 {
        return Ok(Vec::new());
    }
    let workers = workers.max(1) as u64;
    let step = size / workers;
    if workers == 1 || step == 0 {
        return Ok(vec![Chunk {
            start: 0,
            end: size,
            first_line: 1,
        }]);
    }

    let mut file = File::open(path)?;
    let mut bounds = vec![0u64];
    for i in 1..workers {
        let adjusted = next_line_start(&mut file, i * step, size)?;
        // Newline adjustment can push a boundary past the next raw
        // split point; keep bounds monotonic and drop empty ranges.
        if adjusted > *bounds.last().unwrap_or(&0) && adjusted < size {
            bounds.push(adjusted);
        }
    }
    bounds.push(size);

    let starts = &bounds[..bounds.len() - 1];
    let newline_counts = newline_counts_at(path, starts)?;

    Ok(bounds
        .windows(2)
        .zip(newline_counts)
        .map(|(w, newlines)| Chunk {
            start: w[0],
            end: w[1],
            first_line: newlines + 1,
        })
        .collect())
}

/// Read the chunk's byte range and classify every line in it. A chunk
/// whose file cannot be re-opened, or that hits a read error partway,
/// keeps what it parsed and notes the failure in `summary.io_errors`;
/// the other chunks of the file are unaffected.
pub fn process_chunk(
    classifier: &Classifier,
    path: &Path,
    file_label: &str,
    chunk: Chunk,
) -> ChunkOutput {
    let mut out = ChunkOutput::default();
    let file = match File::open(path).and_then(|mut file| {
        file.seek(SeekFrom::Start(chunk.start))?;
        Ok(file)
    }) {
        Ok(file) => file,
        Err(error) => {
            warn!(file = %file_label, chunk.start, chunk.end, %error, "chunk unreadable, skipping");
            out.summary.io_errors = 1;
            return out;
        }
    };
    let reader = BufReader::with_capacity(1 << 20, file.take(chunk.end - chunk.start));

    let mut line_number = chunk.first_line;
    for line in reader.split(b'\n') {
        let bytes = match line {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(file = %file_label, line = line_number, %error, "read error, chunk truncated");
                out.summary.io_errors += 1;
                break;
            }
        };
        // Server logs are ASCII-mostly; a rare invalid sequence must
        // not abort the whole chunk.
        let text = String::from_utf8_lossy(&bytes);
        out.absorb_line(classifier, &text, file_label, line_number);
        line_number += 1;
    }
    out
}

/// Position of the first byte after the next `\n` at or past `from`,
/// or `size` when the tail has no newline.
fn next_line_start(file: &mut File, from: u64, size: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(from))?;
    let mut buf = [0u8; 8192];
    let mut pos = from;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(size);
        }
        if let Some(i) = buf[..n].iter().position(|&b| b == b'\n') {
            return Ok(pos + i as u64 + 1);
        }
        pos += n as u64;
    }
}

/// Newlines strictly before each offset, in one sequential pass.
/// `offsets` must be ascending.
fn newline_counts_at(path: &Path, offsets: &[u64]) -> Result<Vec<u64>> {
    let mut out = Vec::with_capacity(offsets.len());
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; 256 * 1024];
    let mut pos = 0u64;
    let mut count = 0u64;
    let mut idx = 0;

    while idx < offsets.len() {
        while idx < offsets.len() && offsets[idx] <= pos {
            out.push(count);
            idx += 1;
        }
        if idx >= offsets.len() {
            break;
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            while idx < offsets.len() {
                out.push(count);
                idx += 1;
            }
            break;
        }
        let block_start = pos;
        let block_end = pos + n as u64;
        let mut cursor = 0usize;
        while idx < offsets.len() && offsets[idx] <= block_end {
            let upto = (offsets[idx] - block_start) as usize;
            count += count_newlines(&buf[cursor..upto]);
            cursor = upto;
            out.push(count);
            idx += 1;
        }
        count += count_newlines(&buf[cursor..n]);
        pos = block_end;
    }
    Ok(out)
}

fn count_newlines(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|&&b| b == b'\n').count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_lines(lines: &[&str]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        let f = NamedTempFile::new().unwrap();
        assert!(plan_chunks(f.path(), 4).unwrap().is_empty());
    }

    #[test]
    fn test_single_worker_single_chunk() {
        let f = write_lines(&["a", "b", "c"]);
        let chunks = plan_chunks(f.path(), 1).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].first_line, 1);
    }

    #[test]
    fn test_chunks_cover_file_and_split_on_newlines() {
        let lines: Vec<String> = (0..100).map(|i| format!("line number {:04}", i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let f = write_lines(&refs);
        let size = std::fs::metadata(f.path()).unwrap().len();

        let chunks = plan_chunks(f.path(), 4).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, size);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }

        // Every non-first chunk starts right after a newline.
        let data = std::fs::read(f.path()).unwrap();
        for c in &chunks[1..] {
            assert_eq!(data[c.start as usize - 1], b'\n');
        }
    }

    #[test]
    fn test_first_line_numbers_are_exact() {
        let lines: Vec<String> = (1..=200).map(|i| format!("row {}", i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let f = write_lines(&refs);
        let data = std::fs::read(f.path()).unwrap();

        for c in &plan_chunks(f.path(), 8).unwrap() {
            let expected =
                data[..c.start as usize].iter().filter(|&&b| b == b'\n').count() as u64 + 1;
            assert_eq!(c.first_line, expected);
        }
    }

    #[test]
    fn test_tiny_file_collapses_to_one_chunk() {
        let f = write_lines(&["ab"]);
        let chunks = plan_chunks(f.path(), 8).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_process_chunk_keeps_line_numbers() {
        let slow = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"COMMAND","ctx":"conn1","msg":"Slow query","attr":{"ns":"a.b","command":{"find":"b"},"durationMillis":300}}"#;
        let f = write_lines(&["noise", "noise", slow, "noise"]);
        let size = std::fs::metadata(f.path()).unwrap().len();
        let classifier = Classifier::new(100);

        let out = process_chunk(
            &classifier,
            f.path(),
            "test.log",
            Chunk {
                start: 0,
                end: size,
                first_line: 1,
            },
        );
        assert_eq!(out.summary.total_lines, 4);
        assert_eq!(out.summary.slow_query_events, 1);
        let LogRecord::SlowQuery(q) = &out.records[0] else {
            panic!("expected slow query");
        };
        assert_eq!(q.line_number, 3);
    }

    #[test]
    fn test_chunked_parse_equals_whole_parse() {
        let slow = r#"{"t":{"$date":"2024-01-15T14:30:00Z"},"c":"COMMAND","ctx":"conn1","msg":"Slow query","attr":{"ns":"a.b","command":{"find":"b"},"durationMillis":300}}"#;
        let mut lines = Vec::new();
        for i in 0..50 {
            lines.push(format!("filler {}", i));
            if i % 7 == 0 {
                lines.push(slow.to_string());
            }
        }
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let f = write_lines(&refs);
        let size = std::fs::metadata(f.path()).unwrap().len();
        let classifier = Classifier::new(100);

        let whole = process_chunk(
            &classifier,
            f.path(),
            "t",
            Chunk {
                start: 0,
                end: size,
                first_line: 1,
            },
        );

        let mut merged = FileSummary::default();
        let mut merged_records = 0;
        for c in plan_chunks(f.path(), 5).unwrap() {
            let part = process_chunk(&classifier, f.path(), "t", c);
            merged.absorb(&part.summary);
            merged_records += part.records.len();
        }
        assert_eq!(merged, whole.summary);
        assert_eq!(merged_records, whole.records.len());
    }

    #[test]
    fn test_unreadable_chunk_yields_empty_output_with_error_noted() {
        let classifier = Classifier::new(100);
        let out = process_chunk(
            &classifier,
            Path::new("/no/such/chunked.log"),
            "chunked.log",
            Chunk {
                start: 0,
                end: 1024,
                first_line: 1,
            },
        );
        assert_eq!(out.summary.io_errors, 1);
        assert_eq!(out.summary.total_lines, 0);
        assert!(out.records.is_empty());

        // A failed chunk merges like any other and never poisons the
        // rest of the file.
        let mut merged = FileSummary {
            total_lines: 10,
            slow_query_events: 2,
            ..Default::default()
        };
        merged.absorb(&out.summary);
        assert_eq!(merged.total_lines, 10);
        assert_eq!(merged.io_errors, 1);
    }
}
