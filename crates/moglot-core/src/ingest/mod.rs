//! Log file ingestion: line classification, chunk planning, and
//! size-based strategy selection.

mod chunk;
mod classify;
mod session;

pub use chunk::{Chunk, ChunkOutput, plan_chunks, process_chunk};
pub use classify::{Classified, Classifier};
pub use session::{FileIngest, FileIngestReport, RecordSink};
