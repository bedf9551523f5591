//! Message types flowing between pipeline stages.
//!
//! Each stage pair is connected by a bounded channel; `Done` variants and
//! the two terminal writer markers propagate shutdown through the graph.

use store::{ChunkDescriptor, FileHashEntry};

use crate::progress::{BatchReport, SkipReason};
use crate::walker::FileInfo;

/// Classification output feeding the chunking workers.
#[derive(Debug)]
pub enum SourceFile {
  File {
    info: FileInfo,
    /// Fresh hash entry computed during classification; becomes the
    /// stored entry once every chunk of the file is persisted.
    entry: FileHashEntry,
  },
  Done,
}

/// Chunking workers -> dispatcher.
#[derive(Debug)]
pub enum DispatchMessage {
  Chunks(Vec<ChunkDescriptor>),
  Done,
}

/// Everything the writer consumes, from both the chunking workers and the
/// dispatcher. FIFO on the single writer channel guarantees a file's
/// `FileStart` precedes any of its embedded chunks.
#[derive(Debug)]
pub enum WriterMessage {
  /// A file entered the embedding stage.
  FileStart {
    relative_path: String,
    entry: FileHashEntry,
    expected_chunks: usize,
  },
  /// A file skipped before chunking (binary, unreadable).
  FileSkipped {
    relative_path: String,
    reason: SkipReason,
  },
  /// One successful batch; chunks may belong to several files.
  Embedded {
    chunks: Vec<(ChunkDescriptor, Vec<f32>)>,
    report: BatchReport,
  },
  /// A batch failed permanently. The named files must not have their
  /// hash entries updated this run.
  BatchFailed {
    relative_paths: Vec<String>,
    error: String,
    retries: u32,
  },
  /// A chunk was dropped because it exceeds the provider token budget.
  ChunkDropped {
    relative_path: String,
    chunk_id: String,
  },
  /// No further FileStart/FileSkipped will arrive.
  ProducerDone,
  /// No further Embedded/BatchFailed will arrive.
  DispatcherDone,
}
