//! Chunk production workers: read file content, sniff binaries, chunk
//! text, and feed the dispatcher.
//!
//! Several workers drain a shared receiver in parallel (the work is
//! I/O-bound); a done aggregator forwards a single `Done` downstream once
//! every worker has finished. Workers yield under memory pressure before
//! touching each file.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use ziri_core::repository::RepositoryId;

use super::message::{DispatchMessage, SourceFile, WriterMessage};
use crate::chunker::Chunker;
use crate::memory::MemoryMonitor;
use crate::progress::SkipReason;
use crate::reader::{FileContent, read_text};

/// Tracks "done" signals across a worker pool.
#[derive(Debug)]
pub struct DoneTracker {
  expected: usize,
  received: usize,
}

impl DoneTracker {
  pub fn new(worker_count: usize) -> Self {
    Self {
      expected: worker_count,
      received: 0,
    }
  }

  /// Record one done signal. Returns true when it was the last.
  pub fn record_done(&mut self) -> bool {
    self.received += 1;
    self.received >= self.expected
  }
}

/// One chunk-production worker.
#[allow(clippy::too_many_arguments)]
pub async fn chunk_worker(
  worker_id: usize,
  rx: Arc<Mutex<mpsc::Receiver<SourceFile>>>,
  dispatch_tx: mpsc::Sender<DispatchMessage>,
  writer_tx: mpsc::Sender<WriterMessage>,
  done_tx: mpsc::Sender<()>,
  chunker: Chunker,
  monitor: MemoryMonitor,
  repository_id: RepositoryId,
  cancel: CancellationToken,
) {
  trace!(worker_id, "chunk worker starting");
  let mut processed = 0usize;

  loop {
    let msg = {
      let mut rx_guard = rx.lock().await;
      tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          trace!(worker_id, processed, "chunk worker cancelled");
          break;
        }
        msg = rx_guard.recv() => msg,
      }
    };

    let Some(SourceFile::File { info, entry }) = msg else {
      trace!(worker_id, processed, "chunk worker: input exhausted");
      break;
    };

    // Backpressure gate: no new production while memory is critical
    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      _ = monitor.wait_until_clear() => {}
    }

    let relative = info.relative_path.clone();
    match read_text(&info.absolute_path, info.size).await {
      Ok(FileContent::Text(content)) => {
        let chunks = chunker.chunk(&content, &info.absolute_path, &relative, &repository_id);
        trace!(worker_id, path = %relative, chunks = chunks.len(), "file chunked");

        // FileStart must enter the writer queue before the dispatcher can
        // emit any of this file's embedded chunks
        let start = WriterMessage::FileStart {
          relative_path: relative,
          entry,
          expected_chunks: chunks.len(),
        };
        if writer_tx.send(start).await.is_err() {
          break;
        }
        if !chunks.is_empty() && dispatch_tx.send(DispatchMessage::Chunks(chunks)).await.is_err() {
          break;
        }
        processed += 1;
      }
      Ok(FileContent::Binary) => {
        let msg = WriterMessage::FileSkipped {
          relative_path: relative,
          reason: SkipReason::Binary,
        };
        if writer_tx.send(msg).await.is_err() {
          break;
        }
      }
      Err(e) => {
        warn!(worker_id, path = %relative, error = %e, "failed to read file, skipping");
        let msg = WriterMessage::FileSkipped {
          relative_path: relative,
          reason: SkipReason::ReadError,
        };
        if writer_tx.send(msg).await.is_err() {
          break;
        }
      }
    }
  }

  let _ = done_tx.send(()).await;
  trace!(worker_id, processed, "chunk worker finished");
}

/// Waits for every chunk worker, then signals both downstream stages.
pub async fn chunking_done_aggregator(
  worker_count: usize,
  mut done_rx: mpsc::Receiver<()>,
  dispatch_tx: mpsc::Sender<DispatchMessage>,
  writer_tx: mpsc::Sender<WriterMessage>,
) {
  let mut tracker = DoneTracker::new(worker_count);

  while let Some(()) = done_rx.recv().await {
    if tracker.record_done() {
      let _ = dispatch_tx.send(DispatchMessage::Done).await;
      let _ = writer_tx.send(WriterMessage::ProducerDone).await;
      debug!(worker_count, "all chunk workers finished");
      break;
    }
  }
}

/// Feeds classified files into the worker pool, checking cancellation
/// before each send.
pub async fn source_stage(
  files: Vec<(crate::walker::FileInfo, store::FileHashEntry)>,
  tx: mpsc::Sender<SourceFile>,
  cancel: CancellationToken,
) {
  let total = files.len();
  debug!(total, "source stage starting");

  for (i, (info, entry)) in files.into_iter().enumerate() {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        debug!(sent = i, total, "source stage cancelled");
        break;
      }
      result = tx.send(SourceFile::File { info, entry }) => {
        if result.is_err() {
          debug!(sent = i, "source stage: downstream closed");
          break;
        }
      }
    }
  }

  let _ = tx.send(SourceFile::Done).await;
  debug!(total, "source stage complete");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_done_tracker() {
    let mut tracker = DoneTracker::new(3);
    assert!(!tracker.record_done());
    assert!(!tracker.record_done());
    assert!(tracker.record_done());
  }
}
