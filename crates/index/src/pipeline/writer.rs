//! Writer stage: the only component that mutates the repository store
//! during a run.
//!
//! Accumulates each file's embedded chunks across batches. Only once every
//! expected chunk has arrived does it persist the chunks and vectors and
//! update the file's hash entry: a file is either fully indexed with a
//! matching hash, or reported failed with its old hash intact so the next
//! run retries it.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use store::{CheckpointManager, FileHashEntry, FileHashMap, RepositoryStore, StoreError};
use ziri_core::repository::RepositoryId;

use super::message::WriterMessage;
use crate::progress::{FileFailure, FileOutcome, FileResult, IndexStats, SinkHandle};

struct FileAccumulator {
  entry: FileHashEntry,
  expected: usize,
  chunks: Vec<(store::ChunkDescriptor, Vec<f32>)>,
  failed: Option<String>,
}

/// The final hash map, run statistics, and failure list the writer hands
/// back.
#[derive(Debug)]
pub struct WriterOutcome {
  pub hashes: FileHashMap,
  pub stats: IndexStats,
  pub failures: Vec<FileFailure>,
}

#[allow(clippy::too_many_arguments)]
pub async fn writer_stage(
  mut rx: mpsc::Receiver<WriterMessage>,
  store: RepositoryStore,
  repository_id: RepositoryId,
  provider_name: String,
  base_hashes: FileHashMap,
  mut checkpoint: CheckpointManager,
  sink: SinkHandle,
  cancel: CancellationToken,
) -> Result<(WriterOutcome, CheckpointManager), StoreError> {
  debug!("writer stage starting");

  let mut files: HashMap<String, FileAccumulator> = HashMap::new();
  let mut outcome = WriterOutcome {
    hashes: base_hashes,
    stats: IndexStats::default(),
    failures: Vec::new(),
  };

  let mut producer_done = false;
  let mut dispatcher_done = false;

  while let Some(msg) = rx.recv().await {
    match msg {
      WriterMessage::FileStart {
        relative_path,
        entry,
        expected_chunks,
      } => {
        if expected_chunks == 0 {
          // Whitespace-only text file: tracked, nothing to embed
          complete_file(
            &store,
            &repository_id,
            &provider_name,
            &relative_path,
            FileAccumulator {
              entry,
              expected: 0,
              chunks: Vec::new(),
              failed: None,
            },
            &mut outcome,
            &mut checkpoint,
            &sink,
          )?;
        } else {
          files.insert(
            relative_path,
            FileAccumulator {
              entry,
              expected: expected_chunks,
              chunks: Vec::new(),
              failed: None,
            },
          );
        }
      }

      WriterMessage::FileSkipped { relative_path, reason } => {
        outcome.stats.files_skipped += 1;
        sink.file(&FileOutcome {
          relative_path,
          result: FileResult::Skipped { reason },
        });
      }

      WriterMessage::Embedded { chunks, report } => {
        outcome.stats.batches_completed += 1;
        outcome.stats.retries += report.retries as usize;

        let mut touched: Vec<String> = Vec::new();
        for (descriptor, vector) in chunks {
          let rel = descriptor.relative_path.clone();
          if let Some(acc) = files.get_mut(&rel) {
            acc.chunks.push((descriptor, vector));
            if !touched.contains(&rel) {
              touched.push(rel);
            }
          } else {
            // Its file already failed in an earlier batch; discard
            trace!(path = %rel, "vector for failed or unknown file discarded");
          }
        }

        for rel in touched {
          if files.get(&rel).is_some_and(|acc| acc.chunks.len() >= acc.expected) {
            let acc = files.remove(&rel).expect("accumulator present");
            complete_file(
              &store,
              &repository_id,
              &provider_name,
              &rel,
              acc,
              &mut outcome,
              &mut checkpoint,
              &sink,
            )?;
          }
        }
      }

      WriterMessage::BatchFailed {
        relative_paths,
        error,
        retries,
      } => {
        outcome.stats.batches_failed += 1;
        outcome.stats.retries += retries as usize;

        for rel in relative_paths {
          if let Some(mut acc) = files.remove(&rel) {
            acc.failed = Some(error.clone());
            fail_file(&rel, &acc, &mut outcome, &sink);
          }
        }
      }

      WriterMessage::ChunkDropped {
        relative_path,
        chunk_id,
      } => {
        warn!(path = %relative_path, chunk_id = %chunk_id, "oversized chunk dropped from file");
        let now_complete = match files.get_mut(&relative_path) {
          Some(acc) => {
            acc.expected = acc.expected.saturating_sub(1);
            acc.chunks.len() >= acc.expected
          }
          None => false,
        };
        if now_complete {
          let acc = files.remove(&relative_path).expect("accumulator present");
          complete_file(
            &store,
            &repository_id,
            &provider_name,
            &relative_path,
            acc,
            &mut outcome,
            &mut checkpoint,
            &sink,
          )?;
        }
      }

      WriterMessage::ProducerDone => {
        producer_done = true;
        if dispatcher_done {
          break;
        }
      }

      WriterMessage::DispatcherDone => {
        dispatcher_done = true;
        if producer_done {
          break;
        }
      }
    }
  }

  // Files announced but never completed: cancelled work is simply not
  // processed; anything else lost its batch and counts as failed
  let leftovers: Vec<(String, FileAccumulator)> = files.drain().collect();
  for (rel, acc) in leftovers {
    if cancel.is_cancelled() {
      trace!(path = %rel, "file unprocessed due to cancellation");
    } else {
      fail_file(&rel, &acc, &mut outcome, &sink);
    }
  }

  debug!(
    processed = outcome.stats.files_processed,
    skipped = outcome.stats.files_skipped,
    failed = outcome.stats.files_failed,
    chunks = outcome.stats.chunks_embedded,
    "writer stage complete"
  );

  Ok((outcome, checkpoint))
}

/// Persist a completed file and update its hash entry. The hash entry is
/// only touched after every chunk and vector is on disk.
#[allow(clippy::too_many_arguments)]
fn complete_file(
  store: &RepositoryStore,
  repository_id: &RepositoryId,
  provider_name: &str,
  relative_path: &str,
  acc: FileAccumulator,
  outcome: &mut WriterOutcome,
  checkpoint: &mut CheckpointManager,
  sink: &SinkHandle,
) -> Result<(), StoreError> {
  let chunk_count = acc.chunks.len();

  // Replace any previous generation of this file's chunks
  store.delete_chunks_for_path(repository_id, relative_path)?;
  if !acc.chunks.is_empty() {
    store.put_chunks(repository_id, relative_path, &acc.chunks, provider_name)?;
  }

  outcome.hashes.insert(relative_path.to_string(), acc.entry);
  outcome.stats.files_processed += 1;
  outcome.stats.chunks_embedded += chunk_count;

  let flushed = checkpoint.record_file(relative_path, chunk_count)?;
  if flushed {
    // Keep the persisted hash map aligned with the checkpoint so a
    // resumed run can trust both
    store.write_hashes(repository_id, &outcome.hashes)?;
  }

  sink.file(&FileOutcome {
    relative_path: relative_path.to_string(),
    result: FileResult::Indexed { chunks: chunk_count },
  });
  trace!(path = relative_path, chunks = chunk_count, "file completed");
  Ok(())
}

fn fail_file(relative_path: &str, acc: &FileAccumulator, outcome: &mut WriterOutcome, sink: &SinkHandle) {
  let detail = acc
    .failed
    .clone()
    .unwrap_or_else(|| "embedding incomplete at end of run".to_string());

  outcome.stats.files_failed += 1;
  let failure = FileFailure {
    relative_path: relative_path.to_string(),
    kind: "provider".to_string(),
    detail: detail.clone(),
  };
  outcome.failures.push(failure.clone());
  sink.error(&failure);
  sink.file(&FileOutcome {
    relative_path: relative_path.to_string(),
    result: FileResult::Failed { error: detail },
  });
}
