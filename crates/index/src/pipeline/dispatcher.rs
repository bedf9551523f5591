//! Dispatcher: forms batches and keeps up to `concurrency` of them in
//! flight against the provider.
//!
//! Fired batches run in spawned tasks (rate-limited, with retry) and
//! report back over a result channel; the dispatcher pairs results with
//! the pending batch, feeds observed round-trips to the adaptive batcher,
//! and forwards outcomes to the writer.
//!
//! A failed batch does not abort the pipeline: its files are reported
//! failed and other in-flight batches proceed. Authentication and
//! unknown-model failures are the exception: every subsequent batch
//! would fail identically, so they cancel the run and surface to the
//! caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use embedding::{EmbeddingError, EmbeddingProvider, RateLimiter};
use store::ChunkDescriptor;

use super::message::{DispatchMessage, WriterMessage};
use super::retry::{EmbedOutcome, RetryPolicy, embed_with_retry};
use crate::batcher::AdaptiveBatcher;
use crate::progress::{BatchReport, SinkHandle};

/// Errors that make every future batch pointless.
fn is_fatal(error: &EmbeddingError) -> bool {
  matches!(
    error,
    EmbeddingError::Auth(_) | EmbeddingError::NoApiKey | EmbeddingError::InvalidModel(_)
  )
}

type BatchResult = (u64, Vec<ChunkDescriptor>, Result<EmbedOutcome, EmbeddingError>);

#[derive(Debug, Default)]
pub struct DispatcherStats {
  pub batches_fired: u64,
  /// Set when the run was aborted by a fatal provider error.
  pub fatal: Option<EmbeddingError>,
}

#[allow(clippy::too_many_arguments)]
pub async fn dispatcher_stage(
  mut rx: mpsc::Receiver<DispatchMessage>,
  writer_tx: mpsc::Sender<WriterMessage>,
  provider: Arc<dyn EmbeddingProvider>,
  limiter: Arc<RateLimiter>,
  mut batcher: AdaptiveBatcher,
  policy: RetryPolicy,
  max_tokens_per_request: usize,
  sink: SinkHandle,
  cancel: CancellationToken,
) -> DispatcherStats {
  debug!(
    batch_size = batcher.current_batch_size(),
    concurrency = batcher.concurrency(),
    "dispatcher starting"
  );

  let mut queue: VecDeque<ChunkDescriptor> = VecDeque::new();
  let mut pending: HashMap<u64, ()> = HashMap::new();
  let mut next_batch_id = 0u64;
  let mut input_done = false;
  let mut cancelled = false;
  let mut stats = DispatcherStats::default();

  let (result_tx, mut result_rx) = mpsc::channel::<BatchResult>(16);

  loop {
    // Fire as many batches as the in-flight cap allows
    if stats.fatal.is_none() && !cancelled {
      while pending.len() < batcher.concurrency() {
        let taken = batcher.take_batch(&mut queue, max_tokens_per_request, input_done);
        for chunk in taken.oversized {
          let msg = WriterMessage::ChunkDropped {
            relative_path: chunk.relative_path.clone(),
            chunk_id: chunk.chunk_id,
          };
          let _ = writer_tx.send(msg).await;
        }
        if taken.chunks.is_empty() {
          break;
        }

        let batch_id = next_batch_id;
        next_batch_id += 1;
        stats.batches_fired += 1;
        pending.insert(batch_id, ());
        fire_batch(batch_id, taken.chunks, &provider, &limiter, &policy, &result_tx);
      }
    }

    if pending.is_empty() && (cancelled || stats.fatal.is_some() || (input_done && queue.is_empty())) {
      break;
    }

    tokio::select! {
      biased;

      _ = cancel.cancelled(), if !cancelled => {
        debug!(queued = queue.len(), in_flight = pending.len(), "dispatcher cancelled; draining in-flight batches");
        cancelled = true;
        // Unfired chunks are abandoned; in-flight batches complete
        queue.clear();
      }

      result = result_rx.recv(), if !pending.is_empty() => {
        let Some((batch_id, chunks, outcome)) = result else { break };
        pending.remove(&batch_id);
        handle_batch_result(batch_id, chunks, outcome, &mut batcher, &mut stats, &writer_tx, &sink, &cancel).await;
      }

      msg = rx.recv(), if !input_done && !cancelled && stats.fatal.is_none() => {
        match msg {
          Some(DispatchMessage::Chunks(chunks)) => {
            trace!(count = chunks.len(), queued = queue.len(), "chunks queued for batching");
            queue.extend(chunks);
          }
          Some(DispatchMessage::Done) | None => {
            input_done = true;
          }
        }
      }
    }

  }

  let _ = writer_tx.send(WriterMessage::DispatcherDone).await;
  debug!(batches = stats.batches_fired, "dispatcher complete");
  stats
}

fn fire_batch(
  batch_id: u64,
  chunks: Vec<ChunkDescriptor>,
  provider: &Arc<dyn EmbeddingProvider>,
  limiter: &Arc<RateLimiter>,
  policy: &RetryPolicy,
  result_tx: &mpsc::Sender<BatchResult>,
) {
  let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
  let estimated_tokens: usize = chunks.iter().map(|c| c.estimated_tokens).sum();

  trace!(batch_id, size = chunks.len(), estimated_tokens, "firing batch");

  let provider = provider.clone();
  let limiter = limiter.clone();
  let policy = policy.clone();
  let result_tx = result_tx.clone();
  tokio::spawn(async move {
    let outcome = embed_with_retry(&provider, &limiter, &texts, estimated_tokens, &policy).await;
    let _ = result_tx.send((batch_id, chunks, outcome)).await;
  });
}

#[allow(clippy::too_many_arguments)]
async fn handle_batch_result(
  batch_id: u64,
  chunks: Vec<ChunkDescriptor>,
  outcome: Result<EmbedOutcome, EmbeddingError>,
  batcher: &mut AdaptiveBatcher,
  stats: &mut DispatcherStats,
  writer_tx: &mpsc::Sender<WriterMessage>,
  sink: &SinkHandle,
  cancel: &CancellationToken,
) {
  match outcome {
    Ok(embed) => {
      batcher.record_response_time(embed.response_time);

      let estimated_tokens = chunks.iter().map(|c| c.estimated_tokens).sum();
      let report = BatchReport {
        batch_id,
        size: chunks.len(),
        estimated_tokens,
        response_time: embed.response_time,
        retries: embed.retries,
      };
      sink.batch(&report);

      let paired: Vec<(ChunkDescriptor, Vec<f32>)> = chunks.into_iter().zip(embed.vectors).collect();
      let _ = writer_tx.send(WriterMessage::Embedded { chunks: paired, report }).await;
    }
    Err(error) => {
      let relative_paths: Vec<String> = chunks
        .iter()
        .map(|c| c.relative_path.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

      warn!(batch_id, files = relative_paths.len(), error = %error, "batch failed permanently");

      if is_fatal(&error) && stats.fatal.is_none() {
        warn!(batch_id, error = %error, "fatal provider error, aborting run");
        cancel.cancel();
        stats.fatal = Some(error);
        let msg = WriterMessage::BatchFailed {
          relative_paths,
          error: stats.fatal.as_ref().expect("just set").to_string(),
          retries: 0,
        };
        let _ = writer_tx.send(msg).await;
        return;
      }

      let msg = WriterMessage::BatchFailed {
        relative_paths,
        error: error.to_string(),
        retries: 0,
      };
      let _ = writer_tx.send(msg).await;
    }
  }
}
