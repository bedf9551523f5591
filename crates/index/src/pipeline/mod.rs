//! Streaming embedding pipeline.
//!
//! A bounded producer/consumer graph with backpressure:
//!
//! ```text
//! Source ─► ChunkWorkers ─► Dispatcher ─► Writer
//!   256         64             (N in flight)
//!                 │                          │
//!                 └── MemoryMonitor gate ◄───┘
//! ```
//!
//! Each stage is a spawned task connected by bounded channels; when a
//! downstream stage falls behind, upstream sends block and the whole
//! graph slows down naturally. The writer runs in the calling task and
//! its return ends the run.
//!
//! Cancellation is cooperative: producers stop at their next yield,
//! batches already in flight complete and their results are written, then
//! the stages drain and return.

mod chunking;
mod dispatcher;
pub mod message;
mod retry;
mod writer;

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::retry::{EmbedOutcome, RetryPolicy, embed_with_retry};
pub use self::writer::WriterOutcome;
use self::chunking::{chunk_worker, chunking_done_aggregator, source_stage};
use self::dispatcher::dispatcher_stage;
use self::writer::writer_stage;
use embedding::{EmbeddingError, EmbeddingProvider, RateLimiter};
use store::{CheckpointManager, FileHashEntry, FileHashMap, RepositoryStore, StoreError};
use ziri_core::repository::RepositoryId;

use crate::batcher::{AdaptiveBatcher, BatcherConfig};
use crate::chunker::{Chunker, ChunkerConfig};
use crate::memory::{MemoryConfig, MemoryMonitor, MemoryStats, UsageProbe};
use crate::progress::SinkHandle;
use crate::walker::FileInfo;

const SOURCE_BUFFER: usize = 256;
const DISPATCH_BUFFER: usize = 64;
const WRITER_BUFFER: usize = 128;

/// Chunk production is I/O-plus-hashing work; a small pool scaled to the
/// machine keeps reads overlapped without flooding the dispatcher.
fn chunk_worker_count() -> usize {
  num_cpus::get().clamp(2, 8)
}

/// Everything the pipeline needs beyond its inputs.
pub struct PipelineSettings {
  pub chunker: ChunkerConfig,
  pub batcher: BatcherConfig,
  pub retry: RetryPolicy,
  pub memory: MemoryConfig,
  /// Override for the memory monitor's usage reader; the process RSS
  /// probe when unset.
  pub memory_probe: Option<UsageProbe>,
  pub concurrency: usize,
}

/// Result of one pipeline run.
pub struct PipelineOutcome {
  pub writer: WriterOutcome,
  pub memory: MemoryStats,
  /// Set when a fatal provider error aborted the run.
  pub fatal: Option<EmbeddingError>,
  /// Whether the external caller cancelled the run.
  pub cancelled: bool,
}

/// Run the chunk -> batch -> embed -> persist pipeline over the given
/// files. `base_hashes` is the starting hash map (deleted paths already
/// pruned); the returned outcome carries the updated map.
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
  store: RepositoryStore,
  repository_id: RepositoryId,
  provider: Arc<dyn EmbeddingProvider>,
  files: Vec<(FileInfo, FileHashEntry)>,
  base_hashes: FileHashMap,
  checkpoint: CheckpointManager,
  settings: PipelineSettings,
  sink: SinkHandle,
  cancel: CancellationToken,
) -> Result<(PipelineOutcome, CheckpointManager), StoreError> {
  let file_count = files.len();
  debug!(file_count, "starting embedding pipeline");

  // Internal token: also fired by the dispatcher on fatal provider errors
  let internal = cancel.child_token();

  let limits = provider.limits();
  let limiter = Arc::new(RateLimiter::for_provider(limits));
  let batcher = AdaptiveBatcher::new(settings.batcher, settings.concurrency);
  let provider_name = provider.name().to_string();

  let monitor = match settings.memory_probe {
    Some(probe) => MemoryMonitor::with_probe(settings.memory, probe),
    None => MemoryMonitor::new(settings.memory),
  };
  let monitor_handle = monitor.spawn(internal.clone());

  // Surface pause transitions as phase events
  {
    let mut pause_rx = monitor.pause_events();
    let sink = sink.clone();
    let cancel = internal.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          changed = pause_rx.changed() => {
            if changed.is_err() {
              break;
            }
            let paused = *pause_rx.borrow();
            sink.phase(if paused {
              crate::progress::IndexPhase::Paused
            } else {
              crate::progress::IndexPhase::Embedding
            });
          }
        }
      }
    });
  }

  let (source_tx, source_rx) = mpsc::channel(SOURCE_BUFFER);
  let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_BUFFER);
  let (writer_tx, writer_rx) = mpsc::channel(WRITER_BUFFER);
  let chunk_workers = chunk_worker_count();
  let (done_tx, done_rx) = mpsc::channel(chunk_workers);

  // Source
  {
    let tx = source_tx.clone();
    let cancel = internal.clone();
    tokio::spawn(async move {
      source_stage(files, tx, cancel).await;
    });
  }
  drop(source_tx);

  // Chunk workers over a shared receiver
  let source_rx = Arc::new(Mutex::new(source_rx));
  for worker_id in 0..chunk_workers {
    let rx = source_rx.clone();
    let dispatch_tx = dispatch_tx.clone();
    let writer_tx = writer_tx.clone();
    let done_tx = done_tx.clone();
    let chunker = Chunker::new(settings.chunker.clone());
    let monitor = monitor.clone();
    let repository_id = repository_id.clone();
    let cancel = internal.clone();
    tokio::spawn(async move {
      chunk_worker(
        worker_id,
        rx,
        dispatch_tx,
        writer_tx,
        done_tx,
        chunker,
        monitor,
        repository_id,
        cancel,
      )
      .await;
    });
  }
  drop(done_tx);

  // Done aggregator closes both downstream inputs
  {
    let dispatch_tx = dispatch_tx.clone();
    let writer_tx = writer_tx.clone();
    tokio::spawn(async move {
      chunking_done_aggregator(chunk_workers, done_rx, dispatch_tx, writer_tx).await;
    });
  }
  drop(dispatch_tx);

  // Dispatcher
  let dispatcher_handle = {
    let writer_tx = writer_tx.clone();
    let provider = provider.clone();
    let limiter = limiter.clone();
    let sink = sink.clone();
    let cancel = internal.clone();
    let policy = settings.retry.clone();
    tokio::spawn(async move {
      dispatcher_stage(
        dispatch_rx,
        writer_tx,
        provider,
        limiter,
        batcher,
        policy,
        limits.max_tokens_per_request,
        sink,
        cancel,
      )
      .await
    })
  };
  drop(writer_tx);

  // Writer runs here; its completion ends the pipeline
  let writer_result = writer_stage(
    writer_rx,
    store,
    repository_id,
    provider_name,
    base_hashes,
    checkpoint,
    sink,
    cancel.clone(),
  )
  .await;

  let dispatcher_stats = dispatcher_handle.await.unwrap_or_default();

  // Stop the memory sampler
  internal.cancel();
  let _ = monitor_handle.await;

  let (mut writer_outcome, checkpoint) = writer_result?;
  writer_outcome.stats.memory_pauses = monitor.stats().pause_count as usize;

  debug!(
    files = file_count,
    chunks = writer_outcome.stats.chunks_embedded,
    batches = dispatcher_stats.batches_fired,
    "pipeline complete"
  );

  Ok((
    PipelineOutcome {
      writer: writer_outcome,
      memory: monitor.stats(),
      fatal: dispatcher_stats.fatal,
      cancelled: cancel.is_cancelled(),
    },
    checkpoint,
  ))
}
