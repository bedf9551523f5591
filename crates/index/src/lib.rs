//! The indexing engine.
//!
//! Walks a repository, classifies files against stored hashes, chunks the
//! changed ones, embeds chunks through a pluggable provider, and persists
//! vectors plus metadata in an isolated per-repository store. Subsequent
//! invocations re-embed only what changed.
//!
//! The [`Indexer`] drives one invocation through its phases:
//!
//! ```text
//! Idle ─► Discovery ─► Classification ─► Chunking+Embedding ─► Finalize ─► Idle
//!                                            │       ▲
//!                                         Paused ────┘ (memory pressure)
//!                                            │
//!                                         Cancelled ─► Finalize
//! ```

pub mod batcher;
pub mod changes;
pub mod chunker;
pub mod memory;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod walker;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use embedding::provider::RegistryError;
use embedding::{EmbeddingError, EmbeddingProvider, ProviderRegistry};
use store::{CheckpointManager, FileHashEntry, OperationType, RepositoryStore, StoreError};
use ziri_core::config::{Config, ConfigError};
use ziri_core::repository::RepositoryId;

use crate::batcher::BatcherConfig;
use crate::changes::{ChangeDetector, Detection, HashValidation};
use crate::chunker::ChunkerConfig;
use crate::memory::{MemoryConfig, UsageProbe};
use crate::pipeline::{PipelineSettings, RetryPolicy, run_pipeline};
use crate::progress::{CompletionReport, IndexPhase, NoopSink, ProgressSink, SinkHandle};
use crate::walker::{FileInfo, FileWalker};

pub use crate::progress::{BatchReport, FileFailure, FileOutcome, FileResult};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Registry(#[from] RegistryError),
  #[error("invalid exclusion pattern: {0}")]
  Pattern(#[from] globset::Error),
  #[error("provider '{provider}' failed: {source}")]
  Provider {
    provider: String,
    #[source]
    source: EmbeddingError,
  },
}

/// Per-invocation options.
#[derive(Debug, Default, Clone)]
pub struct IndexOptions {
  /// Provider name; the configured default when unset.
  pub provider: Option<String>,
}

/// The indexing engine. Construct once, run per repository.
///
/// Operations on the same repository must be serialized by the caller;
/// the store offers no lock. Different repositories are independent.
pub struct Indexer {
  store: RepositoryStore,
  registry: Arc<ProviderRegistry>,
  config: Config,
  sink: Arc<dyn ProgressSink>,
  memory_probe: Option<UsageProbe>,
}

impl Indexer {
  pub fn new(store: RepositoryStore, registry: Arc<ProviderRegistry>, config: Config) -> Self {
    Self {
      store,
      registry,
      config,
      sink: Arc::new(NoopSink),
      memory_probe: None,
    }
  }

  /// Attach a progress sink. Callbacks are advisory; errors inside them
  /// never reach the pipeline.
  pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
    self.sink = sink;
    self
  }

  /// Replace the memory monitor's usage probe. The default reads this
  /// process's resident memory; containerized deployments can substitute
  /// a cgroup-aware reader.
  pub fn with_memory_probe(mut self, probe: UsageProbe) -> Self {
    self.memory_probe = Some(probe);
    self
  }

  pub fn store(&self) -> &RepositoryStore {
    &self.store
  }

  /// Index or update one repository.
  pub async fn index_repository(
    &self,
    root: &Path,
    options: &IndexOptions,
    cancel: CancellationToken,
  ) -> Result<CompletionReport, IndexError> {
    let started = Instant::now();
    let sink = SinkHandle::new(self.sink.clone());

    let provider = self.registry.get(options.provider.as_deref())?;
    let record = self
      .store
      .create_or_open(root, provider.name(), provider.dimensions(), &self.config.repo)?;
    let repository_id = record.repository_id.clone();

    info!(
      repository = %repository_id,
      alias = %record.alias,
      provider = provider.name(),
      "indexing started"
    );

    // ---- Discovery ----------------------------------------------------
    sink.phase(IndexPhase::Discovery);
    let walker = FileWalker::new(
      root,
      &record.config.exclude_patterns,
      record.config.max_file_size_bytes,
    )?;
    let candidates = walker.collect_files();

    // ---- Classification -----------------------------------------------
    sink.phase(IndexPhase::Classification);
    let stored = self.store.read_hashes(&repository_id)?;
    // A run counts as the initial indexing until one has fully completed;
    // a cancelled first run resumes as Indexing, not Update
    let operation = if record.last_indexed.is_none() {
      OperationType::Indexing
    } else {
      OperationType::Update
    };

    let mut detector = ChangeDetector::new();
    let detection = detector.detect(&candidates, &stored).await;

    // A provider switch that changes dimensions forces a full re-embed:
    // hashes are untouched, but every current file needs new vectors
    let dimensions_changed = record.embedding_dimensions != provider.dimensions();
    if dimensions_changed {
      info!(
        repository = %repository_id,
        from = record.embedding_dimensions,
        to = provider.dimensions(),
        "embedding dimensions changed, re-embedding all chunks"
      );
      self.store.begin_vector_swap(&repository_id)?;
    }

    let mut to_index = select_files(&candidates, &detection, dimensions_changed);

    // Deletions are applied before embedding starts; the files are
    // already gone from disk
    let mut base_hashes = stored.clone();
    for path in &detection.changes.deleted {
      self.store.delete_chunks_for_path(&repository_id, path)?;
      base_hashes.remove(path);
    }

    // Resume: skip files the newest in-window checkpoint already
    // processed, as long as their stored hash still matches
    let resume_from = CheckpointManager::resumable(&self.store, &repository_id, operation, &self.config.checkpoint);
    if let Some(checkpoint) = &resume_from {
      let before = to_index.len();
      to_index.retain(|(info, entry)| {
        !(checkpoint.processed_files.contains(&info.relative_path)
          && stored.get(&info.relative_path).is_some_and(|s| s.hash == entry.hash))
      });
      info!(
        repository = %repository_id,
        skipped = before - to_index.len(),
        "resuming from checkpoint"
      );
    }

    let checkpoint = CheckpointManager::start(
      self.store.clone(),
      repository_id.clone(),
      operation,
      self.config.checkpoint.clone(),
      resume_from,
    );

    // ---- Chunking + Embedding -----------------------------------------
    sink.phase(IndexPhase::Embedding);
    let settings = self.pipeline_settings(&record.config);
    let (pipeline, mut checkpoint) = run_pipeline(
      self.store.clone(),
      repository_id.clone(),
      provider.clone(),
      to_index,
      base_hashes,
      checkpoint,
      settings,
      sink.clone(),
      cancel.clone(),
    )
    .await?;

    // ---- Finalize ------------------------------------------------------
    let cancelled = pipeline.cancelled;
    sink.phase(if cancelled { IndexPhase::Cancelled } else { IndexPhase::Finalize });

    if let Some(fatal) = pipeline.fatal {
      // Fatal provider failure: discard partial vector swap, keep the
      // previous vector set intact, and surface the error
      if dimensions_changed {
        self.store.rollback_vector_swap(&repository_id)?;
      }
      let _ = checkpoint.record_phase(&IndexPhase::Finalize.to_string());
      return Err(IndexError::Provider {
        provider: provider.name().to_string(),
        source: fatal,
      });
    }

    self.store.write_hashes(&repository_id, &pipeline.writer.hashes)?;

    let mut record = record;
    if dimensions_changed {
      if cancelled {
        // Partial re-embed is discarded; dimensions stay at the old value
        self.store.rollback_vector_swap(&repository_id)?;
      } else {
        self.store.commit_vector_swap(&repository_id)?;
        record.embedding_dimensions = provider.dimensions();
        record.embedding_provider = provider.name().to_string();
      }
    }

    record.total_chunks = self.store.chunk_count(&repository_id)?;
    record.last_updated = chrono::Utc::now();
    if !cancelled {
      record.last_indexed = Some(chrono::Utc::now());
    }
    self.store.write_metadata(&record)?;

    if cancelled {
      // Leave a checkpoint behind so the next run resumes
      checkpoint.record_phase(&IndexPhase::Cancelled.to_string())?;
    } else {
      self.store.clear_checkpoints(&repository_id)?;
    }

    let stats = &pipeline.writer.stats;
    let report = CompletionReport {
      repository_id: repository_id.clone(),
      operation,
      processed: stats.files_processed,
      skipped: stats.files_skipped + detection.warnings.len(),
      failed: stats.files_failed,
      deleted: detection.changes.deleted.len(),
      chunks_embedded: stats.chunks_embedded,
      batches: stats.batches_completed + stats.batches_failed,
      retries: stats.retries,
      memory_pauses: pipeline.memory.pause_count as usize,
      duration: started.elapsed(),
      cancelled,
      failures: pipeline.writer.failures.clone(),
    };

    sink.complete(&report);
    sink.phase(IndexPhase::Idle);

    info!(
      repository = %repository_id,
      processed = report.processed,
      skipped = report.skipped,
      failed = report.failed,
      deleted = report.deleted,
      chunks = report.chunks_embedded,
      cancelled = report.cancelled,
      elapsed_ms = report.duration.as_millis(),
      "indexing finished"
    );

    Ok(report)
  }

  /// Recompute hashes for a sample of tracked paths and compare against
  /// storage.
  pub async fn verify_hashes(&self, root: &Path, sample: &[String]) -> Result<HashValidation, IndexError> {
    let repository_id = RepositoryId::from_path(root);
    let stored = self.store.read_hashes(&repository_id)?;
    let detector = ChangeDetector::new();
    Ok(detector.validate_sample(root, sample, &stored).await)
  }

  fn pipeline_settings(&self, repo: &ziri_core::config::RepoConfig) -> PipelineSettings {
    PipelineSettings {
      chunker: ChunkerConfig::from(repo),
      batcher: BatcherConfig {
        initial_batch_size: self.config.performance.batch_size,
        target_response_time: std::time::Duration::from_millis(self.config.pipeline.target_response_time_ms),
        ..BatcherConfig::default()
      },
      retry: RetryPolicy::from_config(&self.config.pipeline),
      memory: MemoryConfig::with_limit_mb(self.config.performance.memory_limit_mb),
      memory_probe: self.memory_probe.clone(),
      concurrency: self.config.performance.concurrency,
    }
  }
}

/// Pick the files the pipeline must embed this run.
fn select_files(
  candidates: &[FileInfo],
  detection: &Detection,
  reembed_all: bool,
) -> Vec<(FileInfo, FileHashEntry)> {
  let by_path: HashMap<&str, &FileInfo> = candidates.iter().map(|f| (f.relative_path.as_str(), f)).collect();

  let wanted: Vec<&String> = if reembed_all {
    detection
      .changes
      .added
      .iter()
      .chain(detection.changes.modified.iter())
      .chain(detection.changes.unchanged.iter())
      .collect()
  } else {
    detection
      .changes
      .added
      .iter()
      .chain(detection.changes.modified.iter())
      .collect()
  };

  wanted
    .into_iter()
    .filter_map(|rel| {
      let info = by_path.get(rel.as_str())?;
      let entry = detection.entries.get(rel)?;
      Some(((*info).clone(), entry.clone()))
    })
    .collect()
}
