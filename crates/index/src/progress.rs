//! Progress sink and run statistics.
//!
//! Observers receive an enumerated set of callbacks rather than
//! string-keyed events. Every method has a no-op default, and the
//! pipeline invokes sinks through a panic-swallowing handle so a broken
//! observer can never take the run down with it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use store::OperationType;
use ziri_core::repository::RepositoryId;

/// Phases of one indexing invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
  Idle,
  Discovery,
  Classification,
  Embedding,
  Paused,
  Finalize,
  Cancelled,
}

impl std::fmt::Display for IndexPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Self::Idle => "idle",
      Self::Discovery => "discovery",
      Self::Classification => "classification",
      Self::Embedding => "embedding",
      Self::Paused => "paused",
      Self::Finalize => "finalize",
      Self::Cancelled => "cancelled",
    };
    f.write_str(name)
  }
}

/// Why a file was skipped rather than indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Binary,
  ReadError,
}

/// Terminal state of one file within a run.
#[derive(Debug, Clone)]
pub enum FileResult {
  Indexed { chunks: usize },
  Skipped { reason: SkipReason },
  Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
  pub relative_path: String,
  pub result: FileResult,
}

/// One completed provider round-trip.
#[derive(Debug, Clone)]
pub struct BatchReport {
  pub batch_id: u64,
  pub size: usize,
  pub estimated_tokens: usize,
  pub response_time: Duration,
  pub retries: u32,
}

/// A failure surfaced in the completion report.
#[derive(Debug, Clone)]
pub struct FileFailure {
  pub relative_path: String,
  pub kind: String,
  pub detail: String,
}

/// Observer capability. All callbacks are advisory; errors and panics in
/// them are swallowed.
pub trait ProgressSink: Send + Sync {
  fn on_phase(&self, _phase: IndexPhase) {}
  fn on_file(&self, _outcome: &FileOutcome) {}
  fn on_batch(&self, _report: &BatchReport) {}
  fn on_error(&self, _failure: &FileFailure) {}
  fn on_complete(&self, _report: &CompletionReport) {}
}

/// Default sink: observes nothing.
pub struct NoopSink;

impl ProgressSink for NoopSink {}

/// Panic-isolating wrapper the pipeline calls sinks through.
#[derive(Clone)]
pub struct SinkHandle {
  inner: Arc<dyn ProgressSink>,
}

impl SinkHandle {
  pub fn new(inner: Arc<dyn ProgressSink>) -> Self {
    Self { inner }
  }

  fn guarded(&self, label: &str, f: impl FnOnce(&dyn ProgressSink)) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| f(self.inner.as_ref())));
    if result.is_err() {
      warn!(callback = label, "progress callback panicked; ignoring");
    }
  }

  pub fn phase(&self, phase: IndexPhase) {
    self.guarded("on_phase", |s| s.on_phase(phase));
  }

  pub fn file(&self, outcome: &FileOutcome) {
    self.guarded("on_file", |s| s.on_file(outcome));
  }

  pub fn batch(&self, report: &BatchReport) {
    self.guarded("on_batch", |s| s.on_batch(report));
  }

  pub fn error(&self, failure: &FileFailure) {
    self.guarded("on_error", |s| s.on_error(failure));
  }

  pub fn complete(&self, report: &CompletionReport) {
    self.guarded("on_complete", |s| s.on_complete(report));
  }
}

/// Phase-aware counters collected while the pipeline runs.
#[derive(Debug)]
pub struct IndexStats {
  started: Instant,
  pub files_processed: usize,
  pub files_skipped: usize,
  pub files_failed: usize,
  pub chunks_embedded: usize,
  pub batches_completed: usize,
  pub batches_failed: usize,
  pub retries: usize,
  pub memory_pauses: usize,
}

impl Default for IndexStats {
  fn default() -> Self {
    Self {
      started: Instant::now(),
      files_processed: 0,
      files_skipped: 0,
      files_failed: 0,
      chunks_embedded: 0,
      batches_completed: 0,
      batches_failed: 0,
      retries: 0,
      memory_pauses: 0,
    }
  }
}

impl IndexStats {
  pub fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }

  /// Files per second so far.
  pub fn throughput(&self) -> f64 {
    let secs = self.elapsed().as_secs_f64();
    if secs > 0.0 { self.files_processed as f64 / secs } else { 0.0 }
  }

  /// Naive remaining-time estimate from current throughput.
  pub fn eta(&self, total_files: usize) -> Option<Duration> {
    let remaining = total_files.saturating_sub(self.files_processed + self.files_skipped + self.files_failed);
    let rate = self.throughput();
    if remaining == 0 || rate <= 0.0 {
      return None;
    }
    Some(Duration::from_secs_f64(remaining as f64 / rate))
  }
}

/// User-visible summary of one invocation.
#[derive(Debug, Clone)]
pub struct CompletionReport {
  pub repository_id: RepositoryId,
  pub operation: OperationType,
  pub processed: usize,
  pub skipped: usize,
  pub failed: usize,
  pub deleted: usize,
  pub chunks_embedded: usize,
  pub batches: usize,
  pub retries: usize,
  pub memory_pauses: usize,
  pub duration: Duration,
  pub cancelled: bool,
  pub failures: Vec<FileFailure>,
}

impl CompletionReport {
  /// Fraction of attempted files that succeeded.
  pub fn reliability(&self) -> f64 {
    let attempted = self.processed + self.failed;
    if attempted == 0 {
      return 1.0;
    }
    self.processed as f64 / attempted as f64
  }

  /// Advice generated from aggregate statistics.
  pub fn recommendations(&self) -> Vec<String> {
    let mut advice = Vec::new();

    if self.reliability() < 0.95 && self.failed > 0 {
      advice.push("reliability below 95%, consider reducing the batch size or concurrency".to_string());
    }
    if self.retries > self.batches / 2 && self.retries > 2 {
      advice.push("frequent retries observed, the provider rate limits may be set too high".to_string());
    }
    if self.memory_pauses > 0 {
      advice.push(format!(
        "chunk production paused {} time(s) under memory pressure, consider raising memory_limit_mb",
        self.memory_pauses
      ));
    }

    advice
  }
}
