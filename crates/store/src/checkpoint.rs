//! Checkpoint persistence and cadence.
//!
//! A checkpoint is a snapshot of in-flight indexing progress sufficient to
//! resume after a crash or cancellation. Each write is a fresh numbered
//! file whose name sorts lexicographically in write order; the directory
//! is trimmed to the newest `max_checkpoints`. Selection skips corrupt
//! files with a warning; newest valid wins.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ziri_core::config::CheckpointConfig;
use ziri_core::repository::RepositoryId;

use crate::error::{Result, StoreError};
use crate::store::{RepositoryStore, write_json_atomic};

/// What kind of run wrote the checkpoint. Resume only matches the same
/// operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
  Indexing,
  Update,
}

impl std::fmt::Display for OperationType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Indexing => f.write_str("indexing"),
      Self::Update => f.write_str("update"),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
  pub repository_id: RepositoryId,
  pub operation: OperationType,
  pub started_at: DateTime<Utc>,
  /// Relative paths already fully processed. Grows monotonically within
  /// an operation.
  pub processed_files: BTreeSet<String>,
  /// Chunks written so far. Grows monotonically within an operation.
  pub processed_chunks: usize,
  pub phase: String,
  /// Monotonic per-write counter.
  pub serial: u64,
}

impl RepositoryStore {
  /// Append a new numbered checkpoint file, then trim old ones.
  pub fn write_checkpoint(&self, checkpoint: &Checkpoint, max_checkpoints: usize) -> Result<()> {
    let dir = self.checkpoints_dir(&checkpoint.repository_id);
    let filename = format!(
      "{:08}_{:013}.json",
      checkpoint.serial,
      Utc::now().timestamp_millis()
    );
    write_json_atomic(&dir.join(filename), checkpoint)?;
    self.trim_checkpoints(&checkpoint.repository_id, max_checkpoints)?;
    Ok(())
  }

  fn checkpoint_files_sorted(&self, id: &RepositoryId) -> Result<Vec<std::path::PathBuf>> {
    let dir = self.checkpoints_dir(id);
    if !dir.exists() {
      return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(&dir).map_err(StoreError::io(&dir))?;
    let mut files: Vec<_> = entries
      .flatten()
      .map(|e| e.path())
      .filter(|p| p.extension().is_some_and(|e| e == "json"))
      .collect();
    // Filename embeds serial then timestamp, so name order is write order
    files.sort();
    Ok(files)
  }

  fn trim_checkpoints(&self, id: &RepositoryId, max_checkpoints: usize) -> Result<()> {
    let files = self.checkpoint_files_sorted(id)?;
    if files.len() <= max_checkpoints {
      return Ok(());
    }
    for stale in &files[..files.len() - max_checkpoints] {
      if let Err(e) = std::fs::remove_file(stale) {
        warn!(path = %stale.display(), error = %e, "failed to purge old checkpoint");
      }
    }
    Ok(())
  }

  /// Newest valid checkpoint for this repository and operation. Corrupt
  /// files are skipped with a warning, as if absent.
  pub fn latest_checkpoint(&self, id: &RepositoryId, operation: OperationType) -> Result<Option<Checkpoint>> {
    let files = self.checkpoint_files_sorted(id)?;
    for path in files.iter().rev() {
      let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
          warn!(path = %path.display(), error = %e, "unreadable checkpoint, skipping");
          continue;
        }
      };
      match serde_json::from_str::<Checkpoint>(&content) {
        Ok(checkpoint) if &checkpoint.repository_id == id && checkpoint.operation == operation => {
          return Ok(Some(checkpoint));
        }
        Ok(_) => continue,
        Err(e) => {
          warn!(path = %path.display(), error = %e, "corrupt checkpoint, skipping");
          continue;
        }
      }
    }
    Ok(None)
  }

  pub fn clear_checkpoints(&self, id: &RepositoryId) -> Result<()> {
    for path in self.checkpoint_files_sorted(id)? {
      std::fs::remove_file(&path).map_err(StoreError::io(&path))?;
    }
    Ok(())
  }
}

/// Drives checkpoint cadence for one operation: every `interval_items`
/// processed files, on every phase transition, and on demand before a
/// cancelled return.
pub struct CheckpointManager {
  store: RepositoryStore,
  config: CheckpointConfig,
  checkpoint: Checkpoint,
  items_since_write: usize,
}

impl CheckpointManager {
  /// Start a fresh operation, optionally adopting a resumable checkpoint's
  /// progress.
  pub fn start(
    store: RepositoryStore,
    id: RepositoryId,
    operation: OperationType,
    config: CheckpointConfig,
    resume_from: Option<Checkpoint>,
  ) -> Self {
    let checkpoint = match resume_from {
      Some(previous) => Checkpoint {
        serial: previous.serial + 1,
        ..previous
      },
      None => Checkpoint {
        repository_id: id,
        operation,
        started_at: Utc::now(),
        processed_files: BTreeSet::new(),
        processed_chunks: 0,
        phase: String::new(),
        serial: 0,
      },
    };

    Self {
      store,
      config,
      checkpoint,
      items_since_write: 0,
    }
  }

  /// Find a checkpoint worth resuming: same operation, started within the
  /// resume window.
  pub fn resumable(
    store: &RepositoryStore,
    id: &RepositoryId,
    operation: OperationType,
    config: &CheckpointConfig,
  ) -> Option<Checkpoint> {
    let checkpoint = match store.latest_checkpoint(id, operation) {
      Ok(found) => found?,
      Err(e) => {
        warn!(repository = %id, error = %e, "checkpoint lookup failed, starting fresh");
        return None;
      }
    };

    let window = ChronoDuration::hours(config.resume_window_hours as i64);
    if Utc::now() - checkpoint.started_at > window {
      debug!(
        repository = %id,
        started_at = %checkpoint.started_at,
        "checkpoint outside resume window, starting fresh"
      );
      return None;
    }

    debug!(
      repository = %id,
      processed = checkpoint.processed_files.len(),
      "resumable checkpoint found"
    );
    Some(checkpoint)
  }

  pub fn processed_files(&self) -> &BTreeSet<String> {
    &self.checkpoint.processed_files
  }

  pub fn processed_chunks(&self) -> usize {
    self.checkpoint.processed_chunks
  }

  /// Record one fully processed file; writes when the interval is due.
  /// Returns true when a checkpoint file was written.
  pub fn record_file(&mut self, relative_path: &str, chunks: usize) -> Result<bool> {
    self.checkpoint.processed_files.insert(relative_path.to_string());
    self.checkpoint.processed_chunks += chunks;
    self.items_since_write += 1;

    if self.items_since_write >= self.config.interval_items {
      self.flush()?;
      return Ok(true);
    }
    Ok(false)
  }

  /// Record a phase transition; always writes.
  pub fn record_phase(&mut self, phase: &str) -> Result<()> {
    self.checkpoint.phase = phase.to_string();
    self.flush()
  }

  pub fn flush(&mut self) -> Result<()> {
    self.checkpoint.serial += 1;
    self.items_since_write = 0;
    self.store.write_checkpoint(&self.checkpoint, self.config.max_checkpoints)
  }
}
