//! Hash tracking and change detection.
//!
//! Compares the current filesystem state against the stored hash map to
//! classify every candidate file as added, modified, unchanged or deleted.
//! Files whose stored `(size, mtime)` pair matches a fresh stat are
//! declared unchanged without rehashing; the stored hash is adopted as-is.
//! That shortcut perpetuates a wrong stored hash if one was ever written,
//! a deliberate trade-off for throughput.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

use store::{FileHashEntry, FileHashMap};

use crate::walker::FileInfo;

/// The categorized delta between two states of a repository.
///
/// `added ∪ modified ∪ unchanged` is exactly the current candidate set;
/// `deleted` is disjoint from all three.
#[derive(Debug, Default)]
pub struct ChangeSet {
  pub added: Vec<String>,
  pub modified: Vec<String>,
  pub unchanged: Vec<String>,
  pub deleted: Vec<String>,
}

impl ChangeSet {
  pub fn has_changes(&self) -> bool {
    !self.added.is_empty() || !self.modified.is_empty() || !self.deleted.is_empty()
  }
}

/// Optimization counters for one detection pass.
#[derive(Debug, Default, Clone)]
pub struct DetectionStats {
  pub total_files: usize,
  /// Files whose stat differed from storage and were rehashed.
  pub potentially_changed: usize,
  /// Files admitted via the (size, mtime) fast path.
  pub definitely_unchanged: usize,
  /// Hash computations avoided by the fast path and the in-memory cache.
  pub hash_calculations_skipped: usize,
}

/// Result of a detection pass: the classification, a fresh entry for every
/// current candidate, and the counters.
#[derive(Debug)]
pub struct Detection {
  pub changes: ChangeSet,
  /// Fresh hash entries keyed by relative path, for every current file.
  pub entries: HashMap<String, FileHashEntry>,
  pub stats: DetectionStats,
  /// Files excluded because stat or read failed; reported, not fatal.
  pub warnings: Vec<String>,
}

/// Per-path hash validation outcome.
#[derive(Debug, Default)]
pub struct HashValidation {
  pub valid: Vec<String>,
  pub invalid: Vec<InvalidHash>,
  pub missing: Vec<String>,
}

#[derive(Debug)]
pub struct InvalidHash {
  pub relative_path: String,
  pub stored: String,
  pub current: String,
}

/// SHA-256 of a file's raw bytes, lowercase hex, streamed in 64 KiB reads.
pub async fn hash_file(path: &std::path::Path) -> std::io::Result<String> {
  let mut file = tokio::fs::File::open(path).await?;
  let mut hasher = Sha256::new();
  let mut buf = vec![0u8; 64 * 1024];
  loop {
    let n = file.read(&mut buf).await?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(hex::encode(hasher.finalize()))
}

/// Change detector with an in-memory hash cache.
///
/// The cache is keyed by relative path, invalidated on stat mismatch, and
/// private to one invocation of the engine; it only pays off when several
/// operations run inside the same process.
#[derive(Debug, Default)]
pub struct ChangeDetector {
  cache: HashMap<String, FileHashEntry>,
}

impl ChangeDetector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Classify `current` against `stored`.
  pub async fn detect(&mut self, current: &[FileInfo], stored: &FileHashMap) -> Detection {
    let mut changes = ChangeSet::default();
    let mut entries = HashMap::with_capacity(current.len());
    let mut stats = DetectionStats {
      total_files: current.len(),
      ..Default::default()
    };
    let mut warnings = Vec::new();

    for info in current {
      let rel = info.relative_path.as_str();

      // Fast path: stored (size, mtime) both match -> definitely unchanged
      if let Some(previous) = stored.get(rel)
        && previous.size == info.size
        && previous.last_modified == info.last_modified
      {
        stats.definitely_unchanged += 1;
        stats.hash_calculations_skipped += 1;
        changes.unchanged.push(rel.to_string());
        entries.insert(rel.to_string(), previous.clone());
        self.cache.insert(rel.to_string(), previous.clone());
        continue;
      }

      // Cache hit with matching stat also skips the recomputation
      let hash = if let Some(cached) = self.cache.get(rel).filter(|c| c.size == info.size && c.last_modified == info.last_modified)
      {
        stats.hash_calculations_skipped += 1;
        cached.hash.clone()
      } else {
        stats.potentially_changed += 1;
        match hash_file(&info.absolute_path).await {
          Ok(hash) => hash,
          Err(e) => {
            warn!(path = rel, error = %e, "failed to hash file, excluding from run");
            warnings.push(format!("{rel}: {e}"));
            continue;
          }
        }
      };

      let entry = FileHashEntry {
        hash: hash.clone(),
        size: info.size,
        last_modified: info.last_modified,
      };
      self.cache.insert(rel.to_string(), entry.clone());
      entries.insert(rel.to_string(), entry);

      match stored.get(rel) {
        None => changes.added.push(rel.to_string()),
        Some(previous) if previous.hash == hash => {
          trace!(path = rel, "touched but content unchanged");
          changes.unchanged.push(rel.to_string());
        }
        Some(_) => changes.modified.push(rel.to_string()),
      }
    }

    // Anything stored but no longer present is deleted
    for path in stored.keys() {
      if !entries.contains_key(path) && !warnings.iter().any(|w| w.starts_with(path.as_str())) {
        changes.deleted.push(path.clone());
      }
    }

    debug!(
      total = stats.total_files,
      added = changes.added.len(),
      modified = changes.modified.len(),
      unchanged = changes.unchanged.len(),
      deleted = changes.deleted.len(),
      skipped_hashes = stats.hash_calculations_skipped,
      "change detection complete"
    );

    Detection {
      changes,
      entries,
      stats,
      warnings,
    }
  }

  /// Recompute hashes for a sample of tracked paths and compare against
  /// storage.
  pub async fn validate_sample(
    &self,
    root: &std::path::Path,
    sample: &[String],
    stored: &FileHashMap,
  ) -> HashValidation {
    let mut result = HashValidation::default();

    for rel in sample {
      let Some(entry) = stored.get(rel) else {
        result.missing.push(rel.clone());
        continue;
      };

      match hash_file(&root.join(rel)).await {
        Ok(current) if current == entry.hash => result.valid.push(rel.clone()),
        Ok(current) => result.invalid.push(InvalidHash {
          relative_path: rel.clone(),
          stored: entry.hash.clone(),
          current,
        }),
        Err(_) => result.missing.push(rel.clone()),
      }
    }

    result
  }
}
