//! Repository identity and metadata records.
//!
//! A repository is a filesystem tree indexed as a unit. Its identity is
//! derived from the canonicalized absolute path so that every invocation on
//! the same tree lands in the same isolated store directory.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RepoConfig;

/// Schema version of the on-disk repository layout.
///
/// Bumped when the layout of `metadata.json` or the chunk/vector files
/// changes incompatibly. A store with a different version refuses to open.
pub const SCHEMA_VERSION: u32 = 1;

/// Stable identifier for an indexed repository.
///
/// First 16 hex chars of SHA-256 over the canonicalized absolute path:
/// compact enough for a directory name, with negligible collision
/// probability across distinct paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(String);

impl RepositoryId {
  /// Derive the id for a repository root.
  ///
  /// Canonicalizes the path when possible so `/repo` and `/repo/.` agree;
  /// falls back to the path as given when it does not exist yet.
  pub fn from_path(path: &Path) -> Self {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    Self(hex::encode(&digest[..8]))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RepositoryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Human-readable alias for a repository, derived from the final path
/// component. Only used for display; the id is the key.
pub fn alias_for_path(path: &Path) -> String {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_else(|| "repository".to_string());

  let sanitized: String = name
    .chars()
    .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
    .collect();

  if sanitized.is_empty() { "repository".to_string() } else { sanitized }
}

/// Persisted record for one indexed repository (`metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRecord {
  pub repository_id: RepositoryId,
  pub alias: String,
  pub absolute_path: PathBuf,
  pub created_at: DateTime<Utc>,
  pub last_updated: DateTime<Utc>,
  pub last_indexed: Option<DateTime<Utc>>,
  /// Name of the provider the stored vectors were produced by.
  pub embedding_provider: String,
  /// Dimensionality of every stored vector. A provider change that alters
  /// this forces a full re-embed before the field is updated.
  pub embedding_dimensions: usize,
  /// Effective per-repository configuration at creation time.
  pub config: RepoConfig,
  pub total_chunks: usize,
  pub version: u32,
}

impl RepositoryRecord {
  pub fn new(path: &Path, provider: &str, dimensions: usize, config: RepoConfig) -> Self {
    let now = Utc::now();
    Self {
      repository_id: RepositoryId::from_path(path),
      alias: alias_for_path(path),
      absolute_path: path.to_path_buf(),
      created_at: now,
      last_updated: now,
      last_indexed: None,
      embedding_provider: provider.to_string(),
      embedding_dimensions: dimensions,
      config,
      total_chunks: 0,
      version: SCHEMA_VERSION,
    }
  }
}
