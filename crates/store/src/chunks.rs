//! Chunk descriptor and vector persistence.
//!
//! Descriptors are grouped per source path under `chunks/` (one JSON file
//! per path, named by a hash of the relative path). Vector records live
//! under `vectors/`, one file per chunk id, so a lookup by id is a single
//! path construction away.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;
use ziri_core::repository::RepositoryId;

use crate::error::{Result, StoreError};
use crate::store::{RepositoryStore, write_json_atomic};

/// One chunk of one source file, the unit of embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
  /// Deterministic id, stable across runs for unchanged content.
  pub chunk_id: String,
  pub repository_id: RepositoryId,
  pub file_path: PathBuf,
  /// Forward-slashed path relative to the repository root.
  pub relative_path: String,
  /// 1-based, inclusive.
  pub start_line: u32,
  /// 1-based, inclusive.
  pub end_line: u32,
  pub size_chars: usize,
  pub estimated_tokens: usize,
  /// The chunk's text, kept for retrieval-time context.
  pub content: String,
  /// Structural metadata supplied by an external collaborator; the core
  /// neither computes nor requires these.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub language: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub symbol_kind: Option<String>,
}

/// The embedding for one chunk. Shares `chunk_id` with its descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
  pub chunk_id: String,
  pub vector: Vec<f32>,
  pub embedded_at: DateTime<Utc>,
  pub provider: String,
}

/// On-disk grouping of one path's descriptors.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkFile {
  relative_path: String,
  chunks: Vec<ChunkDescriptor>,
}

/// Stable file name for a relative path's chunk group.
fn path_key(relative_path: &str) -> String {
  let digest = Sha256::digest(relative_path.as_bytes());
  hex::encode(&digest[..8])
}

impl RepositoryStore {
  fn chunk_file_path(&self, id: &RepositoryId, relative_path: &str) -> PathBuf {
    self.chunks_dir(id).join(format!("{}.json", path_key(relative_path)))
  }

  fn vector_path(&self, id: &RepositoryId, chunk_id: &str) -> PathBuf {
    self.vectors_dir(id).join(format!("{chunk_id}.json"))
  }

  /// Persist one file's chunks and their vectors.
  ///
  /// Vectors are written before the descriptor group so a descriptor never
  /// exists without its vector. Callers replace a modified file by
  /// `delete_chunks_for_path` first.
  pub fn put_chunks(
    &self,
    id: &RepositoryId,
    relative_path: &str,
    chunks: &[(ChunkDescriptor, Vec<f32>)],
    provider: &str,
  ) -> Result<()> {
    let embedded_at = Utc::now();

    for (descriptor, vector) in chunks {
      let record = VectorRecord {
        chunk_id: descriptor.chunk_id.clone(),
        vector: vector.clone(),
        embedded_at,
        provider: provider.to_string(),
      };
      write_json_atomic(&self.vector_path(id, &descriptor.chunk_id), &record)?;
    }

    let group = ChunkFile {
      relative_path: relative_path.to_string(),
      chunks: chunks.iter().map(|(d, _)| d.clone()).collect(),
    };
    write_json_atomic(&self.chunk_file_path(id, relative_path), &group)?;

    trace!(repository = %id, path = relative_path, chunks = chunks.len(), "stored chunks");
    Ok(())
  }

  pub fn list_chunks_for_path(&self, id: &RepositoryId, relative_path: &str) -> Result<Vec<ChunkDescriptor>> {
    let path = self.chunk_file_path(id, relative_path);
    if !path.exists() {
      return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path).map_err(StoreError::io(&path))?;
    let group: ChunkFile = serde_json::from_str(&content).map_err(StoreError::json(&path))?;
    Ok(group.chunks)
  }

  /// Remove a path's descriptors and vectors. Returns how many chunks
  /// were removed.
  pub fn delete_chunks_for_path(&self, id: &RepositoryId, relative_path: &str) -> Result<usize> {
    let chunks = self.list_chunks_for_path(id, relative_path)?;
    for descriptor in &chunks {
      let vector_path = self.vector_path(id, &descriptor.chunk_id);
      if vector_path.exists() {
        std::fs::remove_file(&vector_path).map_err(StoreError::io(&vector_path))?;
      }
    }

    let path = self.chunk_file_path(id, relative_path);
    if path.exists() {
      std::fs::remove_file(&path).map_err(StoreError::io(&path))?;
    }

    trace!(repository = %id, path = relative_path, removed = chunks.len(), "deleted chunks");
    Ok(chunks.len())
  }

  /// Random access to one vector by chunk id.
  pub fn read_vector(&self, id: &RepositoryId, chunk_id: &str) -> Result<Option<VectorRecord>> {
    let path = self.vector_path(id, chunk_id);
    if !path.exists() {
      return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(StoreError::io(&path))?;
    let record = serde_json::from_str(&content).map_err(StoreError::json(&path))?;
    Ok(Some(record))
  }

  /// Total chunks stored across all paths.
  pub fn chunk_count(&self, id: &RepositoryId) -> Result<usize> {
    let dir = self.chunks_dir(id);
    if !dir.exists() {
      return Ok(0);
    }

    let mut total = 0;
    let entries = std::fs::read_dir(&dir).map_err(StoreError::io(&dir))?;
    for entry in entries.flatten() {
      let path = entry.path();
      if path.extension().is_some_and(|e| e == "json")
        && let Ok(content) = std::fs::read_to_string(&path)
        && let Ok(group) = serde_json::from_str::<ChunkFile>(&content)
      {
        total += group.chunks.len();
      }
    }
    Ok(total)
  }
}
