//! Persistence of per-file content hashes (`file_hashes.json`).
//!
//! The map's keys are exactly the files the indexer currently considers
//! part of the repository; each entry corresponds to the content that
//! produced the currently stored chunks for that path.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ziri_core::repository::RepositoryId;

use crate::error::{Result, StoreError};
use crate::store::{RepositoryStore, write_json_atomic};

/// Stored state of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashEntry {
  /// SHA-256 of the raw file bytes, lowercase hex.
  pub hash: String,
  /// File size in bytes at hashing time.
  pub size: u64,
  /// Modification time as unix seconds at hashing time.
  pub last_modified: i64,
}

/// Forward-slashed relative path -> entry. BTreeMap keeps the JSON output
/// deterministic across runs.
pub type FileHashMap = BTreeMap<String, FileHashEntry>;

/// Serialized snapshot of the full hash map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashSnapshot {
  pub repository_id: RepositoryId,
  pub taken_at: DateTime<Utc>,
  pub hashes: FileHashMap,
}

pub(crate) fn write_hash_file(path: &Path, map: &FileHashMap) -> Result<()> {
  write_json_atomic(path, map)
}

impl RepositoryStore {
  /// Read the hash map; an absent file is an empty map.
  pub fn read_hashes(&self, id: &RepositoryId) -> Result<FileHashMap> {
    let path = self.hashes_path(id);
    if !path.exists() {
      return Ok(FileHashMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(StoreError::io(&path))?;
    serde_json::from_str(&content).map_err(StoreError::json(&path))
  }

  /// Atomically replace the hash map.
  pub fn write_hashes(&self, id: &RepositoryId, map: &FileHashMap) -> Result<()> {
    write_hash_file(&self.hashes_path(id), map)
  }

  /// Capture the current hash map as a snapshot structure.
  pub fn snapshot_hashes(&self, id: &RepositoryId) -> Result<HashSnapshot> {
    Ok(HashSnapshot {
      repository_id: id.clone(),
      taken_at: Utc::now(),
      hashes: self.read_hashes(id)?,
    })
  }

  /// Atomically restore a previously captured snapshot.
  pub fn restore_hashes(&self, id: &RepositoryId, snapshot: &HashSnapshot) -> Result<()> {
    if &snapshot.repository_id != id {
      return Err(StoreError::Corrupt {
        repository: id.to_string(),
        detail: format!("snapshot belongs to repository {}", snapshot.repository_id),
      });
    }
    self.write_hashes(id, &snapshot.hashes)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;
  use ziri_core::config::RepoConfig;

  fn entry(hash: &str) -> FileHashEntry {
    FileHashEntry {
      hash: hash.to_string(),
      size: 42,
      last_modified: 1_700_000_000,
    }
  }

  fn open_store() -> (TempDir, TempDir, RepositoryStore, RepositoryId) {
    let base = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    let store = RepositoryStore::new(base.path());
    let record = store
      .create_or_open(repo.path(), "ollama", 4, &RepoConfig::default())
      .unwrap();
    let id = record.repository_id;
    (base, repo, store, id)
  }

  #[test]
  fn test_hashes_roundtrip() {
    let (_base, _repo, store, id) = open_store();

    let mut map = FileHashMap::new();
    map.insert("src/main.rs".to_string(), entry("aa"));
    map.insert("README.md".to_string(), entry("bb"));

    store.write_hashes(&id, &map).unwrap();
    let loaded = store.read_hashes(&id).unwrap();
    assert_eq!(loaded, map);
  }

  #[test]
  fn test_missing_file_is_empty_map() {
    let (_base, _repo, store, id) = open_store();
    std::fs::remove_file(store.hashes_path(&id)).unwrap();
    assert!(store.read_hashes(&id).unwrap().is_empty());
  }

  #[test]
  fn test_snapshot_restore_roundtrip() {
    let (_base, _repo, store, id) = open_store();

    let mut map = FileHashMap::new();
    map.insert("a.txt".to_string(), entry("cc"));
    store.write_hashes(&id, &map).unwrap();

    let snapshot = store.snapshot_hashes(&id).unwrap();

    let mut changed = map.clone();
    changed.insert("b.txt".to_string(), entry("dd"));
    store.write_hashes(&id, &changed).unwrap();

    store.restore_hashes(&id, &snapshot).unwrap();
    assert_eq!(store.read_hashes(&id).unwrap(), map);
  }

  #[test]
  fn test_restore_rejects_foreign_snapshot() {
    let (_base, _repo, store, id) = open_store();
    let other_repo = TempDir::new().unwrap();
    let other = store
      .create_or_open(other_repo.path(), "ollama", 4, &RepoConfig::default())
      .unwrap();

    let snapshot = store.snapshot_hashes(&other.repository_id).unwrap();
    assert!(store.restore_hashes(&id, &snapshot).is_err());
  }
}
