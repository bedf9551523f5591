//! The repository store root: directory layout, metadata, lifecycle.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use ziri_core::config::RepoConfig;
use ziri_core::repository::{RepositoryId, RepositoryRecord, SCHEMA_VERSION};

use crate::error::{Result, StoreError};

/// Base directory for all repository data.
///
/// `ZIRI_HOME` overrides; otherwise `~/.ziri`.
pub fn default_base_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("ZIRI_HOME") {
    return PathBuf::from(dir);
  }

  dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".ziri")
}

/// Structural check result for one repository directory.
#[derive(Debug, Default)]
pub struct ValidationReport {
  pub errors: Vec<String>,
  pub warnings: Vec<String>,
}

impl ValidationReport {
  pub fn is_valid(&self) -> bool {
    self.errors.is_empty()
  }
}

/// Handle over the store base directory.
///
/// The store offers no locking: ordering of concurrent operations on the
/// same repository is undefined and callers must serialize them. Distinct
/// repositories are fully independent.
#[derive(Debug, Clone)]
pub struct RepositoryStore {
  base_dir: PathBuf,
}

impl RepositoryStore {
  pub fn new(base_dir: impl Into<PathBuf>) -> Self {
    Self {
      base_dir: base_dir.into(),
    }
  }

  pub fn open_default() -> Self {
    Self::new(default_base_dir())
  }

  pub fn base_dir(&self) -> &Path {
    &self.base_dir
  }

  pub fn repositories_dir(&self) -> PathBuf {
    self.base_dir.join("repositories")
  }

  pub fn repo_dir(&self, id: &RepositoryId) -> PathBuf {
    self.repositories_dir().join(id.as_str())
  }

  pub(crate) fn metadata_path(&self, id: &RepositoryId) -> PathBuf {
    self.repo_dir(id).join("metadata.json")
  }

  pub(crate) fn hashes_path(&self, id: &RepositoryId) -> PathBuf {
    self.repo_dir(id).join("file_hashes.json")
  }

  pub(crate) fn config_path(&self, id: &RepositoryId) -> PathBuf {
    self.repo_dir(id).join("config.json")
  }

  pub(crate) fn vectors_dir(&self, id: &RepositoryId) -> PathBuf {
    self.repo_dir(id).join("vectors")
  }

  pub(crate) fn chunks_dir(&self, id: &RepositoryId) -> PathBuf {
    self.repo_dir(id).join("chunks")
  }

  pub(crate) fn checkpoints_dir(&self, id: &RepositoryId) -> PathBuf {
    self.repo_dir(id).join("checkpoints")
  }

  /// Open the repository for `path`, creating it on first use.
  ///
  /// Idempotent: when the directory already holds valid metadata the
  /// existing record is returned unchanged and `init_config` is ignored.
  pub fn create_or_open(
    &self,
    path: &Path,
    provider: &str,
    dimensions: usize,
    init_config: &RepoConfig,
  ) -> Result<RepositoryRecord> {
    let id = RepositoryId::from_path(path);
    let metadata_path = self.metadata_path(&id);

    if metadata_path.exists() {
      let record = self.read_metadata(&id)?;
      debug!(repository = %id, alias = %record.alias, "opened existing repository");
      return Ok(record);
    }

    for dir in [
      self.repo_dir(&id),
      self.vectors_dir(&id),
      self.chunks_dir(&id),
      self.checkpoints_dir(&id),
    ] {
      std::fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
    }

    let record = RepositoryRecord::new(path, provider, dimensions, init_config.clone());
    self.write_metadata(&record)?;
    write_json_atomic(&self.config_path(&id), init_config)?;
    // Start from an explicitly empty hash map rather than an absent file
    crate::hashes::write_hash_file(&self.hashes_path(&id), &Default::default())?;

    info!(repository = %id, alias = %record.alias, path = %path.display(), "created repository");
    Ok(record)
  }

  pub fn read_metadata(&self, id: &RepositoryId) -> Result<RepositoryRecord> {
    let path = self.metadata_path(id);
    if !path.exists() {
      return Err(StoreError::NotFound {
        repository: id.to_string(),
      });
    }
    let content = std::fs::read_to_string(&path).map_err(StoreError::io(&path))?;
    let record: RepositoryRecord = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
      repository: id.to_string(),
      detail: format!("metadata.json: {e}"),
    })?;

    if record.version != SCHEMA_VERSION {
      return Err(StoreError::VersionMismatch {
        repository: id.to_string(),
        found: record.version,
        expected: SCHEMA_VERSION,
      });
    }

    Ok(record)
  }

  pub fn write_metadata(&self, record: &RepositoryRecord) -> Result<()> {
    write_json_atomic(&self.metadata_path(&record.repository_id), record)
  }

  pub fn read_repo_config(&self, id: &RepositoryId) -> Result<RepoConfig> {
    let path = self.config_path(id);
    let content = std::fs::read_to_string(&path).map_err(StoreError::io(&path))?;
    serde_json::from_str(&content).map_err(StoreError::json(&path))
  }

  /// Recursively remove everything the store holds for this repository.
  pub fn delete_repository(&self, id: &RepositoryId) -> Result<()> {
    let dir = self.repo_dir(id);
    if !dir.exists() {
      return Err(StoreError::NotFound {
        repository: id.to_string(),
      });
    }
    std::fs::remove_dir_all(&dir).map_err(StoreError::io(&dir))?;
    info!(repository = %id, "deleted repository");
    Ok(())
  }

  /// List records for every repository directory that opens cleanly.
  pub fn list_repositories(&self) -> Result<Vec<RepositoryRecord>> {
    let dir = self.repositories_dir();
    if !dir.exists() {
      return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let entries = std::fs::read_dir(&dir).map_err(StoreError::io(&dir))?;
    for entry in entries.flatten() {
      let metadata_path = entry.path().join("metadata.json");
      if !metadata_path.exists() {
        continue;
      }
      match std::fs::read_to_string(&metadata_path)
        .ok()
        .and_then(|c| serde_json::from_str::<RepositoryRecord>(&c).ok())
      {
        Some(record) => records.push(record),
        None => warn!(path = %metadata_path.display(), "skipping unreadable repository metadata"),
      }
    }
    records.sort_by(|a, b| a.alias.cmp(&b.alias));
    Ok(records)
  }

  /// Structural check. Missing metadata is an error; missing optional
  /// files are warnings.
  pub fn validate(&self, id: &RepositoryId) -> ValidationReport {
    let mut report = ValidationReport::default();

    let repo_dir = self.repo_dir(id);
    if !repo_dir.exists() {
      report.errors.push(format!("repository directory {} missing", repo_dir.display()));
      return report;
    }

    match self.read_metadata(id) {
      Ok(_) => {}
      Err(e) => report.errors.push(e.to_string()),
    }

    if !self.hashes_path(id).exists() {
      report
        .warnings
        .push("file_hashes.json missing; next run re-hashes every file".to_string());
    }
    if !self.config_path(id).exists() {
      report
        .warnings
        .push("config.json missing; defaults apply on the next run".to_string());
    }
    for (name, dir) in [
      ("vectors", self.vectors_dir(id)),
      ("chunks", self.chunks_dir(id)),
      ("checkpoints", self.checkpoints_dir(id)),
    ] {
      if !dir.exists() {
        report.warnings.push(format!("{name} directory missing"));
      }
    }

    report
  }

  // ==========================================================================
  // Vector reset / swap
  // ==========================================================================

  /// Purge every stored vector, leaving hashes and chunk descriptors
  /// intact. Used when a provider switch changes dimensions and every
  /// chunk must be re-embedded.
  pub fn reset_vectors(&self, id: &RepositoryId) -> Result<()> {
    let dir = self.vectors_dir(id);
    if dir.exists() {
      std::fs::remove_dir_all(&dir).map_err(StoreError::io(&dir))?;
    }
    std::fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
    info!(repository = %id, "vector set reset");
    Ok(())
  }

  fn vectors_backup_dir(&self, id: &RepositoryId) -> PathBuf {
    self.repo_dir(id).join("vectors.bak")
  }

  /// Set the previous vector set aside and start an empty one. The old
  /// vectors survive until `commit_vector_swap`; `rollback_vector_swap`
  /// restores them if the re-embed does not complete.
  pub fn begin_vector_swap(&self, id: &RepositoryId) -> Result<()> {
    let vectors = self.vectors_dir(id);
    let backup = self.vectors_backup_dir(id);

    if backup.exists() {
      // A previous swap never resolved; the backup is the trustworthy set.
      std::fs::remove_dir_all(&vectors).map_err(StoreError::io(&vectors))?;
    } else if vectors.exists() {
      std::fs::rename(&vectors, &backup).map_err(StoreError::io(&vectors))?;
    }
    std::fs::create_dir_all(&vectors).map_err(StoreError::io(&vectors))?;
    debug!(repository = %id, "vector swap started");
    Ok(())
  }

  pub fn commit_vector_swap(&self, id: &RepositoryId) -> Result<()> {
    let backup = self.vectors_backup_dir(id);
    if backup.exists() {
      std::fs::remove_dir_all(&backup).map_err(StoreError::io(&backup))?;
    }
    debug!(repository = %id, "vector swap committed");
    Ok(())
  }

  pub fn rollback_vector_swap(&self, id: &RepositoryId) -> Result<()> {
    let vectors = self.vectors_dir(id);
    let backup = self.vectors_backup_dir(id);
    if backup.exists() {
      if vectors.exists() {
        std::fs::remove_dir_all(&vectors).map_err(StoreError::io(&vectors))?;
      }
      std::fs::rename(&backup, &vectors).map_err(StoreError::io(&backup))?;
      info!(repository = %id, "vector swap rolled back");
    }
    Ok(())
  }
}

/// Write-temp + rename so readers never see a partial file.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let parent = path.parent().unwrap_or_else(|| Path::new("."));
  std::fs::create_dir_all(parent).map_err(StoreError::io(parent))?;

  let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
  std::fs::write(&tmp, bytes).map_err(StoreError::io(&tmp))?;
  std::fs::rename(&tmp, path).map_err(StoreError::io(path))?;
  Ok(())
}

pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
  let bytes = serde_json::to_vec_pretty(value).map_err(StoreError::json(path))?;
  write_bytes_atomic(path, &bytes)
}
