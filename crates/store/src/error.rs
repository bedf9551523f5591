use std::path::PathBuf;

/// Storage failures are fatal: corruption must surface with enough context
/// to act on, never be papered over.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid json at {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("repository {repository} not found in store")]
  NotFound { repository: String },
  #[error("repository {repository} storage is corrupt: {detail}")]
  Corrupt { repository: String, detail: String },
  #[error("repository {repository} has on-disk schema version {found}, this build expects {expected}")]
  VersionMismatch {
    repository: String,
    found: u32,
    expected: u32,
  },
}

impl StoreError {
  pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
    let path = path.into();
    move |source| Self::Io { path, source }
  }

  pub(crate) fn json(path: impl Into<PathBuf>) -> impl FnOnce(serde_json::Error) -> Self {
    let path = path.into();
    move |source| Self::Json { path, source }
  }
}

pub type Result<T> = std::result::Result<T, StoreError>;
