//! Configuration for the indexing engine.
//!
//! Config priority: project-relative (.ziri/config.toml) > user
//! (~/.config/ziri/config.toml). Unknown keys are rejected at parse time so
//! a typo in a config file fails loudly instead of being silently ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid config at {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("unknown provider '{0}' (not present in [providers])")]
  UnknownProvider(String),
  #[error("invalid configuration: {0}")]
  Invalid(String),
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Embedding provider kinds. Provider selection is a closed enum; each kind
/// maps to one implementation in the embedding crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
  /// Local embedding server (Ollama-compatible API).
  #[default]
  Ollama,
  /// Remote hosted model behind an OpenAI-compatible embeddings endpoint.
  OpenAi,
  /// Remote multi-model router (OpenRouter-compatible API).
  OpenRouter,
}

/// Configuration for a single embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
  /// Which implementation this entry configures.
  pub kind: ProviderKind,

  /// Model name (e.g. "qwen3-embedding", "text-embedding-3-small").
  pub model: String,

  /// Embedding dimensions the model produces.
  pub dimensions: usize,

  /// Base URL of the service. Empty selects the implementation default.
  pub base_url: String,

  /// API key for remote providers. Falls back to the provider's
  /// conventional environment variable when unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub api_key: Option<String>,

  /// Model context length, used to derive a recommended batch size for
  /// local servers (context_length / 512, clamped to 1..=64).
  pub context_length: usize,

  /// Hard token budget per embedding request.
  pub max_tokens_per_request: usize,

  /// Rate limit: requests per trailing 60-second window.
  pub requests_per_minute: usize,

  /// Rate limit: estimated tokens per trailing 60-second window.
  pub tokens_per_minute: usize,

  /// Rate limit: maximum in-flight requests.
  pub concurrent_requests: usize,

  /// Per-request timeout in seconds.
  pub timeout_secs: u64,

  /// Explicit batch size override; auto-derived when unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_batch_size: Option<usize>,
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      kind: ProviderKind::Ollama,
      model: "qwen3-embedding".to_string(),
      dimensions: 1024,
      base_url: String::new(),
      api_key: None,
      context_length: 32768,
      max_tokens_per_request: 8192,
      requests_per_minute: 60,
      tokens_per_minute: 1_000_000,
      concurrent_requests: 5,
      timeout_secs: 30,
      max_batch_size: None,
    }
  }
}

// ============================================================================
// Performance Configuration
// ============================================================================

/// Pipeline resource knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerformanceConfig {
  /// Maximum embedding batches in flight at once (clamped to 1..=10).
  pub concurrency: usize,

  /// Initial adaptive batch size.
  pub batch_size: usize,

  /// Memory cap for backpressure, in MiB.
  pub memory_limit_mb: u64,
}

impl Default for PerformanceConfig {
  fn default() -> Self {
    Self {
      concurrency: 3,
      batch_size: 50,
      memory_limit_mb: 512,
    }
  }
}

// ============================================================================
// Repository Configuration
// ============================================================================

/// Per-repository chunking and discovery settings. Persisted into the
/// repository record so later runs keep the geometry the stored vectors
/// were built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepoConfig {
  /// Target chunk size in characters.
  pub chunk_target_chars: usize,

  /// Overlap between consecutive chunks as a fraction of the target size.
  pub chunk_overlap_ratio: f64,

  /// Hard upper bound on chunk size in characters.
  pub chunk_max_chars: usize,

  /// Files at or below this size become a single chunk.
  pub chunk_min_chars: usize,

  /// Extra exclusion globs appended to the built-in list.
  pub exclude_patterns: Vec<String>,

  /// Files larger than this are never read.
  pub max_file_size_bytes: u64,
}

impl Default for RepoConfig {
  fn default() -> Self {
    Self {
      chunk_target_chars: 2000,
      chunk_overlap_ratio: 0.15,
      chunk_max_chars: 4000,
      chunk_min_chars: 120,
      exclude_patterns: Vec::new(),
      max_file_size_bytes: 1024 * 1024, // 1MB
    }
  }
}

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Retry and adaptation tuning for the embedding pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
  /// Adaptive batcher target round-trip time in milliseconds.
  pub target_response_time_ms: u64,

  /// Retry attempts around a failed embedding batch.
  pub max_retries: u32,

  /// Base delay for exponential backoff in milliseconds.
  pub retry_delay_ms: u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      target_response_time_ms: 2000,
      max_retries: 3,
      retry_delay_ms: 1000,
    }
  }
}

// ============================================================================
// Checkpoint Configuration
// ============================================================================

/// Checkpoint cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
  /// Write a checkpoint every this many processed files.
  pub interval_items: usize,

  /// Checkpoints retained per repository; older files are purged.
  pub max_checkpoints: usize,

  /// A checkpoint older than this is not offered for resume.
  pub resume_window_hours: u64,
}

impl Default for CheckpointConfig {
  fn default() -> Self {
    Self {
      interval_items: 50,
      max_checkpoints: 3,
      resume_window_hours: 24,
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Provider used when the caller does not name one.
  pub default_provider: String,

  /// Named provider configurations.
  pub providers: BTreeMap<String, ProviderConfig>,

  pub performance: PerformanceConfig,

  pub repo: RepoConfig,

  pub pipeline: PipelineConfig,

  pub checkpoint: CheckpointConfig,
}

impl Default for Config {
  fn default() -> Self {
    let mut providers = BTreeMap::new();
    providers.insert("ollama".to_string(), ProviderConfig::default());
    Self {
      default_provider: "ollama".to_string(),
      providers,
      performance: PerformanceConfig::default(),
      repo: RepoConfig::default(),
      pipeline: PipelineConfig::default(),
      checkpoint: CheckpointConfig::default(),
    }
  }
}

impl Config {
  /// Resolve a provider entry, falling back to `default_provider`.
  pub fn provider(&self, name: Option<&str>) -> Result<(&str, &ProviderConfig), ConfigError> {
    let name = name.unwrap_or(&self.default_provider);
    self
      .providers
      .get_key_value(name)
      .map(|(k, v)| (k.as_str(), v))
      .ok_or_else(|| ConfigError::UnknownProvider(name.to_string()))
  }

  /// Validate invariants that serde cannot express. Fatal at startup.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !self.providers.contains_key(&self.default_provider) {
      return Err(ConfigError::UnknownProvider(self.default_provider.clone()));
    }
    for (name, provider) in &self.providers {
      if provider.dimensions == 0 {
        return Err(ConfigError::Invalid(format!("provider '{name}' has zero dimensions")));
      }
      if provider.max_tokens_per_request == 0 {
        return Err(ConfigError::Invalid(format!(
          "provider '{name}' has zero max_tokens_per_request"
        )));
      }
      if provider.concurrent_requests == 0 {
        return Err(ConfigError::Invalid(format!(
          "provider '{name}' has zero concurrent_requests"
        )));
      }
    }
    if self.repo.chunk_max_chars < self.repo.chunk_target_chars {
      return Err(ConfigError::Invalid(
        "chunk_max_chars must be >= chunk_target_chars".to_string(),
      ));
    }
    if !(0.0..1.0).contains(&self.repo.chunk_overlap_ratio) {
      return Err(ConfigError::Invalid(
        "chunk_overlap_ratio must be in [0.0, 1.0)".to_string(),
      ));
    }
    Ok(())
  }

  /// Load config for a project, falling back to the user config, then to
  /// defaults. A file that exists but fails to parse is a hard error.
  pub fn load_for_project(project_path: &Path) -> Result<Self, ConfigError> {
    let project_config = Self::project_config_path(project_path);
    if project_config.exists() {
      return Self::load_file(&project_config);
    }

    if let Some(user_config) = Self::user_config_path()
      && user_config.exists()
    {
      return Self::load_file(&user_config);
    }

    Ok(Self::default())
  }

  fn load_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Get the user-level config path.
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ZIRI_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("ziri").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("ziri").join("config.toml"))
  }

  /// Get the project-relative config path.
  pub fn project_config_path(project_path: &Path) -> PathBuf {
    project_path.join(".ziri").join("config.toml")
  }

  /// Generate a commented default config file as a string.
  pub fn generate_template() -> String {
    r#"# ziri configuration
# Place in .ziri/config.toml (project) or ~/.config/ziri/config.toml (user)

# Provider used when no provider is named per-call
default_provider = "ollama"

[providers.ollama]
# Provider kind: ollama (local), openai, or openrouter
kind = "ollama"
model = "qwen3-embedding"
# Embedding dimensions (must match model output)
# WARNING: changing dimensions forces a full re-embed
dimensions = 1024
# Server URL; empty selects the implementation default
base_url = ""
# Context length drives the recommended batch size (context / 512, 1..=64)
context_length = 32768
# Hard token budget per embedding request
max_tokens_per_request = 8192
# Rate limits over a trailing 60-second window
requests_per_minute = 60
tokens_per_minute = 1000000
concurrent_requests = 5
# Per-request timeout (seconds)
timeout_secs = 30

[performance]
# Maximum embedding batches in flight (1..=10)
concurrency = 3
# Initial adaptive batch size
batch_size = 50
# Memory cap for backpressure (MiB)
memory_limit_mb = 512

[repo]
chunk_target_chars = 2000
chunk_overlap_ratio = 0.15
chunk_max_chars = 4000
chunk_min_chars = 120
# Extra exclusion globs appended to the built-in list
exclude_patterns = []
max_file_size_bytes = 1048576  # 1MB

[pipeline]
# Adaptive batching target round-trip (milliseconds)
target_response_time_ms = 2000
max_retries = 3
retry_delay_ms = 1000

[checkpoint]
# Checkpoint every N processed files
interval_items = 50
# Checkpoints retained per repository
max_checkpoints = 3
# Checkpoints older than this are not resumed (hours)
resume_window_hours = 24
"#
    .to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.default_provider, "ollama");
    assert_eq!(config.performance.concurrency, 3);
    assert_eq!(config.performance.batch_size, 50);
    assert_eq!(config.performance.memory_limit_mb, 512);
    assert_eq!(config.repo.max_file_size_bytes, 1024 * 1024);
    assert_eq!(config.pipeline.target_response_time_ms, 2000);
    assert_eq!(config.checkpoint.interval_items, 50);
    assert_eq!(config.checkpoint.max_checkpoints, 3);
    config.validate().unwrap();
  }

  #[test]
  fn test_toml_roundtrip() {
    let mut config = Config::default();
    config.performance.concurrency = 5;
    config.repo.exclude_patterns = vec!["generated/**".to_string()];

    let toml_str = toml::to_string_pretty(&config).unwrap();
    let parsed: Config = toml::from_str(&toml_str).unwrap();

    assert_eq!(parsed.performance.concurrency, 5);
    assert_eq!(parsed.repo.exclude_patterns, vec!["generated/**".to_string()]);
  }

  #[test]
  fn test_unknown_keys_rejected() {
    let toml_content = r#"
[performance]
concurrency = 3
concurency_typo = 9
"#;
    let result: Result<Config, _> = toml::from_str(toml_content);
    assert!(result.is_err(), "unknown keys must be rejected at parse time");
  }

  #[test]
  fn test_provider_resolution() {
    let config = Config::default();
    let (name, provider) = config.provider(None).unwrap();
    assert_eq!(name, "ollama");
    assert_eq!(provider.kind, ProviderKind::Ollama);

    assert!(config.provider(Some("missing")).is_err());
  }

  #[test]
  fn test_validate_rejects_unknown_default_provider() {
    let config = Config {
      default_provider: "nowhere".to_string(),
      ..Default::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::UnknownProvider(_))));
  }

  #[test]
  fn test_validate_rejects_bad_chunk_geometry() {
    let mut config = Config::default();
    config.repo.chunk_max_chars = 100;
    config.repo.chunk_target_chars = 2000;
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_project_config() {
    let temp = TempDir::new().unwrap();
    let ziri_dir = temp.path().join(".ziri");
    std::fs::create_dir_all(&ziri_dir).unwrap();

    let config_content = r#"
default_provider = "local"

[providers.local]
kind = "ollama"
dimensions = 768

[performance]
batch_size = 32
"#;
    std::fs::write(ziri_dir.join("config.toml"), config_content).unwrap();

    let config = Config::load_for_project(temp.path()).unwrap();
    assert_eq!(config.default_provider, "local");
    assert_eq!(config.providers["local"].dimensions, 768);
    assert_eq!(config.performance.batch_size, 32);
  }

  #[test]
  fn test_template_parses() {
    let template = Config::generate_template();
    let parsed: Config = toml::from_str(&template).unwrap();
    parsed.validate().unwrap();
    assert_eq!(parsed.performance.concurrency, 3);
  }
}
