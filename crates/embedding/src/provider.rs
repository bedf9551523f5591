//! The embedding provider capability.
//!
//! The pipeline depends on this trait alone: a provider turns an ordered
//! slice of texts into an equally ordered vector of embeddings. Variants
//! (local server, remote hosted model, remote multi-model router) are
//! distinct implementations selected by a closed configuration enum.
//!
//! Implementations own only transport-level behavior (timeouts, status
//! classification). Retry with backoff is the pipeline's responsibility.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ziri_core::config::{Config, ConfigError, ProviderConfig, ProviderKind};

use crate::{OllamaProvider, OpenAiProvider, OpenRouterProvider};

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("no api key configured for provider")]
  NoApiKey,
  #[error("authentication rejected: {0}")]
  Auth(String),
  #[error("rate limited")]
  RateLimited { retry_after: Option<Duration> },
  #[error("request timed out")]
  Timeout,
  #[error("network error: {0}")]
  Network(String),
  #[error("unknown or unavailable model: {0}")]
  InvalidModel(String),
  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },
  #[error("client error ({status}): {message}")]
  Client { status: u16, message: String },
  #[error("provider protocol error: {0}")]
  Protocol(String),
}

impl EmbeddingError {
  /// Whether the pipeline should retry this failure with backoff.
  ///
  /// 429, 5xx, timeouts and network errors are transient; auth failures,
  /// unknown models and other 4xx are not.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::RateLimited { .. } | Self::Timeout | Self::Network(_) | Self::Server { .. }
    )
  }

  pub fn is_rate_limit(&self) -> bool {
    matches!(self, Self::RateLimited { .. })
  }

  /// Classify an HTTP status into an error kind.
  pub fn from_status(status: u16, message: String) -> Self {
    match status {
      401 | 403 => Self::Auth(message),
      404 => Self::InvalidModel(message),
      429 => Self::RateLimited { retry_after: None },
      400..=499 => Self::Client { status, message },
      _ => Self::Server { status, message },
    }
  }

  /// Classify a transport error from the HTTP client.
  pub fn from_transport(error: reqwest::Error) -> Self {
    if error.is_timeout() {
      Self::Timeout
    } else {
      Self::Network(error.to_string())
    }
  }
}

/// Static limits a provider operates under. The rate limiter and batcher
/// are configured from these.
#[derive(Debug, Clone, Copy)]
pub struct ProviderLimits {
  pub max_tokens_per_request: usize,
  pub requests_per_minute: usize,
  pub tokens_per_minute: usize,
  pub concurrent_requests: usize,
}

impl ProviderLimits {
  pub fn from_config(config: &ProviderConfig) -> Self {
    Self {
      max_tokens_per_request: config.max_tokens_per_request,
      requests_per_minute: config.requests_per_minute,
      tokens_per_minute: config.tokens_per_minute,
      concurrent_requests: config.concurrent_requests,
    }
  }
}

/// Result of a provider self-test.
#[derive(Debug, Clone)]
pub struct ProbeResult {
  pub success: bool,
  pub response_time_ms: u64,
  pub model: Option<String>,
  pub error: Option<String>,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
  fn name(&self) -> &str;
  fn model_id(&self) -> &str;
  fn dimensions(&self) -> usize;
  fn limits(&self) -> ProviderLimits;

  /// Batch size this provider works well with, derived from its token
  /// budget. Callers may clamp further.
  fn recommended_batch_size(&self) -> usize {
    (self.limits().max_tokens_per_request / 512).clamp(1, 64)
  }

  /// Embed a batch of texts.
  ///
  /// The output has exactly one vector per input, in input order. A
  /// dimension mismatch against `dimensions()` is logged as a warning by
  /// implementations, never silently dropped or reordered.
  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

  /// Self-test: a trivial timed embed.
  async fn probe(&self) -> ProbeResult {
    let start = Instant::now();
    match self.embed_batch(&["probe"]).await {
      Ok(_) => ProbeResult {
        success: true,
        response_time_ms: start.elapsed().as_millis() as u64,
        model: Some(self.model_id().to_string()),
        error: None,
      },
      Err(e) => ProbeResult {
        success: false,
        response_time_ms: start.elapsed().as_millis() as u64,
        model: None,
        error: Some(e.to_string()),
      },
    }
  }
}

impl dyn EmbeddingProvider {
  /// Construct a provider from its configuration entry.
  pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.kind {
      ProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(name, config)?)),
      ProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::new(name, config)?)),
      ProviderKind::OpenRouter => Ok(Arc::new(OpenRouterProvider::new(name, config)?)),
    }
  }
}

/// Explicitly constructed set of providers. The pipeline receives a
/// registry instead of reaching for process-wide state.
pub struct ProviderRegistry {
  providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
  default_name: String,
}

impl ProviderRegistry {
  /// Build every configured provider. Fails fast on the first provider
  /// that cannot be constructed (missing key, etc.).
  pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
    config.validate()?;

    let mut providers = HashMap::new();
    for (name, provider_config) in &config.providers {
      let provider =
        <dyn EmbeddingProvider>::from_config(name, provider_config).map_err(|source| RegistryError::Provider {
          provider: name.clone(),
          source,
        })?;
      providers.insert(name.clone(), provider);
    }

    Ok(Self {
      providers,
      default_name: config.default_provider.clone(),
    })
  }

  /// Build a registry around pre-constructed providers (used by tests and
  /// embedded callers).
  pub fn from_providers(default_name: &str, providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
    let providers: HashMap<_, _> = providers.into_iter().map(|p| (p.name().to_string(), p)).collect();
    Self {
      providers,
      default_name: default_name.to_string(),
    }
  }

  pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>, RegistryError> {
    let name = name.unwrap_or(&self.default_name);
    self
      .providers
      .get(name)
      .cloned()
      .ok_or_else(|| RegistryError::Unknown(name.to_string()))
  }

  pub fn default_name(&self) -> &str {
    &self.default_name
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.providers.keys().map(String::as_str)
  }

  /// Probe every provider, returning (name, result) pairs.
  pub async fn probe_all(&self) -> Vec<(String, ProbeResult)> {
    let mut results = Vec::with_capacity(self.providers.len());
    for (name, provider) in &self.providers {
      results.push((name.clone(), provider.probe().await));
    }
    results
  }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("provider '{provider}' could not be constructed: {source}")]
  Provider {
    provider: String,
    #[source]
    source: EmbeddingError,
  },
  #[error("unknown provider '{0}'")]
  Unknown(String),
}
