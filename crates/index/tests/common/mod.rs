//! Shared fixtures for the engine integration tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use embedding::{EmbeddingError, EmbeddingProvider, ProviderLimits, ProviderRegistry};
use index::Indexer;
use index::progress::{IndexPhase, ProgressSink};
use store::RepositoryStore;
use ziri_core::config::Config;

/// How the mock provider behaves per call.
#[derive(Debug, Clone, Copy)]
pub enum MockBehavior {
  Ok,
  /// Every nth request (1-based) fails with a rate limit before
  /// succeeding on retry.
  RateLimitEveryNth(usize),
  /// Every request fails authentication.
  AuthFail,
  /// Sleep this long before answering.
  Delay(Duration),
}

pub struct MockProvider {
  pub name: String,
  pub dimensions: usize,
  pub behavior: MockBehavior,
  pub calls: AtomicUsize,
  pub texts_embedded: AtomicUsize,
}

impl MockProvider {
  pub fn new(name: &str, dimensions: usize, behavior: MockBehavior) -> Self {
    Self {
      name: name.to_string(),
      dimensions,
      behavior,
      calls: AtomicUsize::new(0),
      texts_embedded: AtomicUsize::new(0),
    }
  }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
  fn name(&self) -> &str {
    &self.name
  }

  fn model_id(&self) -> &str {
    "mock-model"
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  fn limits(&self) -> ProviderLimits {
    ProviderLimits {
      max_tokens_per_request: 8192,
      requests_per_minute: 10_000,
      tokens_per_minute: 10_000_000,
      concurrent_requests: 8,
    }
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

    match self.behavior {
      MockBehavior::Ok => {}
      MockBehavior::RateLimitEveryNth(n) => {
        if call % n == 0 {
          return Err(EmbeddingError::RateLimited { retry_after: None });
        }
      }
      MockBehavior::AuthFail => {
        return Err(EmbeddingError::Auth("credentials rejected".to_string()));
      }
      MockBehavior::Delay(delay) => {
        tokio::time::sleep(delay).await;
      }
    }

    self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
    Ok(texts.iter().map(|_| vec![0.25; self.dimensions]).collect())
  }
}

/// Progress sink double that records every phase transition.
#[derive(Default)]
pub struct PhaseSpy {
  phases: Mutex<Vec<IndexPhase>>,
}

impl PhaseSpy {
  pub fn phases(&self) -> Vec<IndexPhase> {
    self.phases.lock().unwrap().clone()
  }
}

impl ProgressSink for PhaseSpy {
  fn on_phase(&self, phase: IndexPhase) {
    self.phases.lock().unwrap().push(phase);
  }
}

/// Write a fixture file, creating parent directories.
pub fn write_file(root: &Path, rel: &str, content: &[u8]) {
  let path = root.join(rel);
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(path, content).unwrap();
}

/// Engine over a temp store with one mock provider.
pub fn engine_with(provider: Arc<MockProvider>, store_dir: &Path, mut config: Config) -> (Indexer, Arc<MockProvider>) {
  config.pipeline.retry_delay_ms = 1; // keep test retries fast
  let store = RepositoryStore::new(store_dir);
  let registry = Arc::new(ProviderRegistry::from_providers(
    &provider.name.clone(),
    vec![provider.clone() as Arc<dyn EmbeddingProvider>],
  ));
  (Indexer::new(store, registry, config), provider)
}

pub fn default_engine(store_dir: &Path) -> (Indexer, Arc<MockProvider>) {
  let provider = Arc::new(MockProvider::new("mock", 8, MockBehavior::Ok));
  engine_with(provider, store_dir, Config::default())
}
