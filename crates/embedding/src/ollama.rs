//! Local embedding server provider (Ollama-compatible `/api/embed`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};
use ziri_core::config::ProviderConfig;

use crate::provider::{EmbeddingError, EmbeddingProvider, ProviderLimits};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Sub-batches dispatched concurrently to the local server. The GPU is the
/// bottleneck, so this stays small regardless of configured concurrency.
const MAX_CONCURRENT_SUB_BATCHES: usize = 4;

/// Max texts per request, derived from the model context length.
/// Formula: clamp(context_length / avg_chunk_tokens, 1, 64)
fn calculate_max_batch_size(context_length: usize) -> usize {
  (context_length / 512).clamp(1, 64)
}

#[derive(Debug, Clone)]
pub struct OllamaProvider {
  client: reqwest::Client,
  name: String,
  base_url: String,
  model: String,
  dimensions: usize,
  limits: ProviderLimits,
  /// Maximum texts per single request to the server.
  max_batch_size: usize,
}

impl OllamaProvider {
  pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, EmbeddingError> {
    let base_url = if config.base_url.is_empty() {
      DEFAULT_BASE_URL.to_string()
    } else {
      config.base_url.trim_end_matches('/').to_string()
    };
    let max_batch_size = config
      .max_batch_size
      .unwrap_or_else(|| calculate_max_batch_size(config.context_length));

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(EmbeddingError::from_transport)?;

    info!(
      name,
      base_url,
      model = %config.model,
      dimensions = config.dimensions,
      max_batch_size,
      "ollama provider initialized"
    );

    Ok(Self {
      client,
      name: name.to_string(),
      base_url,
      model: config.model.clone(),
      dimensions: config.dimensions,
      limits: ProviderLimits::from_config(config),
      max_batch_size,
    })
  }

  fn embed_url(&self) -> String {
    format!("{}/api/embed", self.base_url)
  }

  /// Embed a single request-sized batch.
  async fn embed_single_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let request = BatchEmbeddingRequest {
      model: &self.model,
      input: texts.to_vec(),
    };

    trace!(batch_size = texts.len(), model = %self.model, "sending embedding request");
    let start = Instant::now();

    let response = self
      .client
      .post(self.embed_url())
      .json(&request)
      .send()
      .await
      .map_err(EmbeddingError::from_transport)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, batch_size = texts.len(), "ollama embedding request failed");
      return Err(EmbeddingError::from_status(status.as_u16(), body));
    }

    let result: BatchEmbeddingResponse = response
      .json()
      .await
      .map_err(|e| EmbeddingError::Protocol(format!("malformed embedding response: {e}")))?;

    trace!(
      embeddings = result.embeddings.len(),
      elapsed_ms = start.elapsed().as_millis(),
      "parsed embedding response"
    );

    if result.embeddings.len() != texts.len() {
      return Err(EmbeddingError::Protocol(format!(
        "got {} embeddings for {} inputs",
        result.embeddings.len(),
        texts.len()
      )));
    }

    for (i, embedding) in result.embeddings.iter().enumerate() {
      if embedding.len() != self.dimensions {
        warn!(
          index = i,
          expected = self.dimensions,
          got = embedding.len(),
          model = %self.model,
          "unexpected embedding dimensions"
        );
      }
    }

    Ok(result.embeddings)
  }
}

/// Request for batch embedding (`/api/embed`).
#[derive(Debug, Serialize)]
struct BatchEmbeddingRequest<'a> {
  model: &'a str,
  input: Vec<&'a str>,
}

/// Response from batch embedding (`/api/embed`).
#[derive(Debug, Deserialize)]
struct BatchEmbeddingResponse {
  embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
  fn name(&self) -> &str {
    &self.name
  }

  fn model_id(&self) -> &str {
    &self.model
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  fn limits(&self) -> ProviderLimits {
    self.limits
  }

  fn recommended_batch_size(&self) -> usize {
    self.max_batch_size
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let num_batches = texts.len().div_ceil(self.max_batch_size);
    if num_batches <= 1 {
      return self.embed_single_batch(texts).await;
    }

    debug!(
      batch_size = texts.len(),
      sub_batches = num_batches,
      max_batch_size = self.max_batch_size,
      "splitting oversized request into concurrent sub-batches"
    );

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SUB_BATCHES));

    let futures: Vec<_> = texts
      .chunks(self.max_batch_size)
      .enumerate()
      .map(|(batch_idx, chunk)| {
        let permit = semaphore.clone();
        let provider = self.clone();
        let chunk_owned: Vec<String> = chunk.iter().map(|s| s.to_string()).collect();
        async move {
          let _permit = permit
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Protocol("semaphore closed".to_string()))?;
          let chunk_refs: Vec<&str> = chunk_owned.iter().map(|s| s.as_str()).collect();
          let embeddings = provider.embed_single_batch(&chunk_refs).await?;
          Ok::<_, EmbeddingError>((batch_idx, embeddings))
        }
      })
      .collect();

    let results = futures::future::join_all(futures).await;

    // Re-assemble in input order
    let mut indexed: Vec<(usize, Vec<Vec<f32>>)> = Vec::with_capacity(num_batches);
    for result in results {
      indexed.push(result?);
    }
    indexed.sort_by_key(|(idx, _)| *idx);

    let mut all = Vec::with_capacity(texts.len());
    for (_, embeddings) in indexed {
      all.extend(embeddings);
    }
    Ok(all)
  }
}
