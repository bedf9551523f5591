//! Remote hosted-model provider (OpenAI-compatible `/v1/embeddings`).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};
use ziri_core::config::ProviderConfig;

use crate::provider::{EmbeddingError, EmbeddingProvider, ProviderLimits};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
  client: reqwest::Client,
  name: String,
  base_url: String,
  api_key: String,
  model: String,
  dimensions: usize,
  limits: ProviderLimits,
}

impl OpenAiProvider {
  pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, EmbeddingError> {
    let api_key = config
      .api_key
      .clone()
      .or_else(|| std::env::var(API_KEY_ENV).ok())
      .ok_or(EmbeddingError::NoApiKey)?;

    let base_url = if config.base_url.is_empty() {
      DEFAULT_BASE_URL.to_string()
    } else {
      config.base_url.trim_end_matches('/').to_string()
    };

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(EmbeddingError::from_transport)?;

    info!(
      name,
      model = %config.model,
      dimensions = config.dimensions,
      "openai provider initialized"
    );

    Ok(Self {
      client,
      name: name.to_string(),
      base_url,
      api_key,
      model: config.model.clone(),
      dimensions: config.dimensions,
      limits: ProviderLimits::from_config(config),
    })
  }

  fn embeddings_url(&self) -> String {
    format!("{}/v1/embeddings", self.base_url)
  }

  async fn request_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let request = EmbeddingsRequest {
      model: &self.model,
      input: texts.to_vec(),
      encoding_format: "float",
    };

    trace!(batch_size = texts.len(), model = %self.model, "sending embeddings request");
    let start = Instant::now();

    let response = self
      .client
      .post(self.embeddings_url())
      .bearer_auth(&self.api_key)
      .json(&request)
      .send()
      .await
      .map_err(EmbeddingError::from_transport)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, batch_size = texts.len(), "embeddings request failed");
      return Err(EmbeddingError::from_status(status.as_u16(), body));
    }

    let result: EmbeddingsResponse = response
      .json()
      .await
      .map_err(|e| EmbeddingError::Protocol(format!("malformed embeddings response: {e}")))?;

    trace!(
      embeddings = result.data.len(),
      elapsed_ms = start.elapsed().as_millis(),
      "parsed embeddings response"
    );

    if result.data.len() != texts.len() {
      return Err(EmbeddingError::Protocol(format!(
        "got {} embeddings for {} inputs",
        result.data.len(),
        texts.len()
      )));
    }

    // The API tags each element with its input index; re-order defensively
    // so element i is always the vector for texts[i].
    let mut data = result.data;
    data.sort_by_key(|d| d.index);

    for item in &data {
      if item.embedding.len() != self.dimensions {
        warn!(
          index = item.index,
          expected = self.dimensions,
          got = item.embedding.len(),
          model = %self.model,
          "unexpected embedding dimensions"
        );
      }
    }

    Ok(data.into_iter().map(|d| d.embedding).collect())
  }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
  model: &'a str,
  input: Vec<&'a str>,
  encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
  data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
  embedding: Vec<f32>,
  index: usize,
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
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

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }
    self.request_embeddings(texts).await
  }
}
