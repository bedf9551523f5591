//! Retry with exponential backoff around provider calls.
//!
//! Delay is `retry_delay * 2^attempt` with ±25% jitter, doubled when the
//! previous failure was a rate limit, capped at 30 seconds. Non-retryable
//! error kinds fail immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{info, warn};

use embedding::{EmbeddingError, EmbeddingProvider, RateLimiter};
use ziri_core::config::PipelineConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  pub fn from_config(config: &PipelineConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      base_delay: Duration::from_millis(config.retry_delay_ms),
      max_delay: Duration::from_secs(30),
    }
  }

  /// Backoff before retry number `attempt + 1`.
  pub fn delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
    let mut delay = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
    if rate_limited {
      delay *= 2.0;
    }
    // ±25% jitter
    let jitter = 1.0 + (rand_f64() - 0.5) * 0.5;
    Duration::from_secs_f64(delay * jitter).min(self.max_delay)
  }
}

/// A simple pseudo-random number in [0, 1) for jitter (no external deps).
fn rand_f64() -> f64 {
  use std::time::{SystemTime, UNIX_EPOCH};

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos();

  (nanos as f64 / u32::MAX as f64).fract()
}

#[derive(Debug)]
pub struct EmbedOutcome {
  pub vectors: Vec<Vec<f32>>,
  pub retries: u32,
  /// Round-trip of the successful attempt, fed to the adaptive batcher.
  pub response_time: Duration,
}

/// Embed one batch under the rate limiter, retrying transient failures.
pub async fn embed_with_retry(
  provider: &Arc<dyn EmbeddingProvider>,
  limiter: &RateLimiter,
  texts: &[String],
  estimated_tokens: usize,
  policy: &RetryPolicy,
) -> Result<EmbedOutcome, EmbeddingError> {
  let mut rate_limited_last = false;

  for attempt in 0..=policy.max_retries {
    if attempt > 0 {
      let backoff = policy.delay_for(attempt - 1, rate_limited_last);
      warn!(
        attempt,
        max_retries = policy.max_retries,
        backoff_ms = backoff.as_millis(),
        batch_size = texts.len(),
        "retrying embedding batch after backoff"
      );
      sleep(backoff).await;
    }

    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let start = Instant::now();
    let result = limiter.execute(estimated_tokens, || provider.embed_batch(&refs)).await;
    let response_time = start.elapsed();

    match result {
      Ok(vectors) => {
        if vectors.len() != texts.len() {
          return Err(EmbeddingError::Protocol(format!(
            "got {} vectors for {} texts",
            vectors.len(),
            texts.len()
          )));
        }
        if attempt > 0 {
          info!(attempt, batch_size = texts.len(), "batch succeeded after retry");
        }
        return Ok(EmbedOutcome {
          vectors,
          retries: attempt,
          response_time,
        });
      }
      Err(e) if e.is_retryable() && attempt < policy.max_retries => {
        rate_limited_last = e.is_rate_limit();
        warn!(attempt = attempt + 1, err = %e, "retryable embedding error");
        continue;
      }
      Err(e) => return Err(e),
    }
  }

  unreachable!("loop returns on success or final error")
}
