//! Adaptive batch formation.
//!
//! Packs queued chunks into provider batches under two limits: the current
//! adaptive batch size and the provider's per-request token budget. Batch
//! size adapts to observed round-trip times with a deliberate asymmetry:
//! one slow response shrinks the batch immediately, growth requires two
//! consecutive fast responses.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use store::ChunkDescriptor;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
  pub initial_batch_size: usize,
  pub min_batch_size: usize,
  pub max_batch_size: usize,
  /// Round-trip time the adaptation steers toward.
  pub target_response_time: Duration,
  /// A response slower than target * this shrinks the batch.
  pub slow_threshold: f64,
  /// A response faster than target * this counts toward growth.
  pub fast_threshold: f64,
  pub shrink_factor: f64,
  pub grow_factor: f64,
}

impl Default for BatcherConfig {
  fn default() -> Self {
    Self {
      initial_batch_size: 50,
      min_batch_size: 10,
      max_batch_size: 200,
      target_response_time: Duration::from_millis(2000),
      slow_threshold: 1.1,
      fast_threshold: 0.9,
      shrink_factor: 0.8,
      grow_factor: 1.2,
    }
  }
}

/// A formed batch plus the chunks that could never fit any batch.
#[derive(Debug, Default)]
pub struct TakenBatch {
  pub chunks: Vec<ChunkDescriptor>,
  /// Chunks whose own token estimate exceeds the provider budget; they
  /// cannot be embedded by this provider and are dropped with a warning.
  pub oversized: Vec<ChunkDescriptor>,
}

#[derive(Debug)]
pub struct AdaptiveBatcher {
  config: BatcherConfig,
  current: usize,
  concurrency: usize,
  consecutive_fast: u32,
}

impl AdaptiveBatcher {
  pub fn new(config: BatcherConfig, concurrency: usize) -> Self {
    let current = config.initial_batch_size.clamp(config.min_batch_size, config.max_batch_size);
    Self {
      config,
      current,
      concurrency: concurrency.clamp(1, 10),
      consecutive_fast: 0,
    }
  }

  pub fn current_batch_size(&self) -> usize {
    self.current
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Manual override; clamps into legal bounds and resets the growth
  /// streak.
  pub fn set_batch_size(&mut self, size: usize) {
    self.current = size.clamp(self.config.min_batch_size, self.config.max_batch_size);
    self.consecutive_fast = 0;
  }

  /// Manual override; clamps into 1..=10.
  pub fn set_concurrency(&mut self, concurrency: usize) {
    self.concurrency = concurrency.clamp(1, 10);
  }

  /// Pop a batch off the queue front.
  ///
  /// Without `force`, an undersized queue is left untouched so more
  /// chunks can accumulate; with `force` (input exhausted) whatever
  /// remains is flushed. The batch token sum never exceeds
  /// `max_tokens_per_request`.
  pub fn take_batch(&mut self, queue: &mut VecDeque<ChunkDescriptor>, max_tokens_per_request: usize, force: bool) -> TakenBatch {
    let mut taken = TakenBatch::default();

    // Shed chunks that can never fit before judging queue readiness
    while let Some(front) = queue.front() {
      if front.estimated_tokens > max_tokens_per_request {
        let chunk = queue.pop_front().expect("front just observed");
        warn!(
          chunk_id = %chunk.chunk_id,
          path = %chunk.relative_path,
          estimated_tokens = chunk.estimated_tokens,
          budget = max_tokens_per_request,
          "chunk exceeds provider token budget, dropping"
        );
        taken.oversized.push(chunk);
      } else {
        break;
      }
    }

    if queue.is_empty() {
      return taken;
    }
    if !force && queue.len() < self.current && queued_tokens(queue, max_tokens_per_request) < max_tokens_per_request {
      return taken;
    }

    let mut batch_tokens = 0usize;
    while let Some(front) = queue.front() {
      if front.estimated_tokens > max_tokens_per_request {
        let chunk = queue.pop_front().expect("front just observed");
        warn!(
          chunk_id = %chunk.chunk_id,
          path = %chunk.relative_path,
          estimated_tokens = chunk.estimated_tokens,
          budget = max_tokens_per_request,
          "chunk exceeds provider token budget, dropping"
        );
        taken.oversized.push(chunk);
        continue;
      }
      if taken.chunks.len() >= self.current {
        break;
      }
      if !taken.chunks.is_empty() && batch_tokens + front.estimated_tokens > max_tokens_per_request {
        break;
      }

      let chunk = queue.pop_front().expect("front just observed");
      batch_tokens += chunk.estimated_tokens;
      taken.chunks.push(chunk);
    }

    taken
  }

  /// Feed back one batch's observed round-trip time.
  pub fn record_response_time(&mut self, elapsed: Duration) {
    let target = self.config.target_response_time.as_secs_f64();
    let observed = elapsed.as_secs_f64();

    if observed > target * self.config.slow_threshold {
      // One slow response is enough to shrink
      let shrunk = ((self.current as f64) * self.config.shrink_factor).floor() as usize;
      let next = shrunk.max(self.config.min_batch_size);
      if next != self.current {
        debug!(from = self.current, to = next, elapsed_ms = elapsed.as_millis(), "batch size decreased");
      }
      self.current = next;
      self.consecutive_fast = 0;
    } else if observed < target * self.config.fast_threshold {
      // Growth requires two consecutive fast responses
      self.consecutive_fast += 1;
      if self.consecutive_fast >= 2 {
        let grown = ((self.current as f64) * self.config.grow_factor).floor() as usize;
        let next = grown.min(self.config.max_batch_size);
        if next != self.current {
          debug!(from = self.current, to = next, elapsed_ms = elapsed.as_millis(), "batch size increased");
        }
        self.current = next;
        self.consecutive_fast = 0;
      }
    } else {
      self.consecutive_fast = 0;
    }
  }
}

fn queued_tokens(queue: &VecDeque<ChunkDescriptor>, cap: usize) -> usize {
  let mut total = 0usize;
  for chunk in queue {
    total += chunk.estimated_tokens;
    if total >= cap {
      break;
    }
  }
  total
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;
  use ziri_core::repository::RepositoryId;

  fn chunk(id: &str, tokens: usize) -> ChunkDescriptor {
    ChunkDescriptor {
      chunk_id: id.to_string(),
      repository_id: RepositoryId::from_path(std::path::Path::new("/repo")),
      file_path: PathBuf::from("/repo/a.rs"),
      relative_path: "a.rs".to_string(),
      start_line: 1,
      end_line: 1,
      size_chars: tokens * 4,
      estimated_tokens: tokens,
      content: "x".repeat(tokens * 4),
      language: None,
      symbol_kind: None,
    }
  }

  fn queue_of(count: usize, tokens: usize) -> VecDeque<ChunkDescriptor> {
    (0..count).map(|i| chunk(&format!("chunk_{i}"), tokens)).collect()
  }

  fn batcher() -> AdaptiveBatcher {
    AdaptiveBatcher::new(BatcherConfig::default(), 3)
  }

  #[test]
  fn test_initial_size_clamped() {
    let config = BatcherConfig {
      initial_batch_size: 500,
      ..Default::default()
    };
    let batcher = AdaptiveBatcher::new(config, 3);
    assert_eq!(batcher.current_batch_size(), 200);

    let config = BatcherConfig {
      initial_batch_size: 1,
      ..Default::default()
    };
    let batcher = AdaptiveBatcher::new(config, 3);
    assert_eq!(batcher.current_batch_size(), 10);
  }

  #[test]
  fn test_take_waits_for_full_batch() {
    let mut batcher = batcher();
    let mut queue = queue_of(10, 10); // fewer than 50

    let taken = batcher.take_batch(&mut queue, 8192, false);
    assert!(taken.chunks.is_empty());
    assert_eq!(queue.len(), 10);
  }

  #[test]
  fn test_take_flushes_when_forced() {
    let mut batcher = batcher();
    let mut queue = queue_of(10, 10);

    let taken = batcher.take_batch(&mut queue, 8192, true);
    assert_eq!(taken.chunks.len(), 10);
    assert!(queue.is_empty());
  }

  #[test]
  fn test_take_respects_batch_size() {
    let mut batcher = batcher();
    let mut queue = queue_of(120, 10);

    let taken = batcher.take_batch(&mut queue, 8192, false);
    assert_eq!(taken.chunks.len(), 50);
    assert_eq!(queue.len(), 70);
  }

  #[test]
  fn test_take_respects_token_budget() {
    let mut batcher = batcher();
    let mut queue = queue_of(100, 1000);

    let taken = batcher.take_batch(&mut queue, 3500, true);
    // 3 chunks of 1000 tokens fit a 3500 budget; the 4th would exceed it
    assert_eq!(taken.chunks.len(), 3);
    let total: usize = taken.chunks.iter().map(|c| c.estimated_tokens).sum();
    assert!(total <= 3500);
  }

  #[test]
  fn test_oversized_chunks_dropped() {
    let mut batcher = batcher();
    let mut queue = VecDeque::new();
    queue.push_back(chunk("chunk_huge", 10_000));
    queue.push_back(chunk("chunk_ok", 100));

    let taken = batcher.take_batch(&mut queue, 8192, true);
    assert_eq!(taken.oversized.len(), 1);
    assert_eq!(taken.oversized[0].chunk_id, "chunk_huge");
    assert_eq!(taken.chunks.len(), 1);
  }

  #[test]
  fn test_single_slow_response_shrinks() {
    let mut batcher = batcher();
    assert_eq!(batcher.current_batch_size(), 50);

    batcher.record_response_time(Duration::from_millis(2500));
    assert_eq!(batcher.current_batch_size(), 40); // floor(50 * 0.8)
  }

  #[test]
  fn test_growth_requires_two_consecutive_fast() {
    let mut batcher = batcher();

    batcher.record_response_time(Duration::from_millis(500));
    assert_eq!(batcher.current_batch_size(), 50, "one fast response must not grow");

    batcher.record_response_time(Duration::from_millis(500));
    assert_eq!(batcher.current_batch_size(), 60); // floor(50 * 1.2)
  }

  #[test]
  fn test_neutral_response_resets_fast_streak() {
    let mut batcher = batcher();

    batcher.record_response_time(Duration::from_millis(500)); // fast
    batcher.record_response_time(Duration::from_millis(2000)); // neutral
    batcher.record_response_time(Duration::from_millis(500)); // fast again
    assert_eq!(batcher.current_batch_size(), 50, "streak must reset on neutral");
  }

  #[test]
  fn test_adaptation_stays_in_bounds() {
    let mut batcher = batcher();

    for _ in 0..50 {
      batcher.record_response_time(Duration::from_millis(10_000));
    }
    assert_eq!(batcher.current_batch_size(), 10);

    for _ in 0..200 {
      batcher.record_response_time(Duration::from_millis(100));
    }
    assert_eq!(batcher.current_batch_size(), 200);
  }

  #[test]
  fn test_manual_overrides_clamp() {
    let mut batcher = batcher();

    batcher.set_batch_size(5);
    assert_eq!(batcher.current_batch_size(), 10);
    batcher.set_batch_size(1000);
    assert_eq!(batcher.current_batch_size(), 200);
    batcher.set_batch_size(75);
    assert_eq!(batcher.current_batch_size(), 75);

    batcher.set_concurrency(0);
    assert_eq!(batcher.concurrency(), 1);
    batcher.set_concurrency(99);
    assert_eq!(batcher.concurrency(), 10);
  }
}
