// Rate limiter for embedding providers.
//
// Three independent constraints, each measured over a trailing 60-second
// sliding window: requests per minute, estimated tokens per minute, and a
// hard cap on in-flight requests. A request is admitted only when all
// three permit; blocked requests sleep until the earliest instant any
// constraint releases a slot. Admission order is FIFO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, trace};

use crate::provider::ProviderLimits;

/// The trailing window every per-minute constraint is measured over.
const WINDOW: Duration = Duration::from_secs(60);

/// Configuration for rate limiting.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
  /// Maximum requests in the trailing window.
  pub requests_per_minute: usize,
  /// Maximum estimated tokens in the trailing window.
  pub tokens_per_minute: usize,
  /// Maximum in-flight requests at any instant.
  pub concurrent_requests: usize,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      requests_per_minute: 60,
      tokens_per_minute: 1_000_000,
      concurrent_requests: 5,
    }
  }
}

impl From<ProviderLimits> for RateLimitConfig {
  fn from(limits: ProviderLimits) -> Self {
    Self {
      requests_per_minute: limits.requests_per_minute,
      tokens_per_minute: limits.tokens_per_minute,
      concurrent_requests: limits.concurrent_requests,
    }
  }
}

/// Sliding-window state shared by all callers of one limiter.
#[derive(Debug)]
struct WindowState {
  /// Timestamps of admitted requests within the window.
  request_times: VecDeque<Instant>,
  /// (admission time, estimated tokens) pairs within the window.
  token_events: VecDeque<(Instant, usize)>,
  /// Running sum of `token_events`.
  tokens_in_window: usize,
  /// Requests currently in flight.
  active: usize,
}

impl WindowState {
  fn new() -> Self {
    Self {
      request_times: VecDeque::new(),
      token_events: VecDeque::new(),
      tokens_in_window: 0,
      active: 0,
    }
  }

  /// Remove expired entries from both windows.
  fn prune_expired(&mut self, now: Instant) {
    // Early in process life `now - WINDOW` can underflow; nothing can
    // have expired yet in that case
    let Some(cutoff) = now.checked_sub(WINDOW) else {
      return;
    };
    while let Some(&oldest) = self.request_times.front() {
      if oldest < cutoff {
        self.request_times.pop_front();
      } else {
        break;
      }
    }
    while let Some(&(oldest, tokens)) = self.token_events.front() {
      if oldest < cutoff {
        self.tokens_in_window -= tokens;
        self.token_events.pop_front();
      } else {
        break;
      }
    }
  }

  /// Check all three constraints. Returns `None` when a request with
  /// `estimated_tokens` may be admitted now, or the wait until the
  /// earliest constraint could release.
  fn wait_time(&mut self, estimated_tokens: usize, config: &RateLimitConfig) -> Option<Duration> {
    let now = Instant::now();
    self.prune_expired(now);

    let mut wait: Option<Duration> = None;
    let mut push_wait = |candidate: Option<Duration>| {
      if let Some(c) = candidate {
        wait = Some(wait.map_or(c, |w: Duration| w.max(c)));
      }
    };

    if self.active >= config.concurrent_requests {
      // No timestamp to wait on; poll again shortly after an in-flight
      // request has had a chance to finish.
      push_wait(Some(Duration::from_millis(50)));
    }

    if self.request_times.len() >= config.requests_per_minute {
      push_wait(self.request_times.front().map(|&oldest| {
        let expires_at = oldest + WINDOW;
        expires_at.saturating_duration_since(now)
      }));
    }

    if self.tokens_in_window + estimated_tokens > config.tokens_per_minute {
      // When the window is empty the request alone exceeds the budget;
      // waiting would never admit it, so it passes and overshoots once.
      push_wait(self.token_events.front().map(|&(oldest, _)| {
        let expires_at = oldest + WINDOW;
        expires_at.saturating_duration_since(now)
      }));
    }

    wait
  }

  fn record(&mut self, estimated_tokens: usize) {
    let now = Instant::now();
    self.request_times.push_back(now);
    self.token_events.push_back((now, estimated_tokens));
    self.tokens_in_window += estimated_tokens;
    self.active += 1;
  }
}

/// Status view over a limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStatus {
  pub requests_in_last_minute: usize,
  pub tokens_in_last_minute: usize,
  pub active_requests: usize,
  pub queued: usize,
  pub can_make_request: bool,
}

/// Per-provider rate limiter shared among all batches targeting that
/// provider instance.
#[derive(Debug)]
pub struct RateLimiter {
  config: RateLimitConfig,
  state: Arc<Mutex<WindowState>>,
  /// FIFO admission queue: waiters hold this fair async mutex in arrival
  /// order while they sleep on constraint release.
  admission: tokio::sync::Mutex<()>,
  queued: AtomicUsize,
}

impl RateLimiter {
  pub fn new(config: RateLimitConfig) -> Self {
    Self {
      config,
      state: Arc::new(Mutex::new(WindowState::new())),
      admission: tokio::sync::Mutex::new(()),
      queued: AtomicUsize::new(0),
    }
  }

  pub fn for_provider(limits: ProviderLimits) -> Self {
    Self::new(RateLimitConfig::from(limits))
  }

  /// Run `op` once all three constraints admit it.
  ///
  /// Cancellation propagates: dropping the returned future while queued
  /// removes the entry without recording anything; dropping it while the
  /// operation runs still releases the in-flight slot.
  pub async fn execute<T, F, Fut>(&self, estimated_tokens: usize, op: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    self.acquire(estimated_tokens).await;
    let _slot = ActiveSlot(self.state.clone());
    op().await
  }

  async fn acquire(&self, estimated_tokens: usize) {
    let _queue_marker = QueueMarker::enter(&self.queued);
    let _turn = self.admission.lock().await;

    loop {
      let wait = {
        let mut state = self.state.lock().expect("rate limiter state poisoned");
        let wait = state.wait_time(estimated_tokens, &self.config);
        if wait.is_none() {
          state.record(estimated_tokens);
          trace!(
            requests = state.request_times.len(),
            tokens = state.tokens_in_window,
            active = state.active,
            "rate limiter: slot acquired"
          );
        }
        wait
      };

      match wait {
        None => return,
        Some(wait) => {
          debug!(wait_ms = wait.as_millis(), "rate limiter: waiting for slot");
          sleep(wait.max(Duration::from_millis(1))).await;
        }
      }
    }
  }

  pub fn status(&self) -> RateLimiterStatus {
    let mut state = self.state.lock().expect("rate limiter state poisoned");
    state.prune_expired(Instant::now());
    RateLimiterStatus {
      requests_in_last_minute: state.request_times.len(),
      tokens_in_last_minute: state.tokens_in_window,
      active_requests: state.active,
      queued: self.queued.load(Ordering::SeqCst),
      can_make_request: state.active < self.config.concurrent_requests
        && state.request_times.len() < self.config.requests_per_minute
        && state.tokens_in_window < self.config.tokens_per_minute,
    }
  }

  pub fn config(&self) -> &RateLimitConfig {
    &self.config
  }
}

/// Decrements the in-flight count when the guarded operation finishes,
/// including when its future is dropped mid-flight.
struct ActiveSlot(Arc<Mutex<WindowState>>);

impl Drop for ActiveSlot {
  fn drop(&mut self) {
    if let Ok(mut state) = self.0.lock() {
      state.active = state.active.saturating_sub(1);
    }
  }
}

struct QueueMarker<'a>(&'a AtomicUsize);

impl<'a> QueueMarker<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for QueueMarker<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}
