//! Memory monitoring and producer backpressure.
//!
//! Samples this process's resident memory on an interval. Crossing the
//! critical threshold raises a pause flag that chunk producers await;
//! the flag clears once usage falls back below the warning threshold.
//! In-flight provider calls are never cancelled by memory pressure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MemoryConfig {
  /// Cap the thresholds are computed from.
  pub limit_bytes: u64,
  /// Fraction of the cap that triggers a warning event.
  pub warning_fraction: f64,
  /// Fraction of the cap that pauses producers.
  pub critical_fraction: f64,
  pub sample_interval: Duration,
}

impl Default for MemoryConfig {
  fn default() -> Self {
    Self {
      limit_bytes: 512 * 1024 * 1024,
      warning_fraction: 0.70,
      critical_fraction: 0.85,
      sample_interval: Duration::from_millis(1000),
    }
  }
}

impl MemoryConfig {
  pub fn with_limit_mb(limit_mb: u64) -> Self {
    Self {
      limit_bytes: limit_mb * 1024 * 1024,
      ..Default::default()
    }
  }

  fn warning_bytes(&self) -> u64 {
    (self.limit_bytes as f64 * self.warning_fraction) as u64
  }

  fn critical_bytes(&self) -> u64 {
    (self.limit_bytes as f64 * self.critical_fraction) as u64
  }
}

/// Source of usage readings for the monitor.
///
/// The default reads this process's resident memory via sysinfo.
/// Containerized deployments can substitute a cgroup-aware reader, and
/// tests script readings to exercise the pause/resume path.
pub type UsageProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
  pub current_bytes: u64,
  pub peak_bytes: u64,
  pub average_bytes: u64,
  pub samples: u64,
  /// Collection attempts. This runtime exposes no collector hook, so the
  /// counter records the trigger, not a reclamation.
  pub gc_count: u64,
  pub warning_count: u64,
  pub pause_count: u64,
}

struct MonitorState {
  system: System,
  pid: Pid,
  current: u64,
  peak: u64,
  total: u64,
  samples: u64,
  gc_count: u64,
  warning_count: u64,
  pause_count: u64,
  above_warning: bool,
}

/// Shared handle over the sampling state and the pause gate.
#[derive(Clone)]
pub struct MemoryMonitor {
  config: MemoryConfig,
  state: Arc<Mutex<MonitorState>>,
  probe: Option<UsageProbe>,
  pause_tx: Arc<watch::Sender<bool>>,
  pause_rx: watch::Receiver<bool>,
}

impl MemoryMonitor {
  pub fn new(config: MemoryConfig) -> Self {
    Self::build(config, None)
  }

  /// Monitor with a caller-supplied usage probe instead of the process
  /// RSS reader.
  pub fn with_probe(config: MemoryConfig, probe: UsageProbe) -> Self {
    Self::build(config, Some(probe))
  }

  fn build(config: MemoryConfig, probe: Option<UsageProbe>) -> Self {
    let (pause_tx, pause_rx) = watch::channel(false);
    Self {
      config,
      state: Arc::new(Mutex::new(MonitorState {
        system: System::new(),
        pid: Pid::from_u32(std::process::id()),
        current: 0,
        peak: 0,
        total: 0,
        samples: 0,
        gc_count: 0,
        warning_count: 0,
        pause_count: 0,
        above_warning: false,
      })),
      probe,
      pause_tx: Arc::new(pause_tx),
      pause_rx,
    }
  }

  /// Spawn the periodic sampling task; it stops when `cancel` fires.
  pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(monitor.config.sample_interval);
      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = interval.tick() => {
            monitor.sample();
          }
        }
      }
    })
  }

  /// Take one sample and update thresholds. Returns current usage.
  pub fn sample(&self) -> u64 {
    let mut state = self.state.lock().expect("memory monitor state poisoned");

    let usage = match &self.probe {
      Some(probe) => probe(),
      None => {
        state.system.refresh_all();
        state.system.process(state.pid).map(|p| p.memory()).unwrap_or(0)
      }
    };
    state.current = usage;
    state.peak = state.peak.max(usage);
    state.total += usage;
    state.samples += 1;

    let warning = self.config.warning_bytes();
    let critical = self.config.critical_bytes();
    let paused = *self.pause_rx.borrow();

    if usage >= warning && !state.above_warning {
      state.above_warning = true;
      state.warning_count += 1;
      // Collection hook: nothing to invoke on this runtime, the attempt
      // is still recorded so reports stay faithful
      state.gc_count += 1;
      warn!(
        usage_mb = usage / (1024 * 1024),
        limit_mb = self.config.limit_bytes / (1024 * 1024),
        "memory usage crossed warning threshold"
      );
    } else if usage < warning && state.above_warning {
      state.above_warning = false;
    }

    if usage >= critical && !paused {
      state.pause_count += 1;
      warn!(
        usage_mb = usage / (1024 * 1024),
        "memory usage critical, pausing chunk production"
      );
      let _ = self.pause_tx.send(true);
    } else if paused && usage < warning {
      debug!(usage_mb = usage / (1024 * 1024), "memory pressure cleared, resuming");
      let _ = self.pause_tx.send(false);
    }

    usage
  }

  pub fn is_paused(&self) -> bool {
    *self.pause_rx.borrow()
  }

  /// Subscribe to pause-flag transitions.
  pub fn pause_events(&self) -> watch::Receiver<bool> {
    self.pause_rx.clone()
  }

  /// Await until production may continue. Returns immediately when not
  /// paused.
  pub async fn wait_until_clear(&self) {
    let mut rx = self.pause_rx.clone();
    while *rx.borrow() {
      if rx.changed().await.is_err() {
        return;
      }
    }
  }

  pub fn stats(&self) -> MemoryStats {
    let state = self.state.lock().expect("memory monitor state poisoned");
    MemoryStats {
      current_bytes: state.current,
      peak_bytes: state.peak,
      average_bytes: if state.samples > 0 { state.total / state.samples } else { 0 },
      samples: state.samples,
      gc_count: state.gc_count,
      warning_count: state.warning_count,
      pause_count: state.pause_count,
    }
  }

  /// Force the pause flag, for tests and manual throttling.
  #[doc(hidden)]
  pub fn set_paused(&self, paused: bool) {
    let _ = self.pause_tx.send(paused);
  }
}
