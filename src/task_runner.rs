//! Periodic background workers with failure backoff
//!
//! Each worker runs one iteration, then sleeps for its period. Consecutive
//! failures stretch the sleep with exponential backoff (capped) and are
//! escalated once a threshold is reached. Workers stop cooperatively when
//! the shutdown broadcast fires.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Backoff configuration for background workers
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Consecutive failures after which the worker is reported as degraded
    pub escalate_after: u32,
    /// Initial delay after a failure
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            escalate_after: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Internal failure tracking
#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl BackoffState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    /// Returns the delay to wait before the next attempt
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_retry_delay;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
        delay
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Counts reported when a worker stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub iterations: u64,
    pub failures: u64,
}

/// Run `task_fn` every `period` until shutdown is signalled.
///
/// A failing iteration is retried after the backoff delay instead of the
/// period. The worker never gives up on its own.
pub async fn run_periodic<F, Fut>(
    task_name: &str,
    period: Duration,
    config: BackoffConfig,
    mut shutdown: broadcast::Receiver<()>,
    mut task_fn: F,
) -> WorkerStats
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut state = BackoffState::new(config.initial_retry_delay);
    let mut stats = WorkerStats::default();
    info!("Worker '{}' started (every {:?})", task_name, period);

    loop {
        stats.iterations += 1;
        let wait = match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Worker '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                period
            }
            Err(e) => {
                stats.failures += 1;
                let delay = state.record_failure(config.max_retry_delay);
                if state.consecutive_failures >= config.escalate_after {
                    error!(
                        "Worker '{}' is degraded: {} consecutive failures, last error: {}",
                        task_name, state.consecutive_failures, e
                    );
                } else {
                    warn!(
                        "Worker '{}' failed (attempt {}): {}",
                        task_name, state.consecutive_failures, e
                    );
                }
                debug!("Worker '{}' will retry in {:?}", task_name, delay);
                delay
            }
        };

        tokio::select! {
            _ = sleep(wait) => {}
            _ = shutdown.recv() => break,
        }
    }

    info!(
        "Worker '{}' stopped after {} iterations ({} failed)",
        task_name, stats.iterations, stats.failures
    );
    stats
}
