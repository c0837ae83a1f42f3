//! Polling delays for workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::BackoffConfig;

/// Decides how long a worker pauses between polls.
///
/// All waits return early, without error, once `cancel` fires.
#[async_trait]
pub trait BackoffStrategy: Send + Sync {
    /// Short pause while the worker is busy (no free parallelism slot). Never escalates.
    async fn wait(&self, cancel: &CancellationToken);

    /// Pause after an empty receive, then move one tier up.
    async fn wait_no_message(&self, cancel: &CancellationToken);

    /// Pause after a receive or pipeline failure.
    async fn wait_error(&self, cancel: &CancellationToken);

    /// Back to the fastest tier. Called after every successful receive.
    fn reset(&self);
}

/// Tiered backoff: each consecutive empty poll waits for the next configured duration,
/// and the last duration repeats once reached.
#[derive(Debug)]
pub struct DefaultBackoffStrategy {
    tiers: Vec<Duration>,
    busy_wait: Duration,
    error_wait: Duration,
    tier: AtomicUsize,
}

impl DefaultBackoffStrategy {
    pub fn new(config: &BackoffConfig) -> Self {
        let tiers = if config.idle_tiers.is_empty() {
            vec![Duration::from_millis(100)]
        } else {
            config.idle_tiers.clone()
        };

        Self {
            tiers,
            busy_wait: config.busy_wait,
            error_wait: config.error_wait,
            tier: AtomicUsize::new(0),
        }
    }

    /// Index of the tier the next empty poll will wait for.
    pub fn current_tier(&self) -> usize {
        self.tier.load(Ordering::Acquire)
    }

    pub fn current_delay(&self) -> Duration {
        self.tiers[self.current_tier().min(self.tiers.len() - 1)]
    }

    fn advance(&self) {
        let last = self.tiers.len() - 1;
        let _ = self
            .tier
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| (t < last).then_some(t + 1));
    }
}

impl Default for DefaultBackoffStrategy {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[async_trait]
impl BackoffStrategy for DefaultBackoffStrategy {
    async fn wait(&self, cancel: &CancellationToken) {
        sleep_or_cancel(self.busy_wait, cancel).await;
    }

    async fn wait_no_message(&self, cancel: &CancellationToken) {
        let delay = self.current_delay();
        trace!(tier = self.current_tier(), delay_ms = delay.as_millis() as u64, "idle backoff");
        if sleep_or_cancel(delay, cancel).await {
            self.advance();
        }
    }

    async fn wait_error(&self, cancel: &CancellationToken) {
        sleep_or_cancel(self.error_wait, cancel).await;
    }

    fn reset(&self) {
        self.tier.store(0, Ordering::Release);
    }
}
