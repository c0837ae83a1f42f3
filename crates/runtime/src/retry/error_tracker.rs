//! Per-message failure bookkeeping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use courier_core::BusError;

/// Tracks delivery failures by message id (or a derived id such as the second-level id).
///
/// Shared by every worker of a bus. Entries are created on the first registered error
/// and only shrink through [`ErrorTracker::clean_up`] or a stale sweep.
pub trait ErrorTracker: Send + Sync {
    fn register_error(&self, id: &str, error: &BusError);

    /// `true` once the number of registered errors reaches the configured maximum.
    fn has_failed_too_many_times(&self, id: &str) -> bool;

    fn error_count(&self, id: &str) -> usize;

    /// One-line summary, or `None` when nothing is tracked for `id`.
    fn short_description(&self, id: &str) -> Option<String>;

    /// Every registered error with its timestamp, oldest first.
    fn full_description(&self, id: &str) -> Option<String>;

    /// Forget `id`. No-op when absent.
    fn clean_up(&self, id: &str);

    /// Drop entries whose latest error is at least `max_age` old. Returns how many went.
    ///
    /// The bus calls this from its housekeeping task; it is the only way entries for
    /// messages that never come back are ever removed.
    fn sweep_stale(&self, max_age: Duration) -> usize;
}

#[derive(Debug, Clone)]
struct TrackedError {
    at: DateTime<Utc>,
    description: String,
}

/// In-memory [`ErrorTracker`] scoped to one bus instance.
#[derive(Debug)]
pub struct InMemErrorTracker {
    max_delivery_attempts: u32,
    errors: DashMap<String, Vec<TrackedError>>,
}

impl InMemErrorTracker {
    pub fn new(max_delivery_attempts: u32) -> Self {
        Self {
            max_delivery_attempts,
            errors: DashMap::new(),
        }
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ErrorTracker for InMemErrorTracker {
    fn register_error(&self, id: &str, error: &BusError) {
        let mut entry = self.errors.entry(id.to_string()).or_default();
        entry.push(TrackedError {
            at: Utc::now(),
            description: error.describe(),
        });
        debug!(message_id = id, attempts = entry.len(), "registered delivery failure");
    }

    fn has_failed_too_many_times(&self, id: &str) -> bool {
        self.error_count(id) >= self.max_delivery_attempts as usize
    }

    fn error_count(&self, id: &str) -> usize {
        self.errors.get(id).map_or(0, |e| e.len())
    }

    fn short_description(&self, id: &str) -> Option<String> {
        let entry = self.errors.get(id)?;
        Some(format!("{} unhandled errors", entry.len()))
    }

    fn full_description(&self, id: &str) -> Option<String> {
        let entry = self.errors.get(id)?;
        Some(
            entry
                .iter()
                .map(|e| format!("{}: {}", e.at.to_rfc3339(), e.description))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    fn clean_up(&self, id: &str) {
        self.errors.remove(id);
    }

    fn sweep_stale(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let now = Utc::now();
        let before = self.errors.len();
        self.errors.retain(|_, errors| {
            errors
                .last()
                .is_some_and(|latest| now.signed_duration_since(latest.at) < max_age)
        });
        before.saturating_sub(self.errors.len())
    }
}
