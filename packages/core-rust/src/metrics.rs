use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Named monotonic counters.
pub trait Metrics: Send + Sync + 'static {
    fn increment(&self, key: &str);

    /// Current value of `key`; 0 if it was never incremented.
    fn counter(&self, key: &str) -> u64;
}

/// Process-local counters that also report to the `metrics` facade, so an
/// installed exporter observes every increment.
#[derive(Debug)]
pub struct DefaultMetrics {
    start_time: Instant,
    counters: Mutex<HashMap<String, u64>>,
}

impl DefaultMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl Default for DefaultMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics for DefaultMetrics {
    fn increment(&self, key: &str) {
        *self.counters.lock().entry(key.to_string()).or_insert(0) += 1;
        metrics::counter!(key.to_string()).increment(1);
    }

    fn counter(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }
}
