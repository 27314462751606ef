use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default number of remembered message ids
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default retention window, matching the webhook freshness limit
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);

/// Bounded, time-windowed set of recently seen message ids.
///
/// An id present in the set has been handed to callbacks at least once and
/// is reported as a duplicate until it ages out of the window or is evicted.
///
/// At capacity a lazy sweep drops expired entries before admitting a new id.
/// If the set is still full after the sweep the new id is admitted anyway:
/// the set grows past its bound for that insertion rather than rejecting a
/// message that might be legitimate.
#[derive(Debug)]
pub struct MessageDeduplicator {
    seen: Mutex<HashMap<String, Instant>>,
    capacity: usize,
    max_age: Duration,
}

impl MessageDeduplicator {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::with_capacity(capacity.min(1024))),
            capacity,
            max_age,
        }
    }

    /// Returns `false` and records `id` on first sight within the window,
    /// `true` on every later sight.
    pub fn is_duplicate(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();

        if let Some(first_seen) = seen.get_mut(id) {
            if now.duration_since(*first_seen) <= self.max_age {
                return true;
            }
            // Expired: this is a new retention window
            *first_seen = now;
            return false;
        }

        if seen.len() >= self.capacity {
            let max_age = self.max_age;
            seen.retain(|_, first_seen| now.duration_since(*first_seen) <= max_age);
            if seen.len() >= self.capacity {
                log::debug!(
                    "Dedup set still at capacity ({}) after sweep, admitting message {} anyway",
                    self.capacity,
                    id
                );
            }
        }

        seen.insert(id.to_string(), now);
        false
    }

    /// Drop a single id so its next delivery is treated as new. Used when
    /// the handler failed and the message never reached the application.
    pub fn forget(&self, id: &str) {
        self.seen.lock().remove(id);
    }

    /// Forget every id. Not for use on the delivery path.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }
}
