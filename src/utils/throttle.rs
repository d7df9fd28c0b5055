//! Log throttling
//!
//! Repeated failures (a flaky capture device, a viewer whose transport keeps
//! rejecting writes) would otherwise flood the log at frame rate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Limits how often a message with the same key is logged
///
/// ```rust
/// use std::time::Duration;
/// use camstream::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("device_error"));
/// assert!(!throttler.should_log("device_error"));
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when the message for `key` should be emitted now.
    pub fn should_log(&self, key: &str) -> bool {
        self.admit(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), but also reports how many
    /// messages for `key` were swallowed since the last emitted one.
    pub fn admit(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed = entry.suppressed.saturating_add(1);
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget `key`, so the next failure is logged immediately.
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_logs() {
        let throttler = LogThrottler::with_secs(1);
        assert!(throttler.should_log("key"));
    }

    #[test]
    fn test_throttling_window() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("key"));
        assert!(!throttler.should_log("key"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("key"));
    }

    #[test]
    fn test_suppressed_count_reported() {
        let throttler = LogThrottler::new(Duration::from_millis(50));

        assert_eq!(throttler.admit("key"), Some(0));
        assert_eq!(throttler.admit("key"), None);
        assert_eq!(throttler.admit("key"), None);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(throttler.admit("key"), Some(2));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key"));
        throttler.clear("key");
        assert!(throttler.should_log("key"));

        throttler.clear_all();
        assert!(throttler.is_empty());
    }
}
