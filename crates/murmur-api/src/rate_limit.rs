use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// In-memory sliding-window limiter keyed by client address or username.
pub struct RateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_attempts: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            window,
        }
    }

    // A panic while holding the map leaves only timestamps behind.
    fn attempts(&self) -> MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while `key` is under the limit.
    pub fn check(&self, key: &str) -> bool {
        let mut attempts = self.attempts();
        let now = Instant::now();

        let Some(entry) = attempts.get_mut(key) else {
            return true;
        };
        entry.retain(|&time| now.duration_since(time) < self.window);
        if entry.is_empty() {
            attempts.remove(key);
            return true;
        }
        entry.len() < self.max_attempts
    }

    pub fn record(&self, key: &str) {
        let mut attempts = self.attempts();
        let now = Instant::now();

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|&time| now.duration_since(time) < self.window);
        entry.push(now);
    }

    /// Check and record under one lock. Refused hits are not recorded.
    pub fn hit(&self, key: &str) -> bool {
        let mut attempts = self.attempts();
        let now = Instant::now();

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|&time| now.duration_since(time) < self.window);
        if entry.len() >= self.max_attempts {
            return false;
        }
        entry.push(now);
        true
    }

    pub fn clear(&self, key: &str) {
        self.attempts().remove(key);
    }
}
