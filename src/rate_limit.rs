// In-memory rate limiter for inbound WebSocket and submit traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Different rate limit types with their constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitType {
    /// Relayed editor snapshots per socket. Bounds fanout storms.
    CodeChange,
    /// Submission attempts per user per minute.
    Submit,
}

impl RateLimitType {
    /// Maximum number of events allowed in the window.
    pub fn max_count(&self) -> usize {
        match self {
            RateLimitType::CodeChange => crate::config::code_change_rate(),
            RateLimitType::Submit => 10,
        }
    }

    /// Time window for the rate limit.
    pub fn window(&self) -> Duration {
        match self {
            RateLimitType::CodeChange => Duration::from_secs(1),
            RateLimitType::Submit => Duration::from_secs(60),
        }
    }
}

impl std::fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitType::CodeChange => write!(f, "code changes per second"),
            RateLimitType::Submit => write!(f, "submissions per minute"),
        }
    }
}

/// Error returned when a rate limit is exceeded.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub limit_type: RateLimitType,
    pub max: usize,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Rate limit exceeded: max {} {}",
            self.max, self.limit_type
        )
    }
}

/// Key for the rate limit map: (connection or user key, limit type).
type LimitKey = (String, RateLimitType);

/// Thread-safe in-memory rate limiter with a sliding window per key.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<LimitKey, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check if the key is within the rate limit for the given type.
    /// If within limits, records the event and returns Ok(()).
    pub fn check_limit(
        &self,
        key: &str,
        limit_type: RateLimitType,
    ) -> Result<(), RateLimitError> {
        let mut map = self.inner.lock().unwrap();
        let map_key = (key.to_string(), limit_type);
        let window = limit_type.window();
        let max = limit_type.max_count();
        let now = Instant::now();

        let entries = map.entry(map_key).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            return Err(RateLimitError { limit_type, max });
        }

        entries.push(now);
        Ok(())
    }

    /// Drop all state for a key (socket closed).
    pub fn forget(&self, key: &str) {
        let mut map = self.inner.lock().unwrap();
        map.retain(|(k, _), _| k != key);
    }

    /// Current count for a key and limit type (for diagnostics).
    pub fn current_count(&self, key: &str, limit_type: RateLimitType) -> usize {
        let mut map = self.inner.lock().unwrap();
        let map_key = (key.to_string(), limit_type);
        let window = limit_type.window();
        let now = Instant::now();

        if let Some(entries) = map.get_mut(&map_key) {
            entries.retain(|t| now.duration_since(*t) < window);
            entries.len()
        } else {
            0
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
