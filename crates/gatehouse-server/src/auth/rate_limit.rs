//! Sliding-window limiter for token-exchange attempts.
//!
//! Per-key attempt timestamps decay over a rolling window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    window: Duration,
    /// key → attempt timestamps inside the window.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for the given key, and record it if so.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Per-IP convenience wrapper around [`RateLimiter::check_and_record`].
    pub fn check_ip(&mut self, ip: &IpAddr) -> bool {
        self.check_and_record(&ip.to_string())
    }

    /// Drop expired entries to bound memory.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}
