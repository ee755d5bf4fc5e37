//! Generic per-key sliding-window rate limiter.
//!
//! Used both by the IDS engine (keyed on `sender_fp`) and by the
//! pre-auth guard (keyed on `auth:<remote-ip>`) — one algorithm, two
//! instances.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<u64>>,
    window_seconds: u64,
    max_per_window: u32,
}

impl SlidingWindowLimiter {
    pub fn new(window_seconds: u64, max_per_window: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window_seconds,
            max_per_window,
        }
    }

    /// Returns `true` if the caller is allowed (under the cap) and
    /// records this attempt; `false` if the cap is already reached.
    /// The whole check-then-append happens under a single shard lock
    /// so concurrent callers cannot race past the cap.
    pub fn check(&self, key: &str, now: u64) -> bool {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let cutoff = now.saturating_sub(self.window_seconds);
        while matches!(entry.front(), Some(&ts) if ts < cutoff) {
            entry.pop_front();
        }
        if entry.len() as u32 >= self.max_per_window {
            false
        } else {
            entry.push_back(now);
            true
        }
    }

    pub fn check_now(&self, key: &str) -> bool {
        self.check(key, now_secs())
    }
}
