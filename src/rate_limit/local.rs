use super::types::{RateLimitDecision, RateWindowEntry};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// In-memory fixed-window rate limiter
///
/// Counters live in a sharded map; each check holds the shard lock for its key
/// only while reading and bumping the counter, so concurrent requests for the
/// same identity never lose an update.
pub struct FixedWindowLimiter {
    windows: DashMap<String, RateWindowEntry>,
    window: Duration,
    sweep_interval: u64,
    checks: AtomicU64,
}

impl FixedWindowLimiter {
    /// Create a limiter with the given window length
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            sweep_interval: 1024,
            checks: AtomicU64::new(0),
        }
    }

    /// Sweep expired windows every `interval` checks (0 disables sweeping)
    pub fn with_sweep_interval(mut self, interval: u64) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Window length
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check and count a request against `key`
    pub fn check(&self, key: &str, limit: u32) -> RateLimitDecision {
        self.check_at(key, limit, Instant::now())
    }

    /// Check and count a request against `key` as of `now`
    pub fn check_at(&self, key: &str, limit: u32, now: Instant) -> RateLimitDecision {
        let decision = if limit == 0 {
            RateLimitDecision::denied(0, self.window)
        } else {
            let mut entry = self
                .windows
                .entry(key.to_string())
                .or_insert(RateWindowEntry {
                    count: 0,
                    reset_at: now,
                });

            if now >= entry.reset_at {
                entry.count = 1;
                entry.reset_at = now + self.window;
                RateLimitDecision::allowed(limit - 1, limit, self.window)
            } else if entry.count >= limit {
                RateLimitDecision::denied(limit, entry.reset_at - now)
            } else {
                entry.count += 1;
                RateLimitDecision::allowed(limit - entry.count, limit, entry.reset_at - now)
            }
        };

        self.maybe_sweep(now);
        decision
    }

    fn maybe_sweep(&self, now: Instant) {
        if self.sweep_interval == 0 {
            return;
        }
        let checks = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if checks % self.sweep_interval == 0 {
            let before = self.windows.len();
            self.windows.retain(|_, entry| now < entry.reset_at);
            debug!(
                removed = before.saturating_sub(self.windows.len()),
                "Swept expired rate limit windows"
            );
        }
    }

    /// Number of tracked identity keys (for testing/monitoring)
    pub fn active_windows(&self) -> usize {
        self.windows.len()
    }
}
