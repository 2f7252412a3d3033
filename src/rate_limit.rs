use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

/// Sliding-window request counter keyed by client (usually the peer IP).
///
/// Each key keeps the timestamps of its accepted requests inside the
/// trailing window. Prune, check and append happen under one lock, so a
/// burst can never admit more than `max_requests` per window.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records a request for `key` if it fits in the window.
    ///
    /// Denied requests are not recorded.
    pub fn check_limit(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let stamps = windows.entry(key.to_string()).or_default();
        prune(stamps, now, self.window);

        if stamps.len() >= self.max_requests {
            tracing::debug!(key, "Rate limit reached");
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// How long until `key` gets a free slot again. Zero if it has one now.
    pub fn retry_after(&self, key: &str) -> Duration {
        let now = self.clock.now();
        let windows = self.windows.lock();
        match windows.get(key) {
            Some(stamps) if stamps.len() >= self.max_requests => stamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Drops keys with no timestamps left in the window. Returns how many
    /// keys were evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Runs [`RateLimiter::sweep`] every `interval` for the life of the process.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = limiter.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = limiter.tracked_keys(), "Swept rate limiter");
                }
            }
        })
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
