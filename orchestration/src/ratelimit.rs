//! Sliding-window request accounting per LLM provider.
//!
//! One limiter per provider, created at startup and shared by every worker.
//! All operations take a single mutex; callers must never hold it across the
//! external call — admission and recording are separate, cheap steps.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default provider budget: 50 requests per rolling minute.
pub const DEFAULT_MAX_REQUESTS: usize = 50;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Ceiling for usage-driven exponential back-off.
const MAX_BACKOFF_SECS: u64 = 300;

/// Ceiling for the explicit rate-limit retry schedule (5, 15, 45, 135, 405).
const MAX_RETRY_DELAY_SECS: u64 = 405;

/// How many times a rate-limited tool call is retried before the cycle fails.
pub const MAX_RATE_LIMIT_ATTEMPTS: u32 = 5;

/// Point-in-time usage numbers for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateMetrics {
    pub current_requests: usize,
    pub max_requests: usize,
    pub usage_percent: f64,
    pub wait_secs: f64,
}

/// Sliding-window rate limiter.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Whether a request may be admitted right now.
    pub fn allow(&self) -> bool {
        let mut requests = self.requests.lock().expect("rate limiter poisoned");
        Self::evict(&mut requests, self.window);
        requests.len() < self.max_requests
    }

    /// Record an admitted request.
    pub fn record(&self) {
        let mut requests = self.requests.lock().expect("rate limiter poisoned");
        Self::evict(&mut requests, self.window);
        requests.push_back(Instant::now());
    }

    /// Time until the oldest request slides out of the window. Zero when the
    /// window has room.
    pub fn wait_time(&self) -> Duration {
        let mut requests = self.requests.lock().expect("rate limiter poisoned");
        Self::evict(&mut requests, self.window);
        if requests.len() < self.max_requests {
            return Duration::ZERO;
        }
        match requests.front() {
            Some(oldest) => self.window.saturating_sub(oldest.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Usage at or above 90 % of the budget. Consumers must back off before
    /// admitting more work.
    pub fn is_critical(&self) -> bool {
        let mut requests = self.requests.lock().expect("rate limiter poisoned");
        Self::evict(&mut requests, self.window);
        requests.len() as f64 >= self.max_requests as f64 * 0.9
    }

    pub fn metrics(&self) -> RateMetrics {
        let mut requests = self.requests.lock().expect("rate limiter poisoned");
        Self::evict(&mut requests, self.window);
        let current = requests.len();
        let wait = if current < self.max_requests {
            Duration::ZERO
        } else {
            requests
                .front()
                .map(|oldest| self.window.saturating_sub(oldest.elapsed()))
                .unwrap_or(Duration::ZERO)
        };
        RateMetrics {
            current_requests: current,
            max_requests: self.max_requests,
            usage_percent: current as f64 / self.max_requests as f64 * 100.0,
            wait_secs: wait.as_secs_f64(),
        }
    }

    /// Clear all recorded requests (used by agent recovery).
    pub fn reset(&self) {
        self.requests
            .lock()
            .expect("rate limiter poisoned")
            .clear();
    }

    fn evict(requests: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = requests.front() {
            if now.duration_since(*front) >= window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

/// Usage-driven back-off: `min(300, 2^k)` seconds for the k-th consecutive
/// wait while the limiter is critical.
pub fn usage_backoff(k: u32) -> Duration {
    let secs = 2u64
        .checked_pow(k)
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Retry schedule for explicit 429/"rate limit" failures from the tool:
/// 5 · 3^(attempt−1) seconds, capped at 405 s. Attempts are 1-based.
pub fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(8);
    let secs = 5u64
        .saturating_mul(3u64.checked_pow(exp).unwrap_or(u64::MAX))
        .min(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(secs)
}
