//! Rate Limiter (rolling window)
//!
//! Bounds job *starts*: at most `max` starts inside any window of length
//! `window`. Independent of the concurrency semaphore; the worker checks
//! the semaphore first and this limiter second.
//!
//! Timestamps come from `tokio::time::Instant`, so paused-clock tests work.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Sliding-log rate limiter
pub struct RateLimiter {
    max_starts: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Example
    /// Allow 10 job starts per second:
    /// `RateLimiter::new(10, Duration::from_secs(1))`
    pub fn new(max_starts: u32, window: Duration) -> Self {
        let max_starts = max_starts.max(1) as usize;
        Self {
            max_starts,
            window,
            starts: Mutex::new(VecDeque::with_capacity(max_starts)),
        }
    }

    /// How long until another start fits in the window (zero if it fits now)
    pub fn time_until_ready(&self) -> Duration {
        let now = Instant::now();
        let mut starts = self.lock();
        self.evict_expired(&mut starts, now);

        if starts.len() < self.max_starts {
            return Duration::ZERO;
        }
        // Oldest start leaves the window at oldest + window
        starts
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until a start would be permitted, without consuming it
    pub async fn ready(&self) {
        loop {
            let wait = self.time_until_ready();
            if wait.is_zero() {
                return;
            }
            sleep(wait).await;
        }
    }

    /// Record a job start
    ///
    /// Only valid after [`RateLimiter::ready`] returned, with a single
    /// consumer per limiter (one claim loop per worker).
    pub fn record_start(&self) {
        let now = Instant::now();
        let mut starts = self.lock();
        self.evict_expired(&mut starts, now);
        starts.push_back(now);
    }

    /// Consume a start if one is available right now
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut starts = self.lock();
        self.evict_expired(&mut starts, now);
        if starts.len() < self.max_starts {
            starts.push_back(now);
            true
        } else {
            false
        }
    }

    /// Wait for and consume a start
    pub async fn acquire(&self) {
        loop {
            self.ready().await;
            if self.try_acquire() {
                return;
            }
        }
    }

    /// Starts still available in the current window (for monitoring)
    pub fn remaining(&self) -> usize {
        let now = Instant::now();
        let mut starts = self.lock();
        self.evict_expired(&mut starts, now);
        self.max_starts - starts.len()
    }

    fn evict_expired(&self, starts: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = starts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                starts.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.starts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
