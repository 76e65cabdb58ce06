// Time Provider Port (for testability)

/// Time provider interface (allows mocking in tests)
pub trait TimeProvider: Send + Sync {
    /// Get current time in milliseconds since epoch
    fn now_millis(&self) -> i64;
}

/// System time provider (production)
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock driven by tokio's timer.
///
/// Starts at the wall-clock time of construction and then advances with
/// `tokio::time`, so tests running under `tokio::time::pause` see store
/// timestamps move together with their sleeps.
pub struct TokioClock {
    epoch_ms: i64,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            epoch_ms: chrono::Utc::now().timestamp_millis(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for TokioClock {
    fn now_millis(&self) -> i64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now_millis();
        tokio::time::sleep(Duration::from_secs(90)).await;
        let elapsed = clock.now_millis() - before;
        assert!((90_000..90_010).contains(&elapsed), "elapsed {}", elapsed);
    }
}
