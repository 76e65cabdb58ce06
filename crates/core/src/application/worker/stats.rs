use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one worker engine, readable while it runs
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub claimed: Arc<AtomicU64>,
    pub completed: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    /// Claims abandoned because another claim took the job over
    pub lease_lost: Arc<AtomicU64>,
    /// Handlers executing right now
    pub active: Arc<AtomicU64>,
    /// Highest value `active` has reached
    pub peak_active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn lease_lost(&self) -> u64 {
        self.lease_lost.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> u64 {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub(crate) fn handler_started(&self) {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);
    }

    pub(crate) fn handler_finished(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
