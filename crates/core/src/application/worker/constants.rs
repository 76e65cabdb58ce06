// Worker constants
use std::time::Duration;

/// Sleep duration when no jobs are available (100ms)
pub const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(100);

/// Sleep duration after a store error before claiming again (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Capacity of each worker's lifecycle event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Default lease taken on claim (30s), renewed every half lease
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Default interval of the expired-lease reaper (15s)
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(15);

/// Default interval of the scheduler loop (5 minutes)
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(5 * 60);
