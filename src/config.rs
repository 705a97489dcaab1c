/**
 * Configuration constants for informers, work queues and controllers
 */
use std::time::Duration;

/// Delay between a watch stream ending (or failing) and the next attempt
pub const RECONNECT_BACKOFF_MILLIS: u64 = 1000;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Base delay of the default per-item exponential backoff
pub const DEFAULT_BASE_DELAY_MILLIS: u64 = 5;

/// Upper bound of the default per-item exponential backoff
pub const DEFAULT_MAX_DELAY_SECONDS: u64 = 1000;

/// Sustained rate of the default token bucket limiter
pub const DEFAULT_QPS: f64 = 10.0;

/// Burst size of the default token bucket limiter
pub const DEFAULT_BURST: u32 = 100;

/// How often `wait_for_cache_sync` re-checks informers
pub const CACHE_SYNC_POLL_INTERVAL_MILLIS: u64 = 100;

/// Default number of reconcile workers per controller
pub const DEFAULT_WORKERS: usize = 2;

/// Resync period meaning "never resync"
pub const NO_RESYNC: Duration = Duration::ZERO;

/// Settings for a single list-watch loop
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Pause before reopening a watch or retrying a failed list
    pub reconnect_backoff: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_millis(RECONNECT_BACKOFF_MILLIS),
        }
    }
}

/// Settings for a [`crate::controller::Controller`]
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Drop a key after this many rate limited requeues; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: None,
        }
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(RECONNECT_BACKOFF_MILLIS > 0, "RECONNECT_BACKOFF_MILLIS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(DEFAULT_BASE_DELAY_MILLIS > 0, "DEFAULT_BASE_DELAY_MILLIS must be greater than 0");
    assert!(
        DEFAULT_MAX_DELAY_SECONDS * 1000 >= DEFAULT_BASE_DELAY_MILLIS,
        "DEFAULT_MAX_DELAY_SECONDS must not be below the base delay"
    );
    assert!(DEFAULT_BURST > 0, "DEFAULT_BURST must be greater than 0");
    assert!(CACHE_SYNC_POLL_INTERVAL_MILLIS > 0, "CACHE_SYNC_POLL_INTERVAL_MILLIS must be greater than 0");
    assert!(DEFAULT_WORKERS > 0, "DEFAULT_WORKERS must be greater than 0");
};
