use std::time::Duration;

/// Configuration for the store's expiration machinery
///
/// # Example
///
/// ```rust
/// use lapse_core::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::default()
///     .with_idle_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long the background purger waits with nothing scheduled before
    /// it exits; it is re-spawned on the next insert (default: 3 seconds)
    pub idle_timeout: Duration,
    /// Bound on the pending-operation log as a factor of the live entry
    /// count; exceeding it forces a purger wake-up (default: 2)
    pub pending_ratio: usize,
    /// Lower bound on the pending-operation log size before a wake-up is
    /// forced, so small stores are not swept on every write (default: 32)
    pub pending_max: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3),
            pending_ratio: 2,
            pending_max: 32,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long an idle purger lingers before its thread exits
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the pending-log bound as a factor of the live entry count
    pub fn with_pending_ratio(mut self, pending_ratio: usize) -> Self {
        self.pending_ratio = pending_ratio;
        self
    }

    /// Sets the lower bound on the pending-log size before a forced wake-up
    pub fn with_pending_max(mut self, pending_max: usize) -> Self {
        self.pending_max = pending_max;
        self
    }
}
