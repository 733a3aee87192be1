//! Lease coordinator configuration and renewal scheduling.

use std::time::Duration;

use crate::error::{LeaseError, LeaseResult};

/// Default fraction of the TTL to wait before the first renewal attempt.
pub const DEFAULT_WAIT_FRACTION: f64 = 0.75;

/// Default pause between acquisition attempts after a store error.
pub const DEFAULT_PAUSE_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of renewal polls per TTL window and release attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default lower bound on the spacing between renewal polls.
pub const DEFAULT_MIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for one lease coordinator.
///
/// A coordinator is bound to exactly one `key` and one candidate `value` for
/// its lifetime. Holding the lease means the store holds `value` under `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    /// Name of the contended resource, e.g. `control-plane-leader`.
    pub key: String,
    /// Identity of this candidate.
    pub value: String,
    /// Lease time to live in seconds.
    pub ttl: u64,
    /// Fraction of the TTL to wait before renewing. With a TTL of 20s and
    /// 0.75 the first renewal happens after 15s, retried over the last 5s.
    pub wait_fraction: f64,
    /// Pause after a store error during acquisition.
    pub pause_interval: Duration,
    /// Renewal polls per window, and attempts when releasing.
    pub max_retries: u32,
    /// Shortest time between renewal polls.
    pub min_retry_interval: Duration,
}

impl LeaseConfig {
    /// Create a config for `key`/`value` with `ttl` seconds and default tunables.
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
            wait_fraction: DEFAULT_WAIT_FRACTION,
            pause_interval: DEFAULT_PAUSE_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_interval: DEFAULT_MIN_RETRY_INTERVAL,
        }
    }

    /// Check the config can drive a coordinator.
    pub fn validate(&self) -> LeaseResult<()> {
        if self.key.trim().is_empty() {
            return Err(LeaseError::Config("lease key must not be empty".into()));
        }
        if self.value.trim().is_empty() {
            return Err(LeaseError::Config("lease value must not be empty".into()));
        }
        if self.ttl == 0 {
            return Err(LeaseError::Config(
                "lease ttl must be greater than zero".into(),
            ));
        }
        if !(self.wait_fraction > 0.0 && self.wait_fraction < 1.0) {
            return Err(LeaseError::Config(format!(
                "wait fraction must be within (0, 1), got {}",
                self.wait_fraction
            )));
        }
        if self.max_retries == 0 {
            return Err(LeaseError::Config(
                "max retries must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Compute when and how often to renew a lease with `ttl` seconds left.
    pub fn renewal_schedule(&self, ttl: u64) -> RenewalSchedule {
        let duration = Duration::from_secs(ttl);
        let after = duration.mul_f64(self.wait_fraction);
        let remaining = duration.saturating_sub(after);
        let poll_interval = (remaining / self.max_retries.max(1)).max(self.min_retry_interval);
        RenewalSchedule {
            after,
            remaining,
            poll_interval,
        }
    }
}

/// Timing of one renewal cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalSchedule {
    /// Wait before the first renewal attempt.
    pub after: Duration,
    /// Total budget for renewal attempts once `after` has passed.
    pub remaining: Duration,
    /// Spacing between renewal attempts.
    pub poll_interval: Duration,
}
