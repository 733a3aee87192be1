//! Leader lease metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and are
//! shared by every coordinator in the process. Registration failures are
//! fatal, as in the rest of the workspace.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of successful lease acquisitions
    pub static ref LEASE_ACQUISITIONS: IntCounter = register_int_counter!(
        "leader_lease_acquisitions",
        "count of successful leader lease acquisitions"
    ).unwrap();

    /// Count of store errors while trying to acquire
    pub static ref LEASE_ACQUIRE_ERRORS: IntCounter = register_int_counter!(
        "leader_lease_acquire_errors",
        "count of store errors during leader lease acquisition"
    ).unwrap();

    /// Count of successful renewals
    pub static ref LEASE_RENEWALS: IntCounter = register_int_counter!(
        "leader_lease_renewals",
        "count of successful leader lease renewals"
    ).unwrap();

    /// Count of non-fatal renewal errors that were retried
    pub static ref LEASE_RENEW_ERRORS: IntCounter = register_int_counter!(
        "leader_lease_renew_errors",
        "count of retried leader lease renewal errors"
    ).unwrap();

    /// Count of held leases that were lost
    pub static ref LEASE_LOSSES: IntCounter = register_int_counter!(
        "leader_lease_losses",
        "count of held leader leases that were lost"
    ).unwrap();

    /// Count of release attempts that freed or confirmed a free lease
    pub static ref LEASE_RELEASES: IntCounter = register_int_counter!(
        "leader_lease_releases",
        "count of completed leader lease releases"
    ).unwrap();

    /// Gauge: number of leases currently held by this process
    pub static ref LEASES_HELD: IntGauge = register_int_gauge!(
        "leader_leases_held",
        "number of leader leases currently held by this process"
    ).unwrap();
}
