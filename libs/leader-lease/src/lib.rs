//! # leader-lease
//!
//! Leader lease coordination over a revisioned key-value store.
//!
//! Exactly one of several competing replicas holds a lease key at a time.
//! The holder proves it is alive by renewing the key before its TTL runs out,
//! and every replica learns about changes through a blocking watch on the
//! key rather than by polling.
//!
//! This library provides:
//! - **Store seam**: the [`KvStore`] trait (create, get, compare-and-swap,
//!   compare-and-delete, watch) with typed [`StoreError`]s.
//! - **Backends**: an in-memory store for tests and single-process use, and
//!   an etcd v2 HTTP store.
//! - **Coordinator**: acquire, hold/renew, and release of one lease key, with
//!   an expiration watcher running beside the renewal loop.
//!
//! ## Design Principles
//!
//! - No process-wide state: every coordinator owns its key, value and store
//!   handle, so several leases can be held from one process.
//! - The renewal loop and the watcher task talk only through two oneshot
//!   channels, `stop` and `lost`.
//! - Losing a lease is reported once, as the return value of
//!   [`Coordinator::acquire_and_hold`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod watcher;

pub use config::{LeaseConfig, RenewalSchedule};
pub use coordinator::{Acquisition, Coordinator, CoordinatorState};
pub use error::{LeaseError, LeaseResult, StoreError, StoreResult};
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use store::{KeyValue, KvStore, WatchAction, WatchEvent};
pub use watcher::{ExpirationWatcher, WatchMode};
