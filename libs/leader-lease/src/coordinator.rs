//! Leader lease coordinator.
//!
//! A [`Coordinator`] competes for one lease key with one candidate value.
//! [`acquire_and_hold`](Coordinator::acquire_and_hold) creates the key (or
//! waits on a watch for the current holder to go away), notifies the caller
//! once, and then keeps the lease alive with compare-and-swap renewals while
//! an [`ExpirationWatcher`] task watches for the key being freed or taken.
//! The call only returns once the lease is lost.
//!
//! The renewal loop and the watcher task share no state. The loop owns a
//! `stop` oneshot that ends the watcher, and the watcher owns a `lost`
//! oneshot that wakes the loop.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{LeaseConfig, RenewalSchedule};
use crate::error::{LeaseError, LeaseResult};
use crate::metrics;
use crate::store::KvStore;
use crate::watcher::{ExpirationWatcher, WatchMode};

/// Lifecycle of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    /// Constructed, not yet acquiring.
    Idle,
    /// Trying to create the key or waiting for the current holder to go away.
    Acquiring,
    /// Holding the lease and renewing it.
    Held,
    /// The held lease was lost. Terminal for the `acquire_and_hold` call.
    Lost,
    /// `release` was called.
    Released,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "idle"),
            CoordinatorState::Acquiring => write!(f, "acquiring"),
            CoordinatorState::Held => write!(f, "held"),
            CoordinatorState::Lost => write!(f, "lost"),
            CoordinatorState::Released => write!(f, "released"),
        }
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The lease is ours. `ttl` is the TTL in effect and `revision` the
    /// next revision to watch from.
    Held { ttl: u64, revision: u64 },
    /// Another candidate held the lease and has since let it go. Try again.
    Contended,
}

/// Acquires, renews and releases one lease in a [`KvStore`].
pub struct Coordinator<S: ?Sized> {
    store: Arc<S>,
    config: LeaseConfig,
    state: Arc<watch::Sender<CoordinatorState>>,
}

impl<S: ?Sized> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: ?Sized> fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: KvStore + ?Sized> Coordinator<S> {
    /// Create a coordinator for `config.key`/`config.value` backed by `store`.
    pub fn new(store: Arc<S>, config: LeaseConfig) -> LeaseResult<Self> {
        config.validate()?;
        let (state, _) = watch::channel(CoordinatorState::Idle);
        Ok(Self {
            store,
            config,
            state: Arc::new(state),
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: CoordinatorState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(key = %self.config.key, %prev, next = %state, "lease coordinator state changed");
        }
    }

    fn watcher(&self) -> ExpirationWatcher<S> {
        ExpirationWatcher::new(
            Arc::clone(&self.store),
            &self.config.key,
            &self.config.value,
        )
    }

    /// Acquire the lease, fire `notify`, and hold the lease until it is lost.
    ///
    /// Store errors while acquiring are logged and retried after the
    /// configured pause, indefinitely. Once held, the lease is renewed until
    /// it is taken, revoked, or cannot be renewed in time; the returned error
    /// says which. Dropping `notify`'s receiver is not an error.
    pub async fn acquire_and_hold(&self, notify: oneshot::Sender<()>) -> LeaseError {
        let (ttl, revision) = self.acquire().await;

        self.set_state(CoordinatorState::Held);
        metrics::LEASE_ACQUISITIONS.inc();
        metrics::LEASES_HELD.inc();
        let held = HeldGuard { coordinator: self };
        info!(
            key = %self.config.key,
            value = %self.config.value,
            ttl,
            revision,
            "lease acquired"
        );
        let _ = notify.send(());

        let err = self.hold(ttl, revision).await;

        drop(held);
        metrics::LEASE_LOSSES.inc();
        error!(key = %self.config.key, error = %err, "lease lost");
        err
    }

    /// Retry [`try_acquire`](Self::try_acquire) until the lease is ours.
    /// Returns the TTL in effect and the next revision to watch.
    async fn acquire(&self) -> (u64, u64) {
        self.set_state(CoordinatorState::Acquiring);
        loop {
            match self.try_acquire().await {
                Ok(Acquisition::Held { ttl, revision }) => return (ttl, revision),
                Ok(Acquisition::Contended) => {
                    debug!(key = %self.config.key, "lease freed, retrying acquisition");
                }
                Err(err) => {
                    metrics::LEASE_ACQUIRE_ERRORS.inc();
                    warn!(
                        key = %self.config.key,
                        error = %err,
                        retry_in_ms = self.config.pause_interval.as_millis(),
                        "error acquiring lease"
                    );
                    tokio::time::sleep(self.config.pause_interval).await;
                }
            }
        }
    }

    /// Make one attempt to take the lease.
    ///
    /// Creates the key if it is absent. If it already holds our value (we
    /// restarted before it expired) the lease counts as held with the TTL
    /// the store reports. If someone else holds it, blocks on a watch until
    /// the key is freed or handed to us, then returns
    /// [`Acquisition::Contended`].
    pub async fn try_acquire(&self) -> LeaseResult<Acquisition> {
        let LeaseConfig {
            key, value, ttl, ..
        } = &self.config;

        match self.store.create(key, value, *ttl).await {
            Ok(revision) => {
                return Ok(Acquisition::Held {
                    ttl: *ttl,
                    revision: revision + 1,
                });
            }
            Err(err) if err.is_node_exists() => {}
            Err(err) => return Err(err.into()),
        }

        let current = match self.store.get(key).await {
            Ok(current) => current,
            // gone between create and get, go straight back to create
            Err(err) if err.is_not_found() => return Ok(Acquisition::Contended),
            Err(err) => return Err(err.into()),
        };

        if current.value == *value {
            let ttl = current.ttl.filter(|ttl| *ttl > 0).unwrap_or(*ttl);
            debug!(key = %key, ttl, revision = current.revision, "lease already held by us");
            return Ok(Acquisition::Held {
                ttl,
                revision: current.revision + 1,
            });
        }

        debug!(
            key = %key,
            holder = %current.value,
            revision = current.revision,
            "lease held by another candidate, waiting for expiration"
        );
        let mut from = current.revision + 1;
        self.watcher()
            .wait_for_transition(WatchMode::NotHeld, &mut from)
            .await?;
        Ok(Acquisition::Contended)
    }

    /// Keep a held lease alive until it is lost.
    ///
    /// `ttl` is the TTL currently on the key and `revision` the next
    /// revision to watch, i.e. one past the revision of our last write.
    pub async fn hold(&self, ttl: u64, revision: u64) -> LeaseError {
        // the watcher exits once this sender is dropped, on every return path
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (lost_tx, mut lost_rx) = oneshot::channel();
        self.watcher()
            .spawn_held(revision, self.config.min_retry_interval, stop_rx, lost_tx);

        let mut revision = revision;
        let mut schedule = self.config.renewal_schedule(ttl);
        loop {
            tokio::select! {
                _ = &mut lost_rx => {
                    return LeaseError::Lost {
                        key: self.config.key.clone(),
                        revision,
                    };
                }
                _ = tokio::time::sleep(schedule.after) => {}
            }

            if let Err(err) = self.renew(&schedule, &mut revision, &mut lost_rx).await {
                return err;
            }
            debug!(key = %self.config.key, revision = revision - 1, "lease renewed");

            // the renewal wrote the configured TTL, whatever we started from
            schedule = self.config.renewal_schedule(self.config.ttl);
        }
    }

    /// Poll compare-and-swap renewals until one succeeds, a fatal condition
    /// is seen, or the schedule's budget runs out.
    async fn renew(
        &self,
        schedule: &RenewalSchedule,
        revision: &mut u64,
        lost: &mut oneshot::Receiver<()>,
    ) -> LeaseResult<()> {
        let LeaseConfig {
            key, value, ttl, ..
        } = &self.config;
        let deadline = Instant::now() + schedule.remaining;

        loop {
            let prev_revision = revision.saturating_sub(1);
            debug!(key = %key, revision = prev_revision, "renewing lease");
            match self
                .store
                .compare_and_swap(key, value, *ttl, value, prev_revision)
                .await
            {
                Ok(next) => {
                    *revision = next + 1;
                    metrics::LEASE_RENEWALS.inc();
                    return Ok(());
                }
                Err(err) if err.is_compare_failed() => {
                    return Err(LeaseError::Taken {
                        key: key.clone(),
                        source: err,
                    });
                }
                Err(err) if err.is_not_found() => {
                    return Err(LeaseError::Revoked { key: key.clone() });
                }
                Err(err) => {
                    metrics::LEASE_RENEW_ERRORS.inc();
                    warn!(
                        key = %key,
                        revision = prev_revision,
                        error = %err,
                        "unexpected error renewing lease"
                    );
                    // TODO: re-read the key instead of trusting the error's index,
                    // which can point past our last write
                    if let Some(index) = err.index() {
                        *revision = index + 1;
                    }
                }
            }

            if Instant::now() + schedule.poll_interval >= deadline {
                return Err(LeaseError::RenewalTimeout {
                    key: key.clone(),
                    revision: *revision,
                });
            }
            tokio::select! {
                _ = &mut *lost => {
                    return Err(LeaseError::Lost {
                        key: key.clone(),
                        revision: *revision,
                    });
                }
                _ = tokio::time::sleep(schedule.poll_interval) => {}
            }
        }
    }

    /// Give the lease up if we hold it.
    ///
    /// Best effort: deletes the key only if it still holds our value,
    /// retrying transient store errors immediately up to `max_retries`
    /// times. Any other store error ends the release. A key that is absent
    /// or held by someone else is left alone.
    pub async fn release(&self) {
        let LeaseConfig {
            key,
            value,
            max_retries,
            ..
        } = &self.config;

        for attempt in 1..=*max_retries {
            match self.store.compare_and_delete(key, value, 0).await {
                Ok(()) => {
                    info!(key = %key, "lease released");
                    metrics::LEASE_RELEASES.inc();
                    self.set_state(CoordinatorState::Released);
                    return;
                }
                Err(err) if err.is_compare_failed() || err.is_not_found() => {
                    debug!(key = %key, error = %err, "lease not held, nothing to release");
                    metrics::LEASE_RELEASES.inc();
                    self.set_state(CoordinatorState::Released);
                    return;
                }
                Err(err) if err.is_retryable() => {
                    warn!(key = %key, attempt, error = %err, "unable to release lease");
                }
                Err(err) => {
                    warn!(key = %key, attempt, error = %err, "giving up releasing lease");
                    self.set_state(CoordinatorState::Released);
                    return;
                }
            }
        }

        warn!(key = %key, attempts = max_retries, "giving up releasing lease");
        self.set_state(CoordinatorState::Released);
    }
}

/// Ends the `Held` state when `acquire_and_hold` returns or its future is
/// dropped while the lease is held. A `Released` state is left alone.
struct HeldGuard<'a, S: KvStore + ?Sized> {
    coordinator: &'a Coordinator<S>,
}

impl<S: KvStore + ?Sized> Drop for HeldGuard<'_, S> {
    fn drop(&mut self) {
        metrics::LEASES_HELD.dec();
        let lost = self.coordinator.state.send_if_modified(|state| {
            if *state == CoordinatorState::Released {
                return false;
            }
            *state = CoordinatorState::Lost;
            true
        });
        if lost {
            debug!(key = %self.coordinator.config.key, next = %CoordinatorState::Lost, "lease coordinator state changed");
        }
    }
}
