//! Expiration watcher.
//!
//! Blocks on the store's watch for the lease key and reports the first
//! transition that matters to a candidate: while waiting to acquire, the key
//! being freed or handed to us; while holding, the key being freed or taken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::KvStore;

/// Which transitions the watcher waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// We do not hold the lease: wait until it is freed or becomes ours.
    NotHeld,
    /// We hold the lease: wait until it is freed or becomes someone else's.
    Held,
}

/// Watches one lease key on behalf of one candidate value.
#[derive(Debug)]
pub struct ExpirationWatcher<S: ?Sized> {
    store: Arc<S>,
    key: String,
    value: String,
}

impl<S: KvStore + ?Sized> ExpirationWatcher<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Block until the lease is deleted or expires, or changes hands in the
    /// direction `mode` cares about.
    ///
    /// `from` is the first revision to watch and is advanced past every
    /// observed event. When the watch fails it still points at the first
    /// revision not yet observed, so a caller can resume without replaying
    /// or skipping events.
    pub async fn wait_for_transition(&self, mode: WatchMode, from: &mut u64) -> StoreResult<()> {
        loop {
            let event = self.store.watch(&self.key, *from).await?;
            *from = event.revision + 1;

            if event.action.is_removal() {
                debug!(key = %self.key, action = %event.action, revision = event.revision, "lease freed");
                return Ok(());
            }

            let ours = event.value.as_deref() == Some(self.value.as_str());
            match mode {
                WatchMode::NotHeld if ours => {
                    debug!(key = %self.key, revision = event.revision, "lease handed to us");
                    return Ok(());
                }
                WatchMode::Held if !ours => {
                    debug!(
                        key = %self.key,
                        holder = ?event.value,
                        revision = event.revision,
                        "lease taken by another holder"
                    );
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Watch a held lease in the background.
    ///
    /// Fires `lost` exactly once when the lease is freed or taken. Resolving
    /// `stop` (sending or dropping its sender) ends the task without firing.
    /// Watch errors are logged and the watch resumes from the last tracked
    /// revision after `retry_interval`, or from the store's current index if
    /// the tracked revision fell out of its history.
    pub fn spawn_held(
        self,
        from: u64,
        retry_interval: Duration,
        mut stop: oneshot::Receiver<()>,
        lost: oneshot::Sender<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut from = from;
            let watch = async {
                loop {
                    match self.wait_for_transition(WatchMode::Held, &mut from).await {
                        Ok(()) => {
                            info!(key = %self.key, revision = from - 1, "lease lost, notifying holder");
                            let _ = lost.send(());
                            return;
                        }
                        Err(err) => {
                            // events before the store's retained history are gone for
                            // good; resume at its current index
                            if let StoreError::IndexCleared { index } = err {
                                from = index + 1;
                            }
                            warn!(
                                key = %self.key,
                                revision = from,
                                error = %err,
                                "error watching for lease expiration"
                            );
                            tokio::time::sleep(retry_interval).await;
                        }
                    }
                }
            };
            tokio::select! {
                biased;
                _ = &mut stop => {
                    debug!(key = %self.key, "lease expiration watcher stopped");
                }
                _ = watch => {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn watcher(store: &MemoryStore, value: &str) -> ExpirationWatcher<MemoryStore> {
        ExpirationWatcher::new(Arc::new(store.clone()), "lease/x", value)
    }

    #[tokio::test]
    async fn test_not_held_returns_on_delete() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "b", 30).await.unwrap();
        let w = watcher(&store, "a");

        let deleted = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                store.set("lease/x", "c", Some(30));
                store.delete("lease/x").unwrap()
            })
        };

        let mut from = rev + 1;
        w.wait_for_transition(WatchMode::NotHeld, &mut from)
            .await
            .unwrap();
        let deleted = deleted.await.unwrap();
        assert_eq!(from, deleted + 1);
    }

    #[tokio::test]
    async fn test_not_held_returns_when_value_becomes_ours() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "b", 30).await.unwrap();
        let ours = store.set("lease/x", "a", Some(30));

        let mut from = rev + 1;
        watcher(&store, "a")
            .wait_for_transition(WatchMode::NotHeld, &mut from)
            .await
            .unwrap();
        assert_eq!(from, ours + 1);
    }

    #[tokio::test]
    async fn test_held_ignores_own_renewals() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 30).await.unwrap();
        let renewed = store
            .compare_and_swap("lease/x", "a", 30, "a", rev)
            .await
            .unwrap();
        let taken = store.set("lease/x", "b", Some(30));
        assert!(taken > renewed);

        let mut from = rev + 1;
        watcher(&store, "a")
            .wait_for_transition(WatchMode::Held, &mut from)
            .await
            .unwrap();
        assert_eq!(from, taken + 1);
    }

    #[tokio::test]
    async fn test_spawn_held_fires_lost_on_takeover() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 30).await.unwrap();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (lost_tx, lost_rx) = oneshot::channel();

        let handle =
            watcher(&store, "a").spawn_held(rev + 1, Duration::from_millis(100), stop_rx, lost_tx);
        store.set("lease/x", "b", Some(30));

        lost_rx.await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_held_stop_does_not_fire() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 30).await.unwrap();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (lost_tx, lost_rx) = oneshot::channel();

        let handle =
            watcher(&store, "a").spawn_held(rev + 1, Duration::from_millis(100), stop_rx, lost_tx);
        drop(stop_tx);
        handle.await.unwrap();

        // the sender was dropped without firing
        assert!(lost_rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_held_resumes_after_cleared_history() {
        let store = MemoryStore::new();
        for i in 0..1100 {
            store.set("churn", &i.to_string(), None);
        }
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (lost_tx, lost_rx) = oneshot::channel();

        // revision 1 is long gone, so the first watch fails
        let handle = watcher(&store, "a").spawn_held(1, Duration::from_millis(100), stop_rx, lost_tx);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!handle.is_finished());

        store.set("lease/x", "b", Some(30));
        lost_rx.await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_watch_keeps_resume_point() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "b", 30).await.unwrap();
        let w = watcher(&store, "a");

        // ours arrives after a renewal by the holder, both are observed
        let renewed = store.compare_and_swap("lease/x", "b", 30, "b", rev).await.unwrap();
        let mine = store.set("lease/x", "a", None);
        let mut from = rev + 1;
        w.wait_for_transition(WatchMode::NotHeld, &mut from)
            .await
            .unwrap();
        assert!(renewed < mine);
        assert_eq!(from, mine + 1);

        for i in 0..1005 {
            store.set("churn", &i.to_string(), None);
        }
        let mut from = rev + 1;
        let err = w
            .wait_for_transition(WatchMode::NotHeld, &mut from)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexCleared { .. }));
        assert_eq!(from, rev + 1);
    }
}
