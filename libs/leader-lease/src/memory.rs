//! In-memory revisioned key-value store.
//!
//! Behaves like an etcd v2 keyspace: one global index bumped by every
//! mutation, per-key TTLs that expire into an `expire` event, and a bounded
//! event history that watches resume from. Expiry runs on `tokio::time`, so
//! tests with a paused clock see keys expire as time is advanced.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};
use crate::store::{KeyValue, KvStore, WatchAction, WatchEvent};

/// Number of events retained for watches to resume from.
const HISTORY_LIMIT: usize = 1000;

#[derive(Debug)]
struct Node {
    value: String,
    ttl: Option<u64>,
    expires_at: Option<Instant>,
    revision: u64,
}

#[derive(Debug, Clone)]
struct Event {
    key: String,
    action: WatchAction,
    value: Option<String>,
    revision: u64,
}

#[derive(Debug, Default)]
struct State {
    index: u64,
    nodes: HashMap<String, Node>,
    history: VecDeque<Event>,
    /// Highest revision dropped from `history`.
    cleared_through: u64,
    failing_writes: u32,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    revision_tx: watch::Sender<u64>,
    write_attempts: AtomicU64,
}

/// In-memory [`KvStore`]. Cloning yields another handle to the same keyspace.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                revision_tx,
                write_attempts: AtomicU64::new(0),
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current global index.
    pub fn current_revision(&self) -> u64 {
        self.inner.state.lock().index
    }

    /// Number of create, compare-and-swap and compare-and-delete calls seen.
    pub fn write_attempts(&self) -> u64 {
        self.inner.write_attempts.load(Ordering::Relaxed)
    }

    /// Make the next `count` create, compare-and-swap and compare-and-delete
    /// calls fail with a transport error.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.state.lock().failing_writes = count;
    }

    /// Read the current value of `key` without TTL or revision.
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .nodes
            .get(key)
            .map(|node| node.value.clone())
    }

    /// Unconditionally write `key`, as an operator or a misbehaving peer would.
    ///
    /// # Panics
    ///
    /// With a `ttl`, expiry is scheduled with `tokio::spawn`, so this must be
    /// called from within a tokio runtime. Without one it never spawns.
    pub fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> u64 {
        let mut state = self.inner.state.lock();
        let revision = self.apply(&mut state, key, WatchAction::Set, Some(value), ttl);
        drop(state);
        self.schedule_expiry(key, ttl, revision);
        revision
    }

    /// Unconditionally delete `key`. Returns the revision of the delete, or
    /// `None` if the key was absent.
    pub fn delete(&self, key: &str) -> Option<u64> {
        let mut state = self.inner.state.lock();
        if !state.nodes.contains_key(key) {
            return None;
        }
        Some(self.apply(&mut state, key, WatchAction::Delete, None, None))
    }

    /// Count a write and consume an injected failure if one is pending.
    fn begin_write(&self, state: &mut State, op: &str) -> StoreResult<()> {
        self.inner.write_attempts.fetch_add(1, Ordering::Relaxed);
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::Transport(format!(
                "injected failure for {op}"
            )));
        }
        Ok(())
    }

    /// Apply a mutation under the lock, record it in the history and wake
    /// watchers. A `None` value removes the key.
    fn apply(
        &self,
        state: &mut State,
        key: &str,
        action: WatchAction,
        value: Option<&str>,
        ttl: Option<u64>,
    ) -> u64 {
        state.index += 1;
        let revision = state.index;
        match value {
            Some(value) => {
                state.nodes.insert(
                    key.to_string(),
                    Node {
                        value: value.to_string(),
                        ttl,
                        expires_at: ttl.map(|secs| Instant::now() + Duration::from_secs(secs)),
                        revision,
                    },
                );
            }
            None => {
                state.nodes.remove(key);
            }
        }
        state.history.push_back(Event {
            key: key.to_string(),
            action,
            value: value.map(str::to_string),
            revision,
        });
        while state.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = state.history.pop_front() {
                state.cleared_through = dropped.revision;
            }
        }
        trace!(key, %action, revision, "memory store mutation");
        self.inner.revision_tx.send_replace(revision);
        revision
    }

    /// Expire `key` after `ttl` seconds unless it was modified since `revision`.
    fn schedule_expiry(&self, key: &str, ttl: Option<u64>, revision: u64) {
        let Some(secs) = ttl else {
            return;
        };
        let store = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            store.expire(&key, revision);
        });
    }

    fn expire(&self, key: &str, revision: u64) {
        let mut state = self.inner.state.lock();
        let current = state.nodes.get(key).map(|node| node.revision);
        if current == Some(revision) {
            let expired_at = self.apply(&mut state, key, WatchAction::Expire, None, None);
            debug!(key, revision, expired_at, "memory store key expired");
        }
    }

    fn next_event(state: &State, key: &str, from: u64) -> StoreResult<Option<WatchEvent>> {
        if from <= state.cleared_through {
            return Err(StoreError::IndexCleared { index: state.index });
        }
        Ok(state
            .history
            .iter()
            .find(|event| event.revision >= from && event.key == key)
            .map(|event| WatchEvent {
                action: event.action,
                value: event.value.clone(),
                revision: event.revision,
            }))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn create(&self, key: &str, value: &str, ttl: u64) -> StoreResult<u64> {
        let mut state = self.inner.state.lock();
        self.begin_write(&mut state, "create")?;
        if state.nodes.contains_key(key) {
            return Err(StoreError::NodeExists {
                key: key.to_string(),
                index: Some(state.index),
            });
        }
        let revision = self.apply(&mut state, key, WatchAction::Create, Some(value), Some(ttl));
        drop(state);
        self.schedule_expiry(key, Some(ttl), revision);
        Ok(revision)
    }

    async fn get(&self, key: &str) -> StoreResult<KeyValue> {
        let state = self.inner.state.lock();
        let node = state.nodes.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
            index: Some(state.index),
        })?;
        let ttl = match (node.ttl, node.expires_at) {
            (Some(_), Some(expires_at)) => {
                let left = expires_at.saturating_duration_since(Instant::now());
                // round up like etcd so a live key never reports 0
                Some(left.as_secs() + u64::from(left.subsec_nanos() > 0))
            }
            _ => None,
        };
        Ok(KeyValue {
            value: node.value.clone(),
            ttl,
            revision: node.revision,
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: u64,
        prev_value: &str,
        prev_revision: u64,
    ) -> StoreResult<u64> {
        let mut state = self.inner.state.lock();
        self.begin_write(&mut state, "compare_and_swap")?;
        let node = state.nodes.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
            index: Some(state.index),
        })?;
        if node.value != prev_value || (prev_revision != 0 && node.revision != prev_revision) {
            return Err(StoreError::CompareFailed {
                cause: format!(
                    "[{prev_value} != {}] [{prev_revision} != {}]",
                    node.value, node.revision
                ),
                index: Some(state.index),
            });
        }
        let revision = self.apply(
            &mut state,
            key,
            WatchAction::CompareAndSwap,
            Some(value),
            Some(ttl),
        );
        drop(state);
        self.schedule_expiry(key, Some(ttl), revision);
        Ok(revision)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        prev_value: &str,
        prev_revision: u64,
    ) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        self.begin_write(&mut state, "compare_and_delete")?;
        let node = state.nodes.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
            index: Some(state.index),
        })?;
        if node.value != prev_value || (prev_revision != 0 && node.revision != prev_revision) {
            return Err(StoreError::CompareFailed {
                cause: format!("[{prev_value} != {}]", node.value),
                index: Some(state.index),
            });
        }
        self.apply(&mut state, key, WatchAction::CompareAndDelete, None, None);
        Ok(())
    }

    async fn watch(&self, key: &str, from_revision: u64) -> StoreResult<WatchEvent> {
        let mut from = from_revision;
        if from == 0 {
            from = self.inner.state.lock().index + 1;
        }
        loop {
            // subscribe before looking so a mutation in between still wakes us
            let mut rx = self.inner.revision_tx.subscribe();
            {
                let state = self.inner.state.lock();
                if let Some(event) = Self::next_event(&state, key, from)? {
                    return Ok(event);
                }
            }
            rx.changed()
                .await
                .map_err(|_| StoreError::Transport("memory store closed".into()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_without_ttl_outside_runtime() {
        let store = MemoryStore::new();
        let rev = store.set("lease/x", "a", None);
        assert_eq!(rev, 1);
        assert_eq!(store.value("lease/x").as_deref(), Some("a"));
        assert_eq!(store.delete("lease/x"), Some(2));
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 10).await.unwrap();
        assert_eq!(rev, 1);

        let err = store.create("lease/x", "b", 10).await.unwrap_err();
        assert!(err.is_node_exists());
        assert_eq!(err.index(), Some(1));
        assert_eq!(store.value("lease/x").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_compare_and_swap_preconditions() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 10).await.unwrap();

        let err = store
            .compare_and_swap("lease/x", "a", 10, "b", rev)
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());

        let err = store
            .compare_and_swap("lease/x", "a", 10, "a", rev + 5)
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());

        let next = store
            .compare_and_swap("lease/x", "a", 10, "a", rev)
            .await
            .unwrap();
        assert!(next > rev);

        // value-only match ignores the revision
        store
            .compare_and_swap("lease/x", "a", 10, "a", 0)
            .await
            .unwrap();

        let err = store
            .compare_and_swap("lease/y", "a", 10, "a", 0)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.create("lease/x", "a", 10).await.unwrap();

        let err = store
            .compare_and_delete("lease/x", "b", 0)
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());

        store.compare_and_delete("lease/x", "a", 0).await.unwrap();
        assert_eq!(store.value("lease/x"), None);

        let err = store
            .compare_and_delete("lease/x", "a", 0)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_reports_remaining_ttl() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let kv = store.get("lease/x").await.unwrap();
        assert_eq!(kv.value, "a");
        assert_eq!(kv.ttl, Some(7));
        assert_eq!(kv.revision, rev);

        store.set("lease/y", "b", None);
        assert_eq!(store.get("lease/y").await.unwrap().ttl, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_expires_into_event() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 2).await.unwrap();

        let event = store.watch("lease/x", rev + 1).await.unwrap();
        assert_eq!(event.action, WatchAction::Expire);
        assert_eq!(event.value, None);
        assert!(store.get("lease/x").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_key_does_not_expire_early() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        store
            .compare_and_swap("lease/x", "a", 2, "a", rev)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.value("lease/x").as_deref(), Some("a"));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.value("lease/x"), None);
    }

    #[tokio::test]
    async fn test_watch_resumes_from_revision() {
        let store = MemoryStore::new();
        let first = store.create("lease/x", "a", 10).await.unwrap();
        store.set("other", "z", None);
        let second = store.set("lease/x", "b", None);

        let event = store.watch("lease/x", first).await.unwrap();
        assert_eq!(event.revision, first);
        assert_eq!(event.action, WatchAction::Create);

        // resuming after `first` skips it and the unrelated key
        let event = store.watch("lease/x", first + 1).await.unwrap();
        assert_eq!(event.revision, second);
        assert_eq!(event.value.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_watch_blocks_until_change() {
        let store = MemoryStore::new();
        let rev = store.create("lease/x", "a", 10).await.unwrap();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("lease/x", rev + 1).await })
        };
        tokio::task::yield_now().await;
        assert!(!watcher.is_finished());

        let deleted = store.delete("lease/x").unwrap();
        let event = watcher.await.unwrap().unwrap();
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.revision, deleted);
    }

    #[tokio::test]
    async fn test_watch_cleared_history() {
        let store = MemoryStore::new();
        for i in 0..(HISTORY_LIMIT + 5) {
            store.set("churn", &i.to_string(), None);
        }
        let err = store.watch("churn", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::IndexCleared { .. }));

        let current = store.current_revision();
        let event = store.watch("churn", current).await.unwrap();
        assert_eq!(event.revision, current);
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);
        assert!(matches!(
            store.create("lease/x", "a", 10).await,
            Err(StoreError::Transport(_))
        ));
        assert!(matches!(
            store.compare_and_delete("lease/x", "a", 0).await,
            Err(StoreError::Transport(_))
        ));
        store.create("lease/x", "a", 10).await.unwrap();
        assert_eq!(store.write_attempts(), 3);
    }
}
