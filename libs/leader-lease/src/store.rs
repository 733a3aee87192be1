//! The revisioned key-value store seam.
//!
//! The coordinator never talks to a concrete backend. It drives any type
//! implementing [`KvStore`], which exposes the five primitives a lease needs:
//! atomic create, get, compare-and-swap, compare-and-delete and a blocking,
//! resumable watch.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::StoreResult;

/// Current state of a key as returned by [`KvStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub value: String,
    /// Remaining time to live in whole seconds, `None` if the key never expires.
    pub ttl: Option<u64>,
    /// Revision at which the key was last modified.
    pub revision: u64,
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchAction {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
}

impl WatchAction {
    /// Returns true if the change removed the key.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            WatchAction::Delete | WatchAction::CompareAndDelete | WatchAction::Expire
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchAction::Get => "get",
            WatchAction::Set => "set",
            WatchAction::Create => "create",
            WatchAction::Update => "update",
            WatchAction::Delete => "delete",
            WatchAction::Expire => "expire",
            WatchAction::CompareAndSwap => "compareAndSwap",
            WatchAction::CompareAndDelete => "compareAndDelete",
        }
    }
}

impl fmt::Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change observed on a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    /// Value after the change; `None` when the change removed the key.
    pub value: Option<String>,
    /// Revision at which the change happened.
    pub revision: u64,
}

/// Revisioned key-value store used to back a lease.
///
/// Revisions are assigned by the store and strictly increase across all
/// keys. A revision of `0` passed as a precondition means "match on value
/// only"; passed to [`watch`](KvStore::watch) it means "the next change".
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Create `key` with `value` expiring after `ttl` seconds.
    /// Fails with [`StoreError::NodeExists`](crate::error::StoreError::NodeExists) if the key is present.
    async fn create(&self, key: &str, value: &str, ttl: u64) -> StoreResult<u64>;

    /// Read the current value, remaining TTL and revision of `key`.
    async fn get(&self, key: &str) -> StoreResult<KeyValue>;

    /// Replace `key` with `value` and a fresh `ttl` if it currently holds
    /// `prev_value` at `prev_revision`. Returns the new revision.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: u64,
        prev_value: &str,
        prev_revision: u64,
    ) -> StoreResult<u64>;

    /// Delete `key` if it currently holds `prev_value` (and `prev_revision`
    /// when non-zero).
    async fn compare_and_delete(
        &self,
        key: &str,
        prev_value: &str,
        prev_revision: u64,
    ) -> StoreResult<()>;

    /// Block until the first change to `key` at or after `from_revision`.
    async fn watch(&self, key: &str, from_revision: u64) -> StoreResult<WatchEvent>;
}
