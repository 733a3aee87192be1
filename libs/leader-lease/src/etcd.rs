//! etcd v2 keys API store.
//!
//! Speaks the v2 HTTP API directly: create is a `PUT` with `prevExist=false`,
//! compare-and-swap and compare-and-delete use `prevValue`/`prevIndex`, and
//! watch is a long-poll `GET` with `wait=true&waitIndex=`. Error bodies carry
//! an etcd error code and the store index, which map onto [`StoreError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};
use crate::store::{KeyValue, KvStore, WatchAction, WatchEvent};

/// Default timeout for every request except watches.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const ERROR_KEY_NOT_FOUND: u32 = 100;
const ERROR_TEST_FAILED: u32 = 101;
const ERROR_NODE_EXIST: u32 = 105;
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: WatchAction,
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    ttl: Option<i64>,
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: Option<u64>,
}

impl EtcdErrorBody {
    fn into_store_error(self, key: &str) -> StoreError {
        match self.error_code {
            ERROR_KEY_NOT_FOUND => StoreError::NotFound {
                key: key.to_string(),
                index: self.index,
            },
            ERROR_TEST_FAILED => StoreError::CompareFailed {
                cause: self.cause.unwrap_or(self.message),
                index: self.index,
            },
            ERROR_NODE_EXIST => StoreError::NodeExists {
                key: key.to_string(),
                index: self.index,
            },
            ERROR_EVENT_INDEX_CLEARED => StoreError::IndexCleared {
                index: self.index.unwrap_or_default(),
            },
            code => StoreError::Other {
                code,
                message: match self.cause {
                    Some(cause) => format!("{} ({cause})", self.message),
                    None => self.message,
                },
                index: self.index,
            },
        }
    }
}

impl EtcdResponse {
    fn into_node(self, key: &str) -> StoreResult<EtcdNode> {
        self.node.ok_or_else(|| {
            StoreError::Codec(format!(
                "etcd {} response for key '{key}' has no node",
                self.action
            ))
        })
    }
}

/// Decode an etcd reply body according to its HTTP status.
fn decode(status: StatusCode, body: &[u8], key: &str) -> StoreResult<EtcdResponse> {
    if status.is_success() {
        return serde_json::from_slice(body).map_err(|e| {
            StoreError::Codec(format!("invalid etcd response for key '{key}': {e}"))
        });
    }
    match serde_json::from_slice::<EtcdErrorBody>(body) {
        Ok(err) => Err(err.into_store_error(key)),
        Err(_) => Err(StoreError::Transport(format!(
            "etcd returned {status} for key '{key}'"
        ))),
    }
}

/// [`KvStore`] backed by an etcd v2 endpoint.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: Client,
    endpoint: Url,
    request_timeout: Duration,
}

impl EtcdStore {
    /// Create a store talking to `endpoint`, e.g. `http://127.0.0.1:2379`.
    pub fn new(endpoint: &str, request_timeout: Duration) -> StoreResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StoreError::Transport(format!("invalid etcd endpoint '{endpoint}': {e}")))?;
        let client = Client::builder()
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build etcd client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn key_url(&self, key: &str) -> String {
        format!(
            "{}/v2/keys/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    async fn send(&self, request: RequestBuilder, key: &str) -> StoreResult<EtcdResponse> {
        let response = request.send().await.map_err(|e| {
            StoreError::Transport(format!("etcd request for key '{key}' failed: {e}"))
        })?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            StoreError::Transport(format!("failed reading etcd response for key '{key}': {e}"))
        })?;
        trace!(key, %status, "etcd response");
        decode(status, &body, key)
    }

    fn preconditions(prev_value: &str, prev_revision: u64) -> Vec<(&'static str, String)> {
        let mut query = vec![("prevValue", prev_value.to_string())];
        if prev_revision != 0 {
            query.push(("prevIndex", prev_revision.to_string()));
        }
        query
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn create(&self, key: &str, value: &str, ttl: u64) -> StoreResult<u64> {
        let request = self
            .client
            .put(self.key_url(key))
            .query(&[("prevExist", "false")])
            .form(&[("value", value.to_string()), ("ttl", ttl.to_string())])
            .timeout(self.request_timeout);
        let node = self.send(request, key).await?.into_node(key)?;
        Ok(node.modified_index)
    }

    async fn get(&self, key: &str) -> StoreResult<KeyValue> {
        let request = self
            .client
            .get(self.key_url(key))
            .timeout(self.request_timeout);
        let node = self.send(request, key).await?.into_node(key)?;
        Ok(KeyValue {
            value: node.value.unwrap_or_default(),
            ttl: node.ttl.and_then(|ttl| u64::try_from(ttl).ok()),
            revision: node.modified_index,
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
        let request = self
            .client
            .put(self.key_url(key))
            .query(&Self::preconditions(prev_value, prev_revision))
            .form(&[("value", value.to_string()), ("ttl", ttl.to_string())])
            .timeout(self.request_timeout);
        let node = self.send(request, key).await?.into_node(key)?;
        Ok(node.modified_index)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        prev_value: &str,
        prev_revision: u64,
    ) -> StoreResult<()> {
        let request = self
            .client
            .delete(self.key_url(key))
            .query(&Self::preconditions(prev_value, prev_revision))
            .timeout(self.request_timeout);
        self.send(request, key).await?;
        Ok(())
    }

    async fn watch(&self, key: &str, from_revision: u64) -> StoreResult<WatchEvent> {
        let mut query = vec![("wait", "true".to_string())];
        if from_revision != 0 {
            query.push(("waitIndex", from_revision.to_string()));
        }
        debug!(key, from_revision, "watching etcd key");
        // no timeout: the long-poll returns on the next change
        let request = self.client.get(self.key_url(key)).query(&query);
        let response = self.send(request, key).await?;
        let action = response.action;
        let node = response.into_node(key)?;
        Ok(WatchEvent {
            action,
            value: if action.is_removal() { None } else { node.value },
            revision: node.modified_index,
        })
    }
}
