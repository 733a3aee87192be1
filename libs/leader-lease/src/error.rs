//! Error types for lease store operations and the lease coordinator.
//!
//! Store errors are typed so the coordinator can tell a failed precondition
//! apart from a missing key or a transport failure without knowing which
//! backend produced it.

use thiserror::Error;

/// Error returned by a [`KvStore`](crate::store::KvStore) operation.
///
/// Variants that originate from the store itself carry the store index the
/// store reported alongside the failure, when it reported one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A create found the key already present.
    #[error("key already exists: {key}")]
    NodeExists { key: String, index: Option<u64> },

    /// A compare-and-swap or compare-and-delete precondition did not hold.
    #[error("compare failed: {cause}")]
    CompareFailed { cause: String, index: Option<u64> },

    /// The key does not exist.
    #[error("key not found: {key}")]
    NotFound { key: String, index: Option<u64> },

    /// A watch asked for a revision older than the retained history.
    #[error("the event in requested index is outdated and cleared (current index {index})")]
    IndexCleared { index: u64 },

    /// Connection or transport-level failure reaching the store.
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with something we could not decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// Any other error reported by the store.
    #[error("store error {code}: {message}")]
    Other {
        code: u32,
        message: String,
        index: Option<u64>,
    },
}

impl StoreError {
    /// The store index reported together with this error, if any.
    pub fn index(&self) -> Option<u64> {
        match self {
            StoreError::NodeExists { index, .. }
            | StoreError::CompareFailed { index, .. }
            | StoreError::NotFound { index, .. }
            | StoreError::Other { index, .. } => *index,
            StoreError::IndexCleared { index } => Some(*index),
            StoreError::Transport(_) | StoreError::Codec(_) => None,
        }
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, StoreError::NodeExists { .. })
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, StoreError::CompareFailed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Returns true for failures that say nothing about the key itself and
    /// may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Transport(_) | StoreError::IndexCleared { .. } | StoreError::Other { .. }
        )
    }
}

/// Shorthand result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error produced by the lease coordinator.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The renewal compare-and-swap found a different value or revision.
    #[error("another client has taken the lease {key}: {source}")]
    Taken {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The key disappeared before it could be renewed.
    #[error("another client has revoked the lease {key}")]
    Revoked { key: String },

    /// No renewal succeeded within the poll budget.
    #[error("unable to renew lease {key} at {revision}")]
    RenewalTimeout { key: String, revision: u64 },

    /// The expiration watcher saw the lease deleted, expired or overwritten.
    #[error("the lease {key} has been lost at {revision}")]
    Lost { key: String, revision: u64 },

    /// Invalid coordinator configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A store failure outside the hold loop.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    /// Returns true if this error means the lease is no longer held.
    pub fn is_loss(&self) -> bool {
        matches!(
            self,
            LeaseError::Taken { .. }
                | LeaseError::Revoked { .. }
                | LeaseError::RenewalTimeout { .. }
                | LeaseError::Lost { .. }
        )
    }
}

/// Shorthand result alias for coordinator operations.
pub type LeaseResult<T> = Result<T, LeaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        let exists = StoreError::NodeExists {
            key: "lease/x".into(),
            index: Some(4),
        };
        assert!(exists.is_node_exists());
        assert!(!exists.is_retryable());
        assert_eq!(exists.index(), Some(4));

        let failed = StoreError::CompareFailed {
            cause: "[a != b]".into(),
            index: Some(9),
        };
        assert!(failed.is_compare_failed());
        assert!(!failed.is_not_found());
        assert!(!failed.is_retryable());

        let missing = StoreError::NotFound {
            key: "lease/x".into(),
            index: None,
        };
        assert!(missing.is_not_found());
        assert_eq!(missing.index(), None);

        let transport = StoreError::Transport("connection refused".into());
        assert!(transport.is_retryable());
        assert_eq!(transport.index(), None);

        let cleared = StoreError::IndexCleared { index: 2000 };
        assert!(cleared.is_retryable());
        assert_eq!(cleared.index(), Some(2000));

        assert!(!StoreError::Codec("bad json".into()).is_retryable());
    }

    #[test]
    fn test_lease_error_is_loss() {
        let key = String::from("lease/x");
        assert!(LeaseError::Revoked { key: key.clone() }.is_loss());
        assert!(
            LeaseError::RenewalTimeout {
                key: key.clone(),
                revision: 3
            }
            .is_loss()
        );
        assert!(
            LeaseError::Lost {
                key: key.clone(),
                revision: 3
            }
            .is_loss()
        );
        assert!(
            LeaseError::Taken {
                key,
                source: StoreError::CompareFailed {
                    cause: "mismatch".into(),
                    index: None
                }
            }
            .is_loss()
        );
        assert!(!LeaseError::Config("bad".into()).is_loss());
        assert!(!LeaseError::from(StoreError::Transport("down".into())).is_loss());
    }

    #[test]
    fn test_lease_error_display() {
        let err = LeaseError::Taken {
            key: "lease/x".into(),
            source: StoreError::CompareFailed {
                cause: "[B != A]".into(),
                index: Some(7),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("another client has taken the lease lease/x"));
        assert!(msg.contains("[B != A]"));

        let err = LeaseError::RenewalTimeout {
            key: "lease/x".into(),
            revision: 12,
        };
        assert_eq!(err.to_string(), "unable to renew lease lease/x at 12");
    }
}
