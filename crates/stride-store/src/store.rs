//! Raw key/value store contract

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stride_common::{Error, Result};

/// Opaque token identifying the stored form a reader observed.
///
/// Holds the serialized record exactly as read; a write is accepted only if
/// the stored bytes are still identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotToken(String);

impl SnapshotToken {
    /// Token for a freshly read or written blob
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    /// The serialized form this token guards
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `stored` is the blob this token was taken from
    pub fn matches(&self, stored: &str) -> bool {
        self.0 == stored
    }
}

/// A stored blob together with its snapshot token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Serialized record
    pub value: String,
    /// Token to pass back to [`ResourceStore::put`]
    pub token: SnapshotToken,
}

/// Trait abstracting the replicated key/value store
///
/// Each call is one logical transaction.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Read the blob stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` under `key` if the stored blob still matches `expected`
    ///
    /// # Arguments
    ///
    /// * `key` - Record key
    /// * `value` - New serialized record
    /// * `expected` - Snapshot the writer read; `None` means the key must not exist
    ///
    /// # Returns
    ///
    /// The token of the newly stored blob, or [`Error::Conflict`] if the
    /// record changed since `expected` was taken. Conflicts are never retried
    /// here.
    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: Option<SnapshotToken>,
    ) -> Result<SnapshotToken>;
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        (**self).get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: Option<SnapshotToken>,
    ) -> Result<SnapshotToken> {
        (**self).put(key, value, expected).await
    }
}

/// Check a compare-and-swap precondition against the currently stored blob
pub(crate) fn check_precondition(
    key: &str,
    current: Option<&str>,
    expected: Option<&SnapshotToken>,
) -> Result<()> {
    match (current, expected) {
        (None, None) => Ok(()),
        (Some(stored), Some(token)) if token.matches(stored) => Ok(()),
        (Some(_), None) => Err(Error::conflict(key, "record already exists")),
        (None, Some(_)) => Err(Error::conflict(key, "record was deleted since it was read")),
        (Some(_), Some(_)) => Err(Error::conflict(key, "record changed since it was read")),
    }
}

/// Bounds every call on the inner store with a timeout
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimeoutStore<S> {
    /// Wrap `inner`, failing any call that takes longer than `timeout`
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceStore for TimeoutStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        tokio::time::timeout(self.timeout, self.inner.get(key))
            .await
            .map_err(|_| Error::timeout("store.get", format!("reading {}", key)))?
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: Option<SnapshotToken>,
    ) -> Result<SnapshotToken> {
        tokio::time::timeout(self.timeout, self.inner.put(key, value, expected))
            .await
            .map_err(|_| Error::timeout("store.put", format!("writing {}", key)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    struct StalledStore;

    #[async_trait]
    impl ResourceStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<Versioned>> {
            std::future::pending().await
        }

        async fn put(
            &self,
            _key: &str,
            _value: &str,
            _expected: Option<SnapshotToken>,
        ) -> Result<SnapshotToken> {
            std::future::pending().await
        }
    }

    #[test]
    fn precondition_matrix() {
        let token = SnapshotToken::new("a");
        assert!(check_precondition("k", None, None).is_ok());
        assert!(check_precondition("k", Some("a"), Some(&token)).is_ok());
        assert!(check_precondition("k", Some("b"), Some(&token))
            .unwrap_err()
            .is_conflict());
        assert!(check_precondition("k", Some("a"), None)
            .unwrap_err()
            .is_conflict());
        assert!(check_precondition("k", None, Some(&token))
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_calls_time_out() {
        let store = TimeoutStore::new(StalledStore, Duration::from_secs(30));
        let err = store.get("cluster-resource").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_retryable());

        let err = store.put("cluster-resource", "{}", None).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let store = TimeoutStore::new(MemoryStore::new(), Duration::from_secs(30));
        let token = store.put("k", "v1", None).await.unwrap();
        let read = store.get("k").await.unwrap().unwrap();
        assert_eq!(read.token, token);
        assert_eq!(read.value, "v1");
    }
}
