//! Persistence facade and the queue adapter built on top of it.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::queue::TaskQueue;

/// Queue-like and map-like primitives backed by a durable store.
///
/// Values are opaque strings; callers choose the encoding.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert `value` into the ordered queue `queue` with `rank`.
    async fn push_min(&self, queue: &str, value: String, rank: i64) -> Result<(), StoreError>;

    /// Remove the lowest-ranked value of `queue`.
    async fn pop_min(&self, queue: &str) -> Result<Option<(String, i64)>, StoreError>;

    /// Append `value` to the tail of list `key`.
    async fn push_list(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove the head of list `key`.
    async fn pop_list(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set `field` of hash `hash`. A `ttl` applies to the whole hash.
    async fn set_field(
        &self,
        hash: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Number of entries under `key` (queue items, list items or hash fields);
    /// `0` for a missing key.
    async fn length(&self, key: &str) -> Result<usize, StoreError>;
}

/// A [`TaskQueue`] whose items live in a [`TaskStore`] ordered queue,
/// JSON-encoded.
///
/// An item that no longer decodes is logged and skipped so a single bad
/// entry cannot wedge the queue.
pub struct StoreQueue<T> {
    store: Arc<dyn TaskStore>,
    name: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> StoreQueue<T> {
    pub fn new(store: Arc<dyn TaskStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T> TaskQueue<T> for StoreQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, value: T, rank: i64) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&value)?;
        self.store.push_min(&self.name, encoded, rank).await
    }

    async fn pop_min(&self) -> Result<Option<(T, i64)>, StoreError> {
        loop {
            let Some((raw, rank)) = self.store.pop_min(&self.name).await? else {
                return Ok(None);
            };
            match serde_json::from_str(&raw) {
                Ok(value) => return Ok(Some((value, rank))),
                Err(e) => {
                    tracing::warn!(queue = %self.name, rank, error = %e, "dropping undecodable queue item");
                }
            }
        }
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.store.length(&self.name).await
    }
}
