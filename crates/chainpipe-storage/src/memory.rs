//! In-memory storage backend.
//!
//! Ordered queues, lists and hashes held in RAM. Useful for tests and for
//! single-process runs that accept losing pending work on exit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use chainpipe_core::error::StoreError;
use chainpipe_core::queue::OrderedQueue;
use chainpipe_core::store::TaskStore;

#[derive(Default)]
struct StoredHash {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl StoredHash {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`TaskStore`].
///
/// Each ordered queue is its own [`OrderedQueue`], so pops on different
/// queues never contend. All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, Arc<OrderedQueue<String>>>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    hashes: Mutex<HashMap<String, StoredHash>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<OrderedQueue<String>> {
        lock(&self.queues)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OrderedQueue::new(name)))
            .clone()
    }

    fn existing_queue(&self, name: &str) -> Option<Arc<OrderedQueue<String>>> {
        lock(&self.queues).get(name).cloned()
    }

    /// Read one hash field.
    pub fn field(&self, hash: &str, field: &str) -> Option<String> {
        let hashes = lock(&self.hashes);
        let stored = hashes.get(hash)?;
        if stored.is_expired(Instant::now()) {
            return None;
        }
        stored.fields.get(field).cloned()
    }

    /// Snapshot of every field of `hash`.
    pub fn hash_fields(&self, hash: &str) -> HashMap<String, String> {
        let hashes = lock(&self.hashes);
        match hashes.get(hash) {
            Some(h) if !h.is_expired(Instant::now()) => h.fields.clone(),
            _ => HashMap::new(),
        }
    }

    /// Snapshot of list `key`, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        lock(&self.lists)
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        lock(&self.hashes).retain(|_, h| !h.is_expired(now));
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn push_min(&self, queue: &str, value: String, rank: i64) -> Result<(), StoreError> {
        self.queue(queue).push(value, rank);
        Ok(())
    }

    async fn pop_min(&self, queue: &str) -> Result<Option<(String, i64)>, StoreError> {
        Ok(self.existing_queue(queue).and_then(|q| q.pop_min()))
    }

    async fn push_list(&self, key: &str, value: String) -> Result<(), StoreError> {
        lock(&self.lists)
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        Ok(())
    }

    async fn pop_list(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut lists = lock(&self.lists);
        let Some(list) = lists.get_mut(key) else {
            return Ok(None);
        };
        let head = list.pop_front();
        if list.is_empty() {
            lists.remove(key);
        }
        Ok(head)
    }

    async fn set_field(
        &self,
        hash: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.purge_expired();
        let mut hashes = lock(&self.hashes);
        let stored = hashes.entry(hash.to_string()).or_default();
        stored.fields.insert(field.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            stored.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.length(key).await? > 0)
    }

    async fn length(&self, key: &str) -> Result<usize, StoreError> {
        self.purge_expired();
        let queued = self.existing_queue(key).map(|q| q.len()).unwrap_or(0);
        let listed = lock(&self.lists).get(key).map(VecDeque::len).unwrap_or(0);
        let fields = lock(&self.hashes).get(key).map(|h| h.fields.len()).unwrap_or(0);
        Ok(queued + listed + fields)
    }
}
