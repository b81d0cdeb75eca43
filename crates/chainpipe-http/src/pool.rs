//! Round-robin credential pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("credential pool is empty")]
    Empty,
}

struct PoolSlot<C: ?Sized> {
    client: Arc<C>,
    /// One permit: at most one in-flight call per credential.
    in_flight: Arc<Semaphore>,
}

/// Fixed set of interchangeable clients, one per credential.
///
/// Immutable after construction; the cursor is the only shared mutable state.
pub struct CredentialPool<C: ?Sized> {
    slots: Vec<PoolSlot<C>>,
    cursor: AtomicUsize,
}

/// Exclusive use of one credential until dropped.
pub struct Checkout<C: ?Sized> {
    pub index: usize,
    pub client: Arc<C>,
    _permit: OwnedSemaphorePermit,
}

impl<C: ?Sized> CredentialPool<C> {
    pub fn new(clients: Vec<Arc<C>>) -> Result<Self, PoolError> {
        if clients.is_empty() {
            return Err(PoolError::Empty);
        }
        let slots = clients
            .into_iter()
            .map(|client| PoolSlot {
                client,
                in_flight: Arc::new(Semaphore::new(1)),
            })
            .collect();
        Ok(Self {
            slots,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always `false`; construction rejects an empty pool.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Advance the round-robin cursor.
    pub fn next_index(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<Arc<C>> {
        self.slots.get(index).map(|s| Arc::clone(&s.client))
    }

    /// Wait until credential `index` is idle and claim it.
    pub async fn checkout(&self, index: usize) -> Option<Checkout<C>> {
        let slot = self.slots.get(index)?;
        let permit = Arc::clone(&slot.in_flight).acquire_owned().await.ok()?;
        Some(Checkout {
            index,
            client: Arc::clone(&slot.client),
            _permit: permit,
        })
    }

    /// Whether credential `index` has a call in flight.
    pub fn is_busy(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| s.in_flight.available_permits() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> CredentialPool<String> {
        CredentialPool::new((0..n).map(|i| Arc::new(format!("key{i}"))).collect()).unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            CredentialPool::<String>::new(vec![]),
            Err(PoolError::Empty)
        ));
    }

    #[test]
    fn cursor_wraps_round_robin() {
        let p = pool(3);
        let picks: Vec<_> = (0..7).map(|_| p.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(p.get(1).unwrap().as_str(), "key1");
        assert!(p.get(3).is_none());
    }

    #[tokio::test]
    async fn checkout_is_exclusive_per_credential() {
        let p = Arc::new(pool(2));
        let first = p.checkout(0).await.unwrap();
        assert!(p.is_busy(0));
        assert!(!p.is_busy(1));

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.checkout(0).await.map(|c| c.index) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), Some(0));
    }

    #[test]
    fn pool_of_trait_objects() {
        let clients: Vec<Arc<dyn std::fmt::Debug + Send + Sync>> = vec![Arc::new(1u8), Arc::new("two")];
        let p = CredentialPool::new(clients).unwrap();
        assert_eq!(p.len(), 2);
    }
}
