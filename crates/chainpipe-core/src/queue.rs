//! Ordered task queue: a mutex-guarded binary min-heap keyed by rank.
//!
//! Both pipeline queues (pending blocks, pending transaction batches) are
//! ranked by slot so the lowest outstanding slot is always served first.
//! Ties are broken arbitrarily; insertion order is not preserved.
//!
//! Ordering holds per pop instant: a producer that back-fills a lower rank
//! after a higher one was popped will see its item served next, not skipped.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;

/// One entry of the heap.
///
/// `heap_index` always mirrors the entry's slot in the backing vector while
/// it is queued and becomes `None` once the entry is removed.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    value: T,
    rank: i64,
    heap_index: Option<usize>,
}

impl<T> QueueItem<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    pub fn heap_index(&self) -> Option<usize> {
        self.heap_index
    }

    pub fn into_parts(self) -> (T, i64) {
        (self.value, self.rank)
    }
}

struct MinHeap<T> {
    items: Vec<QueueItem<T>>,
}

impl<T> MinHeap<T> {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn push(&mut self, value: T, rank: i64) {
        let idx = self.items.len();
        self.items.push(QueueItem {
            value,
            rank,
            heap_index: Some(idx),
        });
        self.sift_up(idx);
    }

    fn pop(&mut self) -> Option<QueueItem<T>> {
        let last = self.items.len().checked_sub(1)?;
        self.swap(0, last);
        let mut item = self.items.pop()?;
        item.heap_index = None;
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(item)
    }

    fn peek(&self) -> Option<&QueueItem<T>> {
        self.items.first()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        self.items[i].heap_index = Some(i);
        self.items[j].heap_index = Some(j);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.items[idx].rank >= self.items[parent].rank {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < len && self.items[left].rank < self.items[smallest].rank {
                smallest = left;
            }
            if right < len && self.items[right].rank < self.items[smallest].rank {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }
}

/// Thread-safe priority queue; the lowest rank pops first.
///
/// Every operation, including `len`, takes the same lock. `pop_min` never
/// blocks on an empty queue; callers poll and sleep.
pub struct OrderedQueue<T> {
    name: String,
    heap: Mutex<MinHeap<T>>,
}

impl<T> OrderedQueue<T> {
    /// Create an empty queue. `name` only appears in logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heap: Mutex::new(MinHeap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // A handler that panicked while holding the lock must not take the
    // queue down with it; the heap is never left mid-swap across a panic.
    fn heap(&self) -> MutexGuard<'_, MinHeap<T>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `value` with `rank`. Duplicated ranks are kept.
    pub fn push(&self, value: T, rank: i64) {
        self.heap().push(value, rank);
    }

    /// Remove and return the lowest-ranked item, if any.
    pub fn pop_min(&self) -> Option<(T, i64)> {
        self.pop_item().map(QueueItem::into_parts)
    }

    /// Like [`pop_min`](Self::pop_min) but returns the detached entry.
    pub fn pop_item(&self) -> Option<QueueItem<T>> {
        let item = self.heap().pop()?;
        tracing::debug!(queue = %self.name, rank = item.rank, "popped queue item");
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> OrderedQueue<T> {
    /// Return the lowest-ranked item without removing it.
    pub fn peek_min(&self) -> Option<(T, i64)> {
        self.heap()
            .peek()
            .map(|item| (item.value.clone(), item.rank))
    }
}

/// Queue contract consumed by the pipeline workers.
///
/// Implemented by the in-process [`OrderedQueue`] and by
/// [`StoreQueue`](crate::store::StoreQueue) for durable backends, so workers
/// never know which one they are draining.
#[async_trait]
pub trait TaskQueue<T: Send + 'static>: Send + Sync {
    /// Queue name for logs.
    fn name(&self) -> &str;

    async fn push(&self, value: T, rank: i64) -> Result<(), StoreError>;

    /// Destructive pop of the lowest rank; `Ok(None)` when empty.
    async fn pop_min(&self) -> Result<Option<(T, i64)>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

#[async_trait]
impl<T: Send + 'static> TaskQueue<T> for OrderedQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, value: T, rank: i64) -> Result<(), StoreError> {
        OrderedQueue::push(self, value, rank);
        Ok(())
    }

    async fn pop_min(&self) -> Result<Option<(T, i64)>, StoreError> {
        Ok(OrderedQueue::pop_min(self))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(OrderedQueue::len(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pops_in_rank_order() {
        let q = OrderedQueue::new("blocks");
        q.push("a", 50);
        q.push("b", 10);
        q.push("c", 30);

        assert_eq!(q.pop_min(), Some(("b", 10)));
        assert_eq!(q.pop_min(), Some(("c", 30)));
        assert_eq!(q.pop_min(), Some(("a", 50)));
        assert_eq!(q.pop_min(), None);
    }

    #[test]
    fn drained_ranks_are_non_decreasing() {
        let q = OrderedQueue::new("blocks");
        let ranks = [17, 3, 99, 3, 42, -5, 0, 64, 8, 8, 1_000, 12];
        for (i, r) in ranks.iter().enumerate() {
            q.push(i, *r);
        }

        let mut drained = Vec::new();
        while let Some((_, rank)) = q.pop_min() {
            drained.push(rank);
        }
        assert_eq!(drained.len(), ranks.len());
        assert!(drained.windows(2).all(|w| w[0] <= w[1]), "{drained:?}");
    }

    #[test]
    fn duplicate_ranks_are_all_kept() {
        let q = OrderedQueue::new("txs");
        q.push("x", 5);
        q.push("y", 5);
        assert_eq!(q.len(), 2);
        let mut values = vec![q.pop_min().unwrap().0, q.pop_min().unwrap().0];
        values.sort();
        assert_eq!(values, vec!["x", "y"]);
    }

    #[test]
    fn len_drops_by_one_per_pop() {
        let q = OrderedQueue::new("blocks");
        for r in 0..5 {
            q.push(r, r);
        }
        for expected in (0..5).rev() {
            assert!(q.pop_min().is_some());
            assert_eq!(q.len(), expected);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn peek_does_not_remove() {
        let q = OrderedQueue::new("blocks");
        assert_eq!(q.peek_min(), None::<(u64, i64)>);
        q.push(7u64, 7);
        q.push(2u64, 2);
        assert_eq!(q.peek_min(), Some((2, 2)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn popped_item_is_detached() {
        let q = OrderedQueue::new("blocks");
        q.push("a", 2);
        q.push("b", 1);
        let item = q.pop_item().unwrap();
        assert_eq!(item.rank(), 1);
        assert_eq!(item.heap_index(), None);
    }

    #[test]
    fn heap_indices_track_positions() {
        let mut heap = MinHeap::new();
        for r in [9, 4, 7, 1, 8, 2] {
            heap.push(r, r);
        }
        heap.pop();
        for (pos, item) in heap.items.iter().enumerate() {
            assert_eq!(item.heap_index, Some(pos));
        }
    }

    #[test]
    fn backfilled_lower_rank_is_served_next() {
        let q = OrderedQueue::new("blocks");
        q.push("late", 100);
        q.push("later", 200);
        assert_eq!(q.pop_min().unwrap().1, 100);
        q.push("backfill", 50);
        assert_eq!(q.pop_min().unwrap().1, 50);
    }

    #[test]
    fn concurrent_pops_never_duplicate() {
        let q = Arc::new(OrderedQueue::new("blocks"));
        for r in 0..1_000i64 {
            q.push(r, r);
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some((v, _)) = q.pop_min() {
                        seen.push(v);
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..1_000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn task_queue_contract() {
        let q: Arc<dyn TaskQueue<u64>> = Arc::new(OrderedQueue::new("blocks"));
        q.push(3, 3).await.unwrap();
        q.push(1, 1).await.unwrap();
        assert_eq!(q.len().await.unwrap(), 2);
        assert_eq!(q.pop_min().await.unwrap(), Some((1, 1)));
        assert_eq!(q.name(), "blocks");
    }
}
