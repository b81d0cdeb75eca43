//! Stream → block queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use chainpipe_core::queue::TaskQueue;
use chainpipe_core::types::BlockTask;
use chainpipe_ws::NotificationHandler;

/// Turns slot and block notifications into [`BlockTask`]s.
///
/// Accepts `{"slot": n}` as delivered by `slotSubscribe`, the same wrapped
/// in `result`, and block notifications carrying `value.slot` or
/// `context.slot`. Anything without a slot is logged and dropped.
pub struct SlotIngestor {
    queue: Arc<dyn TaskQueue<BlockTask>>,
    keep_payload: bool,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl SlotIngestor {
    pub fn new(queue: Arc<dyn TaskQueue<BlockTask>>) -> Self {
        Self {
            queue,
            keep_payload: false,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Store the raw notification alongside each task.
    pub fn keep_payload(mut self, keep: bool) -> Self {
        self.keep_payload = keep;
        self
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Push the task for one notification; returns the slot when queued.
    pub async fn ingest(&self, notification: Value) -> Option<u64> {
        let Some(slot) = extract_slot(&notification) else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(notification = %notification, "notification without slot dropped");
            return None;
        };

        let task = if self.keep_payload {
            BlockTask::with_payload(slot, notification)
        } else {
            BlockTask::new(slot)
        };
        let rank = task.rank();
        match self.queue.push(task, rank).await {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(slot, queue = self.queue.name(), "block queued");
                Some(slot)
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(slot, error = %e, "failed to queue block");
                None
            }
        }
    }
}

#[async_trait]
impl NotificationHandler for SlotIngestor {
    async fn handle(&self, notification: Value) {
        self.ingest(notification).await;
    }
}

fn extract_slot(notification: &Value) -> Option<u64> {
    let body = notification.get("result").unwrap_or(notification);
    ["/slot", "/value/slot", "/context/slot"]
        .iter()
        .find_map(|path| body.pointer(path).and_then(as_slot))
}

fn as_slot(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainpipe_core::queue::OrderedQueue;
    use serde_json::json;

    #[test]
    fn slot_shapes() {
        assert_eq!(extract_slot(&json!({"parent": 9, "root": 1, "slot": 10})), Some(10));
        assert_eq!(extract_slot(&json!({"result": {"slot": 11}})), Some(11));
        assert_eq!(
            extract_slot(&json!({"context": {"slot": 13}, "value": {"slot": 12, "block": null}})),
            Some(12)
        );
        assert_eq!(extract_slot(&json!({"result": {"context": {"slot": 14}, "value": {}}})), Some(14));
        assert_eq!(extract_slot(&json!({"slot": "15"})), Some(15));
        assert_eq!(extract_slot(&json!({"slot": -1})), None);
        assert_eq!(extract_slot(&json!({"mint": "abc"})), None);
    }

    #[tokio::test]
    async fn notifications_become_ranked_tasks() {
        let queue = Arc::new(OrderedQueue::<BlockTask>::new("blocks"));
        let ingestor = SlotIngestor::new(queue.clone());

        ingestor.handle(json!({"slot": 30})).await;
        ingestor.handle(json!({"slot": 10})).await;
        ingestor.handle(json!({"nothing": true})).await;

        assert_eq!(ingestor.accepted(), 2);
        assert_eq!(ingestor.rejected(), 1);
        let (task, rank) = queue.pop_min().unwrap();
        assert_eq!((task.slot, rank), (10, 10));
        assert_eq!(task.payload, Value::Null);
    }

    #[tokio::test]
    async fn payload_kept_on_request() {
        let queue = Arc::new(OrderedQueue::<BlockTask>::new("blocks"));
        let ingestor = SlotIngestor::new(queue.clone()).keep_payload(true);
        let note = json!({"slot": 7, "parent": 6});
        assert_eq!(ingestor.ingest(note.clone()).await, Some(7));
        assert_eq!(queue.pop_min().unwrap().0.payload, note);
    }
}
