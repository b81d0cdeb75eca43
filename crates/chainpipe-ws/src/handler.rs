//! Notification handlers.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

/// Receives one notification payload per call.
///
/// For JSON-RPC endpoints the payload is the notification's `params.result`;
/// for bare-JSON endpoints it is the whole frame. Each call runs in its own
/// task, so handlers may be invoked concurrently and out of order.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn handle(&self, notification: Value);
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, notification: Value) {
        (self)(notification).await
    }
}
