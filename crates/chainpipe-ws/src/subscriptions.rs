//! Subscription registry.
//!
//! Records every requested subscription so it can be re-issued after a
//! reconnect, and maps server-assigned ids (learned from subscribe acks) back
//! to local ids for notification routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::handler::NotificationHandler;

/// Client-local subscription id; stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
struct SubscriptionEntry {
    method: String,
    params: Value,
    /// Notification method routed to this entry.
    route: String,
    handler: Arc<dyn NotificationHandler>,
    /// Server id from the latest ack; cleared on disconnect.
    server_id: Option<u64>,
}

/// Snapshot of one registered subscription.
#[derive(Clone)]
pub struct Registered {
    pub id: SubscriptionId,
    pub method: String,
    pub params: Value,
    pub server_id: Option<u64>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    /// Subscribe request id → local id, awaiting the ack.
    pending: HashMap<u64, SubscriptionId>,
}

/// Thread-safe registry shared between the client handle and its loops.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    state: Arc<Mutex<RegistryState>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a subscription; `route` is the notification method it answers.
    pub fn register(
        &self,
        method: impl Into<String>,
        params: Value,
        route: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.state().entries.insert(
            id,
            SubscriptionEntry {
                method: method.into(),
                params,
                route: route.into(),
                handler,
                server_id: None,
            },
        );
        id
    }

    /// Drop a subscription; returns its last snapshot.
    pub fn remove(&self, id: SubscriptionId) -> Option<Registered> {
        let mut state = self.state();
        state.pending.retain(|_, pending| *pending != id);
        state.entries.remove(&id).map(|e| Registered {
            id,
            method: e.method,
            params: e.params,
            server_id: e.server_id,
        })
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Registered> {
        self.state().entries.get(&id).map(|e| Registered {
            id,
            method: e.method.clone(),
            params: e.params.clone(),
            server_id: e.server_id,
        })
    }

    /// Remember that subscribe request `request_id` was sent for `id`.
    pub fn mark_pending(&self, request_id: u64, id: SubscriptionId) {
        self.state().pending.insert(request_id, id);
    }

    /// Bind the server id carried by the ack of `request_id`.
    pub fn confirm(&self, request_id: u64, server_id: u64) -> Option<SubscriptionId> {
        let mut state = self.state();
        let id = state.pending.remove(&request_id)?;
        let entry = state.entries.get_mut(&id)?;
        entry.server_id = Some(server_id);
        Some(id)
    }

    /// Forget a failed subscribe request.
    pub fn reject(&self, request_id: u64) -> Option<SubscriptionId> {
        self.state().pending.remove(&request_id)
    }

    /// Handlers for a JSON-RPC notification.
    ///
    /// An exact server-id match wins; otherwise every entry routed on
    /// `method` receives it (acks may race the first notifications).
    pub fn handlers_for(&self, method: &str, server_id: Option<u64>) -> Vec<Arc<dyn NotificationHandler>> {
        let state = self.state();
        if let Some(sid) = server_id {
            let exact: Vec<_> = state
                .entries
                .values()
                .filter(|e| e.server_id == Some(sid))
                .map(|e| Arc::clone(&e.handler))
                .collect();
            if !exact.is_empty() {
                return exact;
            }
        }
        state
            .entries
            .values()
            .filter(|e| e.route == method && (server_id.is_none() || e.server_id.is_none()))
            .map(|e| Arc::clone(&e.handler))
            .collect()
    }

    /// Every registered handler, for protocols without routing.
    pub fn all_handlers(&self) -> Vec<Arc<dyn NotificationHandler>> {
        self.state()
            .entries
            .values()
            .map(|e| Arc::clone(&e.handler))
            .collect()
    }

    /// Subscriptions to re-issue after reconnect, in registration order.
    pub fn active_subscriptions(&self) -> Vec<Registered> {
        let mut active: Vec<_> = self
            .state()
            .entries
            .iter()
            .map(|(id, e)| Registered {
                id: *id,
                method: e.method.clone(),
                params: e.params.clone(),
                server_id: e.server_id,
            })
            .collect();
        active.sort_by_key(|r| r.id);
        active
    }

    /// Server ids die with the connection.
    pub fn reset_server_ids(&self) {
        let mut state = self.state();
        state.pending.clear();
        for entry in state.entries.values_mut() {
            entry.server_id = None;
        }
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn NotificationHandler> {
        Arc::new(|_v: Value| async {})
    }

    #[test]
    fn register_and_remove() {
        let reg = SubscriptionRegistry::new();
        let id = reg.register("slotSubscribe", Value::Null, "slotNotification", noop());
        assert_eq!(reg.len(), 1);
        let removed = reg.remove(id).unwrap();
        assert_eq!(removed.method, "slotSubscribe");
        assert!(reg.is_empty());
        assert!(reg.remove(id).is_none());
    }

    #[test]
    fn ack_binds_server_id() {
        let reg = SubscriptionRegistry::new();
        let id = reg.register("slotSubscribe", Value::Null, "slotNotification", noop());
        reg.mark_pending(7, id);
        assert_eq!(reg.confirm(7, 4242), Some(id));
        assert_eq!(reg.get(id).unwrap().server_id, Some(4242));
        assert_eq!(reg.confirm(7, 1), None);
    }

    #[test]
    fn routing_prefers_server_id() {
        let reg = SubscriptionRegistry::new();
        let a = reg.register("logsSubscribe", json!(["all"]), "logsNotification", noop());
        let b = reg.register("logsSubscribe", json!(["allWithVotes"]), "logsNotification", noop());
        reg.mark_pending(1, a);
        reg.mark_pending(2, b);
        reg.confirm(1, 100);
        reg.confirm(2, 200);

        assert_eq!(reg.handlers_for("logsNotification", Some(200)).len(), 1);
        // Unknown server id and nothing unbound: no one gets it.
        assert!(reg.handlers_for("logsNotification", Some(999)).is_empty());
        assert!(reg.handlers_for("slotNotification", None).is_empty());
    }

    #[test]
    fn unacked_entries_receive_by_method() {
        let reg = SubscriptionRegistry::new();
        reg.register("slotSubscribe", Value::Null, "slotNotification", noop());
        assert_eq!(reg.handlers_for("slotNotification", Some(5)).len(), 1);
    }

    #[test]
    fn reset_clears_server_ids_but_keeps_entries() {
        let reg = SubscriptionRegistry::new();
        let id = reg.register("slotSubscribe", Value::Null, "slotNotification", noop());
        reg.mark_pending(1, id);
        reg.confirm(1, 10);
        reg.reset_server_ids();
        let active = reg.active_subscriptions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].server_id, None);
    }
}
