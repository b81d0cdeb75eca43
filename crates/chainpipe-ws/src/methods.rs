//! Typed subscribe helpers for the supported stream sources.
//!
//! Solana pubsub (JSON-RPC) helpers return a [`SubscriptionId`] that can be
//! passed to [`StreamClient::unsubscribe`]. PumpPortal helpers do the same;
//! their unsubscribe frame repeats the original keys.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::client::StreamClient;
use crate::error::StreamError;
use crate::handler::NotificationHandler;
use crate::subscriptions::SubscriptionId;

/// Block filter for `blockSubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockFilter {
    All,
    MentionsAccountOrProgram(String),
}

impl BlockFilter {
    fn to_param(&self) -> Value {
        match self {
            Self::All => json!("all"),
            Self::MentionsAccountOrProgram(key) => json!({ "mentionsAccountOrProgram": key }),
        }
    }
}

// ─── Solana pubsub ───────────────────────────────────────────────────────────

impl StreamClient {
    pub async fn slot_subscribe(
        &self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        self.subscribe("slotSubscribe", json!([]), handler).await
    }

    pub async fn root_subscribe(
        &self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        self.subscribe("rootSubscribe", json!([]), handler).await
    }

    /// Full blocks as they are confirmed. Not every node enables this.
    pub async fn block_subscribe(
        &self,
        filter: BlockFilter,
        commitment: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        let params = json!([
            filter.to_param(),
            {
                "commitment": commitment,
                "encoding": "json",
                "transactionDetails": "signatures",
                "maxSupportedTransactionVersion": 0,
                "showRewards": false,
            }
        ]);
        self.subscribe("blockSubscribe", params, handler).await
    }

    /// `filter` is `"all"`, `"allWithVotes"` or `{"mentions": [pubkey]}`.
    pub async fn logs_subscribe(
        &self,
        filter: Value,
        commitment: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        let params = json!([filter, { "commitment": commitment }]);
        self.subscribe("logsSubscribe", params, handler).await
    }

    pub async fn account_subscribe(
        &self,
        pubkey: &str,
        encoding: &str,
        commitment: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        let params = json!([pubkey, { "encoding": encoding, "commitment": commitment }]);
        self.subscribe("accountSubscribe", params, handler).await
    }

    pub async fn program_subscribe(
        &self,
        program_id: &str,
        encoding: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        let params = json!([program_id, { "encoding": encoding }]);
        self.subscribe("programSubscribe", params, handler).await
    }

    pub async fn signature_subscribe(
        &self,
        signature: &str,
        commitment: &str,
        enable_received_notification: bool,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        let params = json!([
            signature,
            {
                "commitment": commitment,
                "enableReceivedNotification": enable_received_notification,
            }
        ]);
        self.subscribe("signatureSubscribe", params, handler).await
    }
}

// ─── PumpPortal ──────────────────────────────────────────────────────────────

impl StreamClient {
    pub async fn subscribe_new_token(
        &self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        self.subscribe("subscribeNewToken", Value::Null, handler).await
    }

    pub async fn subscribe_migration(
        &self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        self.subscribe("subscribeMigration", Value::Null, handler).await
    }

    /// Trades on the given token mints.
    pub async fn subscribe_token_trade(
        &self,
        mints: &[String],
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        self.subscribe("subscribeTokenTrade", json!(mints), handler).await
    }

    /// Trades made by the given wallets.
    pub async fn subscribe_account_trade(
        &self,
        accounts: &[String],
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        self.subscribe("subscribeAccountTrade", json!(accounts), handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_filter_params() {
        assert_eq!(BlockFilter::All.to_param(), json!("all"));
        assert_eq!(
            BlockFilter::MentionsAccountOrProgram("prog".into()).to_param(),
            json!({"mentionsAccountOrProgram": "prog"})
        );
    }
}
