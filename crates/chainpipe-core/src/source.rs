//! Upstream collaborators: the block query service and the enrichment API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EnrichError, FetchError};
use crate::types::{Block, ParsedTransaction};

/// Options forwarded with every `getBlock` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockRequestOptions {
    pub encoding: String,
    pub transaction_details: String,
    pub max_supported_transaction_version: u8,
    pub commitment: String,
    pub rewards: bool,
}

impl Default for BlockRequestOptions {
    fn default() -> Self {
        Self {
            encoding: "json".into(),
            transaction_details: "full".into(),
            max_supported_transaction_version: 0,
            commitment: "finalized".into(),
            rewards: false,
        }
    }
}

impl BlockRequestOptions {
    /// The options object as sent in the JSON-RPC params array.
    pub fn to_param(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Block query service.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    /// Fetch one block.
    ///
    /// `Ok(None)` is an empty response (skipped or not yet available slot),
    /// which callers treat as retryable.
    async fn fetch_block(
        &self,
        slot: u64,
        options: &BlockRequestOptions,
    ) -> Result<Option<Block>, FetchError>;
}

/// Enrichment API: turns signatures into classified transactions.
#[async_trait]
pub trait TransactionParser: Send + Sync + 'static {
    /// Largest number of signatures accepted per call.
    fn max_batch(&self) -> usize {
        100
    }

    async fn parse_transactions(
        &self,
        signatures: &[String],
    ) -> Result<Vec<ParsedTransaction>, EnrichError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_param_shape() {
        let param = BlockRequestOptions::default().to_param();
        assert_eq!(param["encoding"], "json");
        assert_eq!(param["transactionDetails"], "full");
        assert_eq!(param["maxSupportedTransactionVersion"], 0);
        assert_eq!(param["commitment"], "finalized");
        assert_eq!(param["rewards"], false);
    }
}
