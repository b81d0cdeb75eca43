//! JSON-RPC block query client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use chainpipe_core::error::FetchError;
use chainpipe_core::request::{JsonRpcRequest, JsonRpcResponse};
use chainpipe_core::source::{BlockRequestOptions, BlockSource};
use chainpipe_core::types::Block;

use crate::config::{normalize_endpoint, HttpClientConfig, HttpError};

/// `getBlock` over HTTP JSON-RPC.
///
/// One attempt per call; retry belongs to the caller.
pub struct RpcBlockClient {
    url: String,
    endpoint: String,
    http: reqwest::Client,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl RpcBlockClient {
    /// Client for `{endpoint}/?api-key={api_key}`.
    pub fn new(endpoint: &str, api_key: &str, config: &HttpClientConfig) -> Result<Self, HttpError> {
        let endpoint = normalize_endpoint(endpoint)?;
        let url = if api_key.is_empty() {
            format!("{endpoint}/")
        } else {
            format!("{endpoint}/?api-key={api_key}")
        };
        Ok(Self {
            url,
            endpoint,
            http: config.build()?,
            request_timeout: config.request_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Endpoint without credentials, for logs.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, FetchError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            // Drop the URL: it carries the api key.
            FetchError::Http(e.without_url().to_string())
        }
    }
}

#[async_trait]
impl BlockSource for RpcBlockClient {
    async fn fetch_block(
        &self,
        slot: u64,
        options: &BlockRequestOptions,
    ) -> Result<Option<Block>, FetchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, "getBlock", vec![Value::from(slot), options.to_param()]);

        let result = self.call(&req).await?.into_result().map_err(FetchError::Rpc)?;
        if result.is_null() {
            tracing::debug!(slot, endpoint = %self.endpoint, "getBlock returned null");
            return Ok(None);
        }

        serde_json::from_value::<Block>(result)
            .map(Some)
            .map_err(|e| FetchError::Malformed(format!("slot {slot}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(url: &str) -> RpcBlockClient {
        RpcBlockClient::new(url, "k1", &HttpClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn fetches_and_decodes_block() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/")
                    .query_param("api-key", "k1")
                    .body_contains("\"getBlock\"")
                    .body_contains("\"transactionDetails\":\"full\"");
                then.status(200).header("content-type", "application/json").body(
                    r#"{"jsonrpc":"2.0","id":1,"result":{
                    "blockTime":1700000000,"blockhash":"h","parentSlot":99,"previousBlockhash":"p",
                    "transactions":[{"meta":{"err":null,"fee":5000,"logMessages":[]},
                                     "transaction":{"signatures":["sigA"],"message":{}}}]}}"#,
                );
            })
            .await;

        let block = client(&server.base_url())
            .fetch_block(100, &BlockRequestOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.parent_slot, 99);
        assert_eq!(block.transactions[0].signatures(), ["sigA".to_string()]);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn null_result_is_empty_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/");
                then.status(200).body(r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
            })
            .await;

        let got = client(&server.base_url())
            .fetch_block(5, &BlockRequestOptions::default())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/");
                then.status(200).body(
                    r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32007,"message":"Slot 5 was skipped"}}"#,
                );
            })
            .await;

        let err = client(&server.base_url())
            .fetch_block(5, &BlockRequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Rpc(ref e) if e.code == -32007));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn http_failure_and_malformed_block() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/").body_contains("[1,");
                then.status(503).body("overloaded");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/").body_contains("[2,");
                then.status(200)
                    .body(r#"{"jsonrpc":"2.0","id":2,"result":{"transactions":"nope"}}"#);
            })
            .await;
        let c = client(&server.base_url());
        let opts = BlockRequestOptions::default();

        let err = c.fetch_block(1, &opts).await.unwrap_err();
        assert!(matches!(err, FetchError::Http(ref m) if m.contains("503")));
        assert!(!err.to_string().contains("k1"), "api key leaked: {err}");

        let err = c.fetch_block(2, &opts).await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
        assert!(!err.is_retryable());
    }
}
