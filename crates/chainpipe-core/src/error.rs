//! Error types shared by the pipeline stages.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors raised by a [`TaskStore`](crate::store::TaskStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or the command failed in transit.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be (de)serialized.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The key holds a value of a different kind (e.g. a list read as a heap).
    #[error("wrong value kind for key '{key}'")]
    WrongKind { key: String },
}

/// Errors raised while fetching a block from the query service.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed (connection refused, non-2xx, body read, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// The attempt exceeded its time budget.
    #[error("block fetch timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node answered but the block payload could not be decoded.
    #[error("malformed block payload: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Returns `true` if another attempt may succeed.
    ///
    /// Decoding failures are permanent for a given slot; everything else is
    /// transient from the worker's point of view.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

/// Errors raised by an enrichment (transaction parsing) call.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// Transport failure or non-2xx status.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The API rejected the request with an error message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The call exceeded its time budget.
    #[error("enrichment call timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response body was not a list of parsed transactions.
    #[error("malformed enrichment payload: {0}")]
    Malformed(String),

    /// The request itself was invalid (e.g. no signatures).
    #[error("invalid enrichment request: {0}")]
    InvalidRequest(String),
}

impl EnrichError {
    /// Returns `true` if the upstream throttled the caller.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Api { status: 429, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_block_is_not_retryable() {
        assert!(!FetchError::Malformed("bad".into()).is_retryable());
        assert!(FetchError::Http("refused".into()).is_retryable());
        assert!(FetchError::Timeout { ms: 10 }.is_retryable());
    }

    #[test]
    fn rate_limit_detection() {
        let err = EnrichError::Api { status: 429, message: "slow down".into() };
        assert!(err.is_rate_limited());
        assert!(!EnrichError::Timeout { ms: 1 }.is_rate_limited());
    }
}
