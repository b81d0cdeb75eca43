//! Stream client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The client was closed; no further connects are possible.
    #[error("stream client is closed")]
    Closed,

    /// No live connection to send on.
    #[error("stream client is not connected")]
    NotConnected,

    /// Transport could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Forward proxy refused or mangled the CONNECT tunnel.
    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
}

impl StreamError {
    /// Returns `true` if reconnecting may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::Connect(_)
                | Self::Proxy(_)
                | Self::Timeout { .. }
                | Self::Send(_)
                | Self::Receive(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        assert!(!StreamError::Closed.is_retryable());
        assert!(!StreamError::InvalidEndpoint("x".into()).is_retryable());
        assert!(StreamError::Timeout { ms: 10 }.is_retryable());
        assert!(StreamError::Connect("refused".into()).is_retryable());
    }
}
