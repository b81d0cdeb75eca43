//! Shared `reqwest` client construction.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while building an HTTP client.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid proxy '{proxy}': {reason}")]
    Proxy { proxy: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Build(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Transport settings common to every HTTP collaborator.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Forward proxy applied to all schemes.
    pub proxy: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpClientConfig {
    pub fn build(&self) -> Result<reqwest::Client, HttpError> {
        let mut builder = reqwest::Client::builder().timeout(self.request_timeout);
        if let Some(proxy) = self.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| HttpError::Proxy {
                proxy: proxy.to_string(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| HttpError::Build(e.to_string()))
    }
}

/// Strip trailing slashes so path joins stay single-slashed.
pub(crate) fn normalize_endpoint(endpoint: &str) -> Result<String, HttpError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(HttpError::InvalidEndpoint(format!(
            "'{endpoint}' is not an http(s) URL"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_and_without_proxy() {
        assert!(HttpClientConfig::default().build().is_ok());
        let cfg = HttpClientConfig {
            proxy: Some("http://127.0.0.1:7890".into()),
            ..Default::default()
        };
        assert!(cfg.build().is_ok());
    }

    #[test]
    fn endpoint_normalization() {
        assert_eq!(
            normalize_endpoint("https://mainnet.helius-rpc.com/").unwrap(),
            "https://mainnet.helius-rpc.com"
        );
        assert!(normalize_endpoint("wss://mainnet.helius-rpc.com").is_err());
    }
}
