//! Enhanced-transactions API client (signature list in, classified
//! transactions out).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chainpipe_core::error::EnrichError;
use chainpipe_core::policy::{RateLimiter, RateLimiterConfig};
use chainpipe_core::source::TransactionParser;
use chainpipe_core::types::ParsedTransaction;

use crate::config::{normalize_endpoint, HttpClientConfig, HttpError};

pub const DEFAULT_ENHANCED_ENDPOINT: &str = "https://api.helius.xyz";

/// Configuration for one credential's client.
#[derive(Debug, Clone)]
pub struct EnhancedApiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub http: HttpClientConfig,
    /// Sustained request rate for this credential.
    pub requests_per_second: f64,
    /// Signatures accepted per call.
    pub max_batch: usize,
}

impl EnhancedApiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENHANCED_ENDPOINT.to_string(),
            api_key: api_key.into(),
            http: HttpClientConfig::default(),
            requests_per_second: 10.0,
            max_batch: 100,
        }
    }
}

#[derive(Serialize)]
struct ParseRequest<'a> {
    transactions: &'a [String],
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// One enrichment credential.
pub struct EnhancedApiClient {
    url: String,
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
    request_timeout: Duration,
    rate_limiter: RateLimiter,
    max_batch: usize,
}

impl std::fmt::Debug for EnhancedApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnhancedApiClient")
            .field("endpoint", &self.endpoint)
            .field("max_batch", &self.max_batch)
            .finish_non_exhaustive()
    }
}

impl EnhancedApiClient {
    pub fn new(config: EnhancedApiConfig) -> Result<Self, HttpError> {
        let endpoint = normalize_endpoint(&config.endpoint)?;
        if config.api_key.is_empty() {
            return Err(HttpError::InvalidEndpoint("empty api key".into()));
        }
        Ok(Self {
            url: format!("{endpoint}/v0/transactions?api-key={}", config.api_key),
            endpoint,
            http: config.http.build()?,
            request_timeout: config.http.request_timeout,
            rate_limiter: RateLimiter::new(RateLimiterConfig::per_second(config.requests_per_second)),
            max_batch: config.max_batch.max(1),
            api_key: config.api_key,
        })
    }

    /// One client per key, sharing every other setting.
    pub fn for_keys(base: &EnhancedApiConfig, keys: &[String]) -> Result<Vec<Self>, HttpError> {
        keys.iter()
            .map(|key| {
                Self::new(EnhancedApiConfig {
                    api_key: key.clone(),
                    ..base.clone()
                })
            })
            .collect()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, e: reqwest::Error) -> EnrichError {
        if e.is_timeout() {
            EnrichError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            EnrichError::Http(e.without_url().to_string())
        }
    }
}

#[async_trait]
impl TransactionParser for EnhancedApiClient {
    fn max_batch(&self) -> usize {
        self.max_batch
    }

    async fn parse_transactions(
        &self,
        signatures: &[String],
    ) -> Result<Vec<ParsedTransaction>, EnrichError> {
        if signatures.is_empty() {
            return Err(EnrichError::InvalidRequest("no signatures".into()));
        }
        if signatures.len() > self.max_batch {
            return Err(EnrichError::InvalidRequest(format!(
                "{} signatures exceeds the per-call limit of {}",
                signatures.len(),
                self.max_batch
            )));
        }

        self.rate_limiter.acquire().await;

        let resp = self
            .http
            .post(&self.url)
            .basic_auth(&self.api_key, None::<&str>)
            .json(&ParseRequest { transactions: signatures })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiErrorBody>(&body)
                .ok()
                .map(|b| b.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            return Err(EnrichError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice::<Vec<ParsedTransaction>>(&body)
            .map_err(|e| EnrichError::Malformed(e.to_string()))
    }
}
