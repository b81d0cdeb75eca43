//! Pipeline configuration: YAML file, `CHAINPIPE_*` environment overrides,
//! validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chainpipe_core::source::BlockRequestOptions;
use chainpipe_core::types::TransactionType;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "CHAINPIPE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// component (crate) name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

/// Global forward proxy; applied to every outbound client when enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

impl ProxyConfig {
    pub fn effective(&self) -> Option<String> {
        (self.enabled && !self.url.is_empty()).then(|| self.url.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[default]
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    pub block_queue: String,
    pub tx_queue: String,
    /// Keep the ordered queues in the store instead of process memory.
    pub durable_queues: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379/0".into(),
            key_prefix: "solana:".into(),
            block_queue: "blocks".into(),
            tx_queue: "transactions".into(),
            durable_queues: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// `mainnet` or `devnet`.
    pub network: String,
    pub api_key: String,
    /// Replaces the provider URL when set.
    pub url: Option<String>,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub handler_concurrency: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".into(),
            api_key: String::new(),
            url: None,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 60_000,
            handler_concurrency: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub block: BlockRequestOptions,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://mainnet.helius-rpc.com".into(),
            api_key: String::new(),
            timeout_ms: 30_000,
            block: BlockRequestOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub endpoint: String,
    /// One enrichment client per key.
    pub api_keys: Vec<String>,
    pub sub_batch_size: usize,
    pub call_timeout_ms: u64,
    pub dispatch_delay_ms: u64,
    pub idle_sleep_ms: u64,
    /// Per-key request rate.
    pub requests_per_second: f64,
    pub types_of_interest: Vec<TransactionType>,
    /// Expiry applied to result hashes; none when unset.
    pub result_ttl_secs: Option<u64>,
    /// List receiving dropped sub-batches; disabled when unset.
    pub dead_letter_key: Option<String>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.helius.xyz".into(),
            api_keys: Vec::new(),
            sub_batch_size: 50,
            call_timeout_ms: 60_000,
            dispatch_delay_ms: 200,
            idle_sleep_ms: 1_000,
            requests_per_second: 10.0,
            types_of_interest: TransactionType::default_interest(),
            result_ttl_secs: None,
            dead_letter_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockWorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub dispatch_delay_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for BlockWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            batch_size: 3,
            dispatch_delay_ms: 200,
            max_attempts: 5,
            retry_delay_ms: 2_000,
            fetch_timeout_ms: 30_000,
        }
    }
}

// ─── Root ────────────────────────────────────────────────────────────────────

/// Everything the `chainpipe` binary needs to wire a pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub block_worker: BlockWorkerConfig,
}

impl PipelineConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&raw)?;
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without overrides or validation.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `CHAINPIPE_*` overrides read through `lookup`.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        if let Some(key) = var("WS_API_KEY") {
            self.websocket.api_key = key;
        }
        if let Some(key) = var("RPC_API_KEY") {
            self.rpc.api_key = key;
        }
        if let Some(keys) = var("ENRICH_API_KEYS") {
            self.enrichment.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = var("REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(url) = var("PROXY_URL") {
            self.proxy.url = url;
            self.proxy.enabled = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.websocket.url.is_none()
            && !matches!(self.websocket.network.as_str(), "mainnet" | "devnet")
        {
            return Err(ConfigError::Invalid(format!(
                "websocket.network must be mainnet or devnet, got '{}'",
                self.websocket.network
            )));
        }
        if self.enrichment.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "at least one enrichment api key is required".into(),
            ));
        }
        if self.enrichment.sub_batch_size == 0 {
            return Err(ConfigError::Invalid("enrichment.sub_batch_size must be > 0".into()));
        }
        if self.block_worker.batch_size == 0 {
            return Err(ConfigError::Invalid("block_worker.batch_size must be > 0".into()));
        }
        if self.proxy.enabled && self.proxy.url.is_empty() {
            return Err(ConfigError::Invalid("proxy.enabled requires proxy.url".into()));
        }
        Ok(())
    }
}

impl WebSocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
