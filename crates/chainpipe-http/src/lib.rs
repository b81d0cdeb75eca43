//! chainpipe-http: HTTP collaborators of the ChainPipe pipeline.
//!
//! - [`RpcBlockClient`]: `getBlock` over JSON-RPC, implements [`BlockSource`]
//! - [`EnhancedApiClient`]: enhanced-transactions API with a per-credential
//!   token bucket, implements [`TransactionParser`]
//! - [`CredentialPool`]: round-robin over interchangeable clients with at most
//!   one in-flight call per credential
//!
//! [`BlockSource`]: chainpipe_core::BlockSource
//! [`TransactionParser`]: chainpipe_core::TransactionParser

pub mod config;
pub mod enhanced;
pub mod pool;
pub mod rpc;

pub use config::{HttpClientConfig, HttpError};
pub use enhanced::{EnhancedApiClient, EnhancedApiConfig};
pub use pool::{Checkout, CredentialPool, PoolError};
pub use rpc::RpcBlockClient;
