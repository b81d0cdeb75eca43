//! chainpipe-core: foundation types for the ChainPipe ingestion pipeline.
//!
//! # Overview
//!
//! ChainPipe ingests new blocks from a streaming subscription, fetches their
//! full content, fans transaction signatures out to an enrichment API and
//! persists the classified results. The core crate defines:
//!
//! - [`OrderedQueue`]: mutex-guarded binary min-heap keyed by slot
//! - [`TaskQueue`]: the queue contract workers consume
//! - [`TaskStore`] / [`StoreQueue`]: persistence facade and its queue adapter
//! - [`BlockSource`] / [`TransactionParser`]: upstream collaborator traits
//! - [`policy`] module: fixed/exponential retry and token bucket
//!
//! ```text
//! stream client ──► block queue ──► fetch + fanout ──► tx queue ──► enrichment ──► store
//! ```

pub mod error;
pub mod policy;
pub mod queue;
pub mod request;
pub mod source;
pub mod store;
pub mod types;

pub use error::{EnrichError, FetchError, StoreError};
pub use queue::{OrderedQueue, QueueItem, TaskQueue};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use source::{BlockRequestOptions, BlockSource, TransactionParser};
pub use store::{StoreQueue, TaskStore};
pub use types::{
    Block, BlockTask, BlockTransaction, ParsedTransaction, TransactionBatch, TransactionType,
};
