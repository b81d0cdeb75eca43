//! chainpipe-pipeline: the processing stages of ChainPipe and their wiring.
//!
//! ```text
//! SlotIngestor ──► block queue ──► BlockFetcher ──► tx queue ──► EnrichmentPool ──► TaskStore
//! ```
//!
//! Every stage takes its queues, clients and store by injection; nothing is
//! global.

pub mod block_worker;
pub mod config;
pub mod enrich_worker;
pub mod filter;
pub mod ingest;
pub mod logging;
pub mod stats;

pub use block_worker::{BlockFetcher, BlockWorkerSettings};
pub use config::{ConfigError, PipelineConfig};
pub use enrich_worker::{split_signatures, EnrichmentPool, EnrichmentSettings};
pub use filter::{filter_block, BlockDigest};
pub use ingest::SlotIngestor;
pub use stats::{BlockStats, EnrichStats};
