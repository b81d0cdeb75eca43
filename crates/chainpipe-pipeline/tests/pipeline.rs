//! End-to-end: notification → block queue → fetch/fanout → tx queue →
//! enrichment → store, with in-memory collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainpipe_core::error::{EnrichError, FetchError};
use chainpipe_core::queue::{OrderedQueue, TaskQueue};
use chainpipe_core::source::{BlockRequestOptions, BlockSource, TransactionParser};
use chainpipe_core::store::{StoreQueue, TaskStore};
use chainpipe_core::types::{
    Block, BlockTask, ParsedTransaction, TransactionBatch, TransactionType, VOTE_PROGRAM_ID,
};
use chainpipe_http::CredentialPool;
use chainpipe_pipeline::block_worker::{BlockFetcher, BlockWorkerSettings, SlotOutcome};
use chainpipe_pipeline::enrich_worker::{EnrichmentPool, EnrichmentSettings};
use chainpipe_pipeline::SlotIngestor;
use chainpipe_storage::MemoryStore;
use chainpipe_ws::NotificationHandler;

/// Serves canned blocks: slot 100 has two user transactions, slot 101 only
/// a vote, anything else is unavailable.
struct CannedChain {
    blocks: HashMap<u64, Block>,
}

impl CannedChain {
    fn new() -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(
            100,
            serde_json::from_value(json!({
                "parentSlot": 99,
                "transactions": [
                    { "meta": { "logMessages": [] }, "transaction": { "signatures": ["swap-1"] } },
                    { "meta": { "logMessages": [format!("Program {VOTE_PROGRAM_ID} invoke [1]")] },
                      "transaction": { "signatures": ["vote-1"] } },
                    { "meta": { "status": { "Err": { "InstructionError": [0, "Custom"] } } },
                      "transaction": { "signatures": ["failed-1"] } },
                    { "meta": {}, "transaction": { "signatures": ["nft-1"] } }
                ]
            }))
            .unwrap(),
        );
        blocks.insert(
            101,
            serde_json::from_value(json!({
                "parentSlot": 100,
                "transactions": [
                    { "meta": { "logMessages": [format!("Program {VOTE_PROGRAM_ID} success")] },
                      "transaction": { "signatures": ["vote-2"] } }
                ]
            }))
            .unwrap(),
        );
        Self { blocks }
    }
}

#[async_trait]
impl BlockSource for CannedChain {
    async fn fetch_block(
        &self,
        slot: u64,
        _options: &BlockRequestOptions,
    ) -> Result<Option<Block>, FetchError> {
        match self.blocks.get(&slot) {
            Some(block) => Ok(Some(block.clone())),
            None => Err(FetchError::Http("block not available".into())),
        }
    }
}

/// Classifies `swap-*` as SWAP on RAYDIUM and everything else as NFT_SALE.
struct Classifier;

#[async_trait]
impl TransactionParser for Classifier {
    async fn parse_transactions(
        &self,
        signatures: &[String],
    ) -> Result<Vec<ParsedTransaction>, EnrichError> {
        Ok(signatures
            .iter()
            .map(|sig| {
                let (source, kind) = if sig.starts_with("swap") {
                    ("RAYDIUM", TransactionType::Swap)
                } else {
                    ("MAGIC_EDEN", TransactionType::from("NFT_SALE"))
                };
                ParsedTransaction {
                    signature: sig.clone(),
                    source: source.into(),
                    kind,
                    ..Default::default()
                }
            })
            .collect())
    }
}

struct Pipeline {
    ingestor: SlotIngestor,
    fetcher: BlockFetcher,
    enrichment: EnrichmentPool,
}

fn pipeline(
    blocks: Arc<dyn TaskQueue<BlockTask>>,
    txs: Arc<dyn TaskQueue<TransactionBatch>>,
    store: Arc<dyn TaskStore>,
) -> Pipeline {
    let clients: Vec<Arc<dyn TransactionParser>> = vec![Arc::new(Classifier), Arc::new(Classifier)];
    Pipeline {
        ingestor: SlotIngestor::new(Arc::clone(&blocks)),
        fetcher: BlockFetcher::new(
            Arc::new(CannedChain::new()),
            blocks,
            Arc::clone(&txs),
            BlockWorkerSettings::default(),
        ),
        enrichment: EnrichmentPool::new(
            Arc::new(CredentialPool::new(clients).unwrap()),
            txs,
            store,
            EnrichmentSettings::default(),
        ),
    }
}

#[tokio::test(start_paused = true)]
async fn slot_notifications_end_up_as_classified_records() {
    let blocks = Arc::new(OrderedQueue::<BlockTask>::new("blocks"));
    let txs = Arc::new(OrderedQueue::<TransactionBatch>::new("transactions"));
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(blocks.clone(), txs.clone(), store.clone());

    for slot in [101u64, 100] {
        p.ingestor.handle(json!({ "slot": slot, "parent": slot - 1, "root": slot - 32 })).await;
    }
    p.ingestor.handle(Value::Null).await;
    assert_eq!(blocks.len(), 2);
    assert_eq!(p.ingestor.rejected(), 1);

    let outcomes = p.fetcher.run_cycle().await;
    assert_eq!(
        outcomes,
        vec![(100, SlotOutcome::Enqueued(2)), (101, SlotOutcome::NothingToEnqueue)]
    );
    assert_eq!(txs.len(), 1);

    let report = p.enrichment.run_cycle().await.unwrap();
    assert_eq!(report.slot, 100);
    assert!(txs.is_empty());

    assert_eq!(store.field("RAYDIUM", "RAYDIUM").as_deref(), Some("SWAP"));
    assert_eq!(store.field("RAYDIUM_SWAP", "swap-1").as_deref(), Some("SWAP"));
    // NFT_SALE is not a type of interest.
    assert!(store.hash_fields("MAGIC_EDEN_NFT_SALE").is_empty());
    assert!(store.field("RAYDIUM_SWAP", "vote-1").is_none());
    assert!(store.field("RAYDIUM_SWAP", "failed-1").is_none());

    assert!(p.enrichment.run_cycle().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn unavailable_block_is_abandoned_without_blocking_others() {
    let blocks = Arc::new(OrderedQueue::<BlockTask>::new("blocks"));
    let txs = Arc::new(OrderedQueue::<TransactionBatch>::new("transactions"));
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(blocks.clone(), txs.clone(), store);

    p.ingestor.handle(json!({ "slot": 55 })).await;
    p.ingestor.handle(json!({ "slot": 100 })).await;

    let outcomes = p.fetcher.run_cycle().await;
    assert_eq!(
        outcomes,
        vec![(55, SlotOutcome::Abandoned), (100, SlotOutcome::Enqueued(2))]
    );
    assert!(blocks.is_empty());
    assert_eq!(p.fetcher.stats().abandoned.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn store_backed_queues_drive_the_same_workers() {
    let store = Arc::new(MemoryStore::new());
    let blocks: Arc<dyn TaskQueue<BlockTask>> =
        Arc::new(StoreQueue::<BlockTask>::new(store.clone(), "blocks"));
    let txs: Arc<dyn TaskQueue<TransactionBatch>> =
        Arc::new(StoreQueue::<TransactionBatch>::new(store.clone(), "transactions"));
    let p = pipeline(Arc::clone(&blocks), Arc::clone(&txs), store.clone());

    p.ingestor.handle(json!({ "result": { "slot": 100 } })).await;
    assert_eq!(store.length("blocks").await.unwrap(), 1);

    p.fetcher.run_cycle().await;
    assert_eq!(store.length("blocks").await.unwrap(), 0);
    assert_eq!(store.length("transactions").await.unwrap(), 1);

    p.enrichment.run_cycle().await.unwrap();
    assert_eq!(store.length("transactions").await.unwrap(), 0);
    assert_eq!(store.length("RAYDIUM_SWAP").await.unwrap(), 1);
    assert!(store.exists("RAYDIUM").await.unwrap());
}
