//! Transaction enrichment stage.
//!
//! Pops one [`TransactionBatch`] at a time, splits it into sub-batches and
//! hands each to the next credential of the [`CredentialPool`]. All
//! sub-batches of a batch finish before the next batch is popped. A failed
//! call drops its sub-batch; with a dead-letter list configured the dropped
//! signatures are recorded there first.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use chainpipe_core::error::EnrichError;
use chainpipe_core::queue::TaskQueue;
use chainpipe_core::source::TransactionParser;
use chainpipe_core::store::TaskStore;
use chainpipe_core::types::{ParsedTransaction, TransactionBatch, TransactionType};
use chainpipe_http::pool::CredentialPool;

use crate::config::EnrichmentConfig;
use crate::stats::{bump, EnrichStats};

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    pub sub_batch_size: usize,
    /// Bound on one enrichment call.
    pub call_timeout: Duration,
    pub dispatch_delay: Duration,
    /// Sleep when the queue is empty.
    pub idle_sleep: Duration,
    pub types_of_interest: Vec<TransactionType>,
    pub result_ttl: Option<Duration>,
    pub dead_letter_key: Option<String>,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self::from_config(&EnrichmentConfig::default())
    }
}

impl EnrichmentSettings {
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self {
            sub_batch_size: config.sub_batch_size.max(1),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            dispatch_delay: Duration::from_millis(config.dispatch_delay_ms),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms),
            types_of_interest: config.types_of_interest.clone(),
            result_ttl: config.result_ttl_secs.map(Duration::from_secs),
            dead_letter_key: config.dead_letter_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

/// Split `signatures` into consecutive chunks of at most `size`.
pub fn split_signatures(signatures: &[String], size: usize) -> Vec<Vec<String>> {
    signatures.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubBatchOutcome {
    Completed { persisted: usize, skipped: usize },
    Dropped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBatchReport {
    pub client_index: usize,
    pub signatures: usize,
    pub outcome: SubBatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub slot: u64,
    pub sub_batches: Vec<SubBatchReport>,
}

/// Record of a dropped sub-batch, pushed as JSON to the dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub slot: u64,
    pub client_index: usize,
    pub signatures: Vec<String>,
    pub error: String,
    pub dropped_at: chrono::DateTime<chrono::Utc>,
}

pub struct EnrichmentPool {
    pool: Arc<CredentialPool<dyn TransactionParser>>,
    queue: Arc<dyn TaskQueue<TransactionBatch>>,
    store: Arc<dyn TaskStore>,
    settings: EnrichmentSettings,
    stats: Arc<EnrichStats>,
}

impl EnrichmentPool {
    /// The sub-batch size is capped by the smallest per-call limit in the pool.
    pub fn new(
        pool: Arc<CredentialPool<dyn TransactionParser>>,
        queue: Arc<dyn TaskQueue<TransactionBatch>>,
        store: Arc<dyn TaskStore>,
        mut settings: EnrichmentSettings,
    ) -> Self {
        let limit = (0..pool.len())
            .filter_map(|i| pool.get(i))
            .map(|c| c.max_batch())
            .min()
            .unwrap_or(settings.sub_batch_size);
        settings.sub_batch_size = settings.sub_batch_size.min(limit).max(1);
        Self {
            pool,
            queue,
            store,
            settings,
            stats: Arc::new(EnrichStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<EnrichStats> {
        Arc::clone(&self.stats)
    }

    pub fn settings(&self) -> &EnrichmentSettings {
        &self.settings
    }

    /// Consume batches until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            credentials = self.pool.len(),
            sub_batch_size = self.settings.sub_batch_size,
            "enrichment pool started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.run_cycle().await.is_some() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.idle_sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("enrichment pool stopped");
    }

    /// Pop and fully process one batch; `None` when the queue is empty.
    pub async fn run_cycle(&self) -> Option<BatchReport> {
        match self.queue.pop_min().await {
            Ok(Some((batch, _rank))) => Some(self.process_batch(batch).await),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(queue = self.queue.name(), error = %e, "transaction queue pop failed");
                None
            }
        }
    }

    pub async fn process_batch(&self, batch: TransactionBatch) -> BatchReport {
        let slot = batch.slot;
        let chunks = split_signatures(&batch.signatures, self.settings.sub_batch_size);
        bump(&self.stats.batches, 1);

        let delay = self.settings.dispatch_delay;
        let work = chunks.into_iter().enumerate().map(|(i, chunk)| {
            let client_index = self.pool.next_index();
            async move {
                tokio::time::sleep(delay * (i as u32 + 1)).await;
                self.process_sub_batch(slot, client_index, chunk).await
            }
        });
        // Collect first so cursor order follows chunk order.
        let work: Vec<_> = work.collect();
        let sub_batches = join_all(work).await;

        tracing::info!(slot, sub_batches = sub_batches.len(), "transaction batch processed");
        BatchReport { slot, sub_batches }
    }

    async fn process_sub_batch(
        &self,
        slot: u64,
        client_index: usize,
        signatures: Vec<String>,
    ) -> SubBatchReport {
        let count = signatures.len();
        let result = self.call(client_index, &signatures).await;

        let outcome = match result {
            Ok(parsed) => {
                let (persisted, skipped) = self.persist_all(slot, &parsed).await;
                bump(&self.stats.sub_batches_ok, 1);
                SubBatchOutcome::Completed { persisted, skipped }
            }
            Err(e) => {
                tracing::error!(slot, client_index, signatures = count, error = %e, "enrichment call failed, dropping sub-batch");
                bump(&self.stats.sub_batches_dropped, 1);
                self.dead_letter(slot, client_index, signatures, &e).await;
                SubBatchOutcome::Dropped { reason: e.to_string() }
            }
        };

        SubBatchReport {
            client_index,
            signatures: count,
            outcome,
        }
    }

    async fn call(
        &self,
        client_index: usize,
        signatures: &[String],
    ) -> Result<Vec<ParsedTransaction>, EnrichError> {
        let checkout = self.pool.checkout(client_index).await.ok_or_else(|| {
            EnrichError::InvalidRequest(format!("no credential at index {client_index}"))
        })?;
        let timeout = self.settings.call_timeout;
        tokio::time::timeout(timeout, checkout.client.parse_transactions(signatures))
            .await
            .map_err(|_| EnrichError::Timeout {
                ms: timeout.as_millis() as u64,
            })?
    }

    async fn persist_all(&self, slot: u64, parsed: &[ParsedTransaction]) -> (usize, usize) {
        if parsed.is_empty() {
            tracing::warn!(slot, "enrichment returned no transactions");
        }
        let mut persisted = 0;
        let mut skipped = 0;
        for tx in parsed {
            if tx.has_instruction_error() || !self.settings.types_of_interest.contains(&tx.kind) {
                skipped += 1;
                continue;
            }
            if self.persist(tx).await {
                persisted += 1;
            }
        }
        bump(&self.stats.transactions_persisted, persisted as u64);
        bump(&self.stats.transactions_skipped, skipped as u64);
        (persisted, skipped)
    }

    /// `{source}/{source} = type` marks the program as active;
    /// `{source}_{type}/{signature} = type` records the transaction.
    async fn persist(&self, tx: &ParsedTransaction) -> bool {
        let kind = tx.kind.as_str();
        let ttl = self.settings.result_ttl;
        let mut ok = true;

        if let Err(e) = self.store.set_field(&tx.source, &tx.source, kind, ttl).await {
            tracing::error!(source = %tx.source, error = %e, "failed to store program marker");
            ok = false;
        }
        let hash = format!("{}_{}", tx.source, kind);
        if let Err(e) = self.store.set_field(&hash, &tx.signature, kind, ttl).await {
            tracing::error!(hash = %hash, signature = %tx.signature, error = %e, "failed to store transaction");
            ok = false;
        }
        if ok {
            tracing::debug!(signature = %tx.signature, source = %tx.source, kind, "transaction stored");
        }
        ok
    }

    async fn dead_letter(&self, slot: u64, client_index: usize, signatures: Vec<String>, error: &EnrichError) {
        let Some(key) = &self.settings.dead_letter_key else {
            return;
        };
        let record = DeadLetter {
            slot,
            client_index,
            signatures,
            error: error.to_string(),
            dropped_at: chrono::Utc::now(),
        };
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(slot, error = %e, "failed to encode dead letter");
                return;
            }
        };
        if let Err(e) = self.store.push_list(key, encoded).await {
            tracing::error!(slot, key = %key, error = %e, "failed to record dead letter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chainpipe_core::queue::OrderedQueue;
    use chainpipe_storage::MemoryStore;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Echo,
        Fail,
        Hang,
    }

    /// Returns one SWAP per signature, or fails.
    struct MockParser {
        behaviour: Behaviour,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl MockParser {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransactionParser for MockParser {
        async fn parse_transactions(
            &self,
            signatures: &[String],
        ) -> Result<Vec<ParsedTransaction>, EnrichError> {
            self.calls.lock().unwrap().push(signatures.to_vec());
            match self.behaviour {
                Behaviour::Echo => Ok(signatures
                    .iter()
                    .map(|s| ParsedTransaction {
                        signature: s.clone(),
                        source: "RAYDIUM".into(),
                        kind: TransactionType::Swap,
                        ..Default::default()
                    })
                    .collect()),
                Behaviour::Fail => Err(EnrichError::Api {
                    status: 500,
                    message: "boom".into(),
                }),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn sigs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sig{i:03}")).collect()
    }

    fn credential_pool(parsers: &[Arc<MockParser>]) -> Arc<CredentialPool<dyn TransactionParser>> {
        let clients: Vec<Arc<dyn TransactionParser>> = parsers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn TransactionParser>)
            .collect();
        Arc::new(CredentialPool::new(clients).unwrap())
    }

    fn enrichment(
        parsers: &[Arc<MockParser>],
        settings: EnrichmentSettings,
    ) -> (EnrichmentPool, Arc<OrderedQueue<TransactionBatch>>, Arc<MemoryStore>) {
        let queue = Arc::new(OrderedQueue::<TransactionBatch>::new("transactions"));
        let store = Arc::new(MemoryStore::new());
        let pool = EnrichmentPool::new(credential_pool(parsers), queue.clone(), store.clone(), settings);
        (pool, queue, store)
    }

    #[test]
    fn split_120_by_50() {
        let chunks = split_signatures(&sigs(120), 50);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(chunks[2][0], "sig100");
        assert!(split_signatures(&[], 50).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sub_batches_rotate_across_credentials() {
        let parsers = [
            MockParser::new(Behaviour::Echo),
            MockParser::new(Behaviour::Echo),
            MockParser::new(Behaviour::Echo),
        ];
        let (pool, _queue, _store) = enrichment(&parsers, EnrichmentSettings::default());

        let report = pool.process_batch(TransactionBatch::new(7, sigs(120))).await;
        let layout: Vec<(usize, usize)> = report
            .sub_batches
            .iter()
            .map(|s| (s.client_index, s.signatures))
            .collect();
        assert_eq!(layout, vec![(0, 50), (1, 50), (2, 20)]);
        assert_eq!(parsers[2].calls()[0].len(), 20);

        // The cursor carries over to the next batch.
        let report = pool.process_batch(TransactionBatch::new(8, sigs(10))).await;
        assert_eq!(report.sub_batches[0].client_index, 0);
        let report = pool.process_batch(TransactionBatch::new(9, sigs(10))).await;
        assert_eq!(report.sub_batches[0].client_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persists_both_fields_per_transaction() {
        let parsers = [MockParser::new(Behaviour::Echo)];
        let (pool, queue, store) = enrichment(&parsers, EnrichmentSettings::default());
        queue.push(TransactionBatch::new(3, sigs(2)), 3);

        let report = pool.run_cycle().await.unwrap();
        assert_eq!(
            report.sub_batches[0].outcome,
            SubBatchOutcome::Completed { persisted: 2, skipped: 0 }
        );
        assert_eq!(store.field("RAYDIUM", "RAYDIUM").as_deref(), Some("SWAP"));
        assert_eq!(store.field("RAYDIUM_SWAP", "sig000").as_deref(), Some("SWAP"));
        assert_eq!(store.field("RAYDIUM_SWAP", "sig001").as_deref(), Some("SWAP"));
        assert!(pool.run_cycle().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn skips_errors_and_uninteresting_types() {
        struct Mixed;

        #[async_trait]
        impl TransactionParser for Mixed {
            async fn parse_transactions(
                &self,
                _signatures: &[String],
            ) -> Result<Vec<ParsedTransaction>, EnrichError> {
                let failed: ParsedTransaction = serde_json::from_value(serde_json::json!({
                    "signature": "failed", "source": "JUPITER", "type": "SWAP",
                    "transactionError": { "instructionError": [2, { "Custom": 1 }] }
                }))
                .unwrap();
                Ok(vec![
                    failed,
                    ParsedTransaction {
                        signature: "nft".into(),
                        source: "MAGIC_EDEN".into(),
                        kind: "NFT_SALE".into(),
                        ..Default::default()
                    },
                    ParsedTransaction {
                        signature: "burn".into(),
                        source: "SYSTEM_PROGRAM".into(),
                        kind: TransactionType::Burn,
                        ..Default::default()
                    },
                ])
            }
        }

        let queue = Arc::new(OrderedQueue::<TransactionBatch>::new("transactions"));
        let store = Arc::new(MemoryStore::new());
        let clients: Vec<Arc<dyn TransactionParser>> = vec![Arc::new(Mixed)];
        let pool = EnrichmentPool::new(
            Arc::new(CredentialPool::new(clients).unwrap()),
            queue,
            store.clone(),
            EnrichmentSettings::default(),
        );

        let report = pool.process_batch(TransactionBatch::new(1, sigs(3))).await;
        assert_eq!(
            report.sub_batches[0].outcome,
            SubBatchOutcome::Completed { persisted: 1, skipped: 2 }
        );
        assert!(store.hash_fields("JUPITER_SWAP").is_empty());
        assert!(store.hash_fields("MAGIC_EDEN").is_empty());
        assert_eq!(store.field("SYSTEM_PROGRAM_BURN", "burn").as_deref(), Some("BURN"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_drops_only_its_sub_batch() {
        let parsers = [MockParser::new(Behaviour::Fail), MockParser::new(Behaviour::Echo)];
        let (pool, _queue, store) = enrichment(&parsers, EnrichmentSettings::default());

        let report = pool.process_batch(TransactionBatch::new(4, sigs(60))).await;
        assert!(matches!(report.sub_batches[0].outcome, SubBatchOutcome::Dropped { .. }));
        assert_eq!(
            report.sub_batches[1].outcome,
            SubBatchOutcome::Completed { persisted: 10, skipped: 0 }
        );
        assert_eq!(store.hash_fields("RAYDIUM_SWAP").len(), 10);
        assert!(store.list("dead").is_empty(), "dead letters are opt-in");

        let stats = pool.stats();
        assert_eq!(stats.snapshot(), (1, 1, 1, 10, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sub_batch_goes_to_dead_letter_list() {
        let settings = EnrichmentSettings {
            dead_letter_key: Some("dead".into()),
            ..Default::default()
        };
        let parsers = [MockParser::new(Behaviour::Fail)];
        let (pool, _queue, store) = enrichment(&parsers, settings);

        pool.process_batch(TransactionBatch::new(11, sigs(3))).await;
        let letters = store.list("dead");
        assert_eq!(letters.len(), 1);
        let letter: DeadLetter = serde_json::from_str(&letters[0]).unwrap();
        assert_eq!(letter.slot, 11);
        assert_eq!(letter.signatures, sigs(3));
        assert!(letter.error.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out() {
        let parsers = [MockParser::new(Behaviour::Hang)];
        let (pool, _queue, _store) = enrichment(&parsers, EnrichmentSettings::default());

        let started = tokio::time::Instant::now();
        let report = pool.process_batch(TransactionBatch::new(1, sigs(1))).await;
        assert!(matches!(
            report.sub_batches[0].outcome,
            SubBatchOutcome::Dropped { ref reason } if reason.contains("timed out")
        ));
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn one_in_flight_call_per_credential() {
        let parsers = [MockParser::new(Behaviour::Echo)];
        let (pool, _queue, _store) = enrichment(
            &parsers,
            EnrichmentSettings {
                dispatch_delay: Duration::ZERO,
                ..Default::default()
            },
        );
        // Both sub-batches land on credential 0 and run one after the other.
        let report = pool.process_batch(TransactionBatch::new(1, sigs(100))).await;
        assert_eq!(report.sub_batches.len(), 2);
        assert!(report.sub_batches.iter().all(|s| s.client_index == 0));
        assert_eq!(parsers[0].calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_applies_to_result_hashes() {
        let settings = EnrichmentSettings {
            result_ttl: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let parsers = [MockParser::new(Behaviour::Echo)];
        let (pool, _queue, store) = enrichment(&parsers, settings);

        pool.process_batch(TransactionBatch::new(1, sigs(1))).await;
        assert!(store.field("RAYDIUM_SWAP", "sig000").is_some());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.field("RAYDIUM_SWAP", "sig000").is_none());
    }

    #[test]
    fn sub_batch_size_capped_by_client_limit() {
        struct Small;

        #[async_trait]
        impl TransactionParser for Small {
            fn max_batch(&self) -> usize {
                20
            }
            async fn parse_transactions(
                &self,
                _signatures: &[String],
            ) -> Result<Vec<ParsedTransaction>, EnrichError> {
                Ok(Vec::new())
            }
        }

        let clients: Vec<Arc<dyn TransactionParser>> = vec![Arc::new(Small)];
        let pool = EnrichmentPool::new(
            Arc::new(CredentialPool::new(clients).unwrap()),
            Arc::new(OrderedQueue::<TransactionBatch>::new("tx")),
            Arc::new(MemoryStore::new()),
            EnrichmentSettings::default(),
        );
        assert_eq!(pool.settings().sub_batch_size, 20);
    }
}
