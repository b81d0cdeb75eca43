//! Block fetch-and-fanout stage.
//!
//! Each cycle pops up to `batch_size` lowest slots, fetches them concurrently
//! (dispatch staggered by `dispatch_delay`), filters out votes and failed
//! transactions, and enqueues one [`TransactionBatch`] per block that still
//! has signatures. A slot whose fetch keeps failing is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;

use chainpipe_core::error::FetchError;
use chainpipe_core::policy::RetryPolicy;
use chainpipe_core::queue::TaskQueue;
use chainpipe_core::source::{BlockRequestOptions, BlockSource};
use chainpipe_core::types::{Block, BlockTask, TransactionBatch};

use crate::config::BlockWorkerConfig;
use crate::filter::filter_block;
use crate::stats::{bump, BlockStats};

#[derive(Debug, Clone)]
pub struct BlockWorkerSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub dispatch_delay: Duration,
    pub retry: RetryPolicy,
    /// Bound on a single fetch attempt.
    pub fetch_timeout: Duration,
    pub options: BlockRequestOptions,
}

impl Default for BlockWorkerSettings {
    fn default() -> Self {
        Self::from_config(&BlockWorkerConfig::default(), BlockRequestOptions::default())
    }
}

impl BlockWorkerSettings {
    pub fn from_config(config: &BlockWorkerConfig, options: BlockRequestOptions) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size.max(1),
            dispatch_delay: Duration::from_millis(config.dispatch_delay_ms),
            retry: RetryPolicy::fixed(
                config.max_attempts.max(1),
                Duration::from_millis(config.retry_delay_ms),
            ),
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            options,
        }
    }
}

/// What happened to one popped slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// A batch with this many signatures was enqueued.
    Enqueued(usize),
    /// The block had no qualifying transactions.
    NothingToEnqueue,
    /// Every attempt failed, or the payload was undecodable.
    Abandoned,
}

pub struct BlockFetcher {
    source: Arc<dyn BlockSource>,
    blocks: Arc<dyn TaskQueue<BlockTask>>,
    transactions: Arc<dyn TaskQueue<TransactionBatch>>,
    settings: BlockWorkerSettings,
    stats: Arc<BlockStats>,
}

impl BlockFetcher {
    pub fn new(
        source: Arc<dyn BlockSource>,
        blocks: Arc<dyn TaskQueue<BlockTask>>,
        transactions: Arc<dyn TaskQueue<TransactionBatch>>,
        settings: BlockWorkerSettings,
    ) -> Self {
        Self {
            source,
            blocks,
            transactions,
            settings,
            stats: Arc::new(BlockStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BlockStats> {
        Arc::clone(&self.stats)
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.settings.batch_size,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "block worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("block worker stopped");
    }

    /// One poll: pop, fetch, fan out. Returns the outcome per popped slot.
    pub async fn run_cycle(&self) -> Vec<(u64, SlotOutcome)> {
        let slots = self.pop_slots().await;
        if slots.is_empty() {
            tracing::debug!(queue = self.blocks.name(), "no blocks to process");
            return Vec::new();
        }

        let delay = self.settings.dispatch_delay;
        let work = slots.iter().enumerate().map(|(i, &slot)| async move {
            tokio::time::sleep(delay * (i as u32 + 1)).await;
            (slot, self.process_slot(slot).await)
        });
        join_all(work).await
    }

    async fn pop_slots(&self) -> Vec<u64> {
        let mut slots = Vec::with_capacity(self.settings.batch_size);
        while slots.len() < self.settings.batch_size {
            match self.blocks.pop_min().await {
                Ok(Some((task, _rank))) => slots.push(task.slot),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(queue = self.blocks.name(), error = %e, "block queue pop failed");
                    break;
                }
            }
        }
        slots
    }

    /// Fetch, filter and fan out one slot.
    pub async fn process_slot(&self, slot: u64) -> SlotOutcome {
        tracing::info!(slot, "processing block");
        let Some(block) = self.fetch_with_retry(slot).await else {
            bump(&self.stats.abandoned, 1);
            return SlotOutcome::Abandoned;
        };
        bump(&self.stats.fetched, 1);

        let digest = filter_block(&block);
        if digest.is_empty() {
            tracing::info!(slot, votes = digest.votes, failed = digest.failed, "no qualifying transactions");
            return SlotOutcome::NothingToEnqueue;
        }

        let count = digest.signatures.len();
        let batch = TransactionBatch::new(slot, digest.signatures);
        let rank = batch.rank();
        if let Err(e) = self.transactions.push(batch, rank).await {
            tracing::error!(slot, error = %e, "failed to enqueue transaction batch");
            bump(&self.stats.abandoned, 1);
            return SlotOutcome::Abandoned;
        }

        bump(&self.stats.batches_enqueued, 1);
        bump(&self.stats.signatures_enqueued, count as u64);
        tracing::info!(
            slot,
            signatures = count,
            votes = digest.votes,
            failed = digest.failed,
            "transaction batch enqueued"
        );
        SlotOutcome::Enqueued(count)
    }

    async fn fetch_with_retry(&self, slot: u64) -> Option<Block> {
        let retry = &self.settings.retry;
        let mut failures = 0u32;
        loop {
            let attempt = tokio::time::timeout(
                self.settings.fetch_timeout,
                self.source.fetch_block(slot, &self.settings.options),
            )
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Timeout {
                    ms: self.settings.fetch_timeout.as_millis() as u64,
                })
            });

            match attempt {
                Ok(Some(block)) => return Some(block),
                Ok(None) => {
                    bump(&self.stats.empty_responses, 1);
                    tracing::debug!(slot, attempt = failures + 1, "empty block response");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(slot, attempt = failures + 1, error = %e, "block fetch failed");
                }
                Err(e) => {
                    tracing::error!(slot, error = %e, "block payload rejected, dropping slot");
                    return None;
                }
            }

            failures += 1;
            match retry.next_delay(failures) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    tracing::error!(slot, attempts = failures, "block abandoned");
                    return None;
                }
            }
        }
    }
}
