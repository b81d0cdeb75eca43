//! Worker counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BlockStats {
    pub fetched: AtomicU64,
    /// Attempts that got an empty (null) block.
    pub empty_responses: AtomicU64,
    /// Slots dropped after the last attempt failed.
    pub abandoned: AtomicU64,
    pub batches_enqueued: AtomicU64,
    pub signatures_enqueued: AtomicU64,
}

#[derive(Debug, Default)]
pub struct EnrichStats {
    pub batches: AtomicU64,
    pub sub_batches_ok: AtomicU64,
    pub sub_batches_dropped: AtomicU64,
    pub transactions_persisted: AtomicU64,
    pub transactions_skipped: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

pub(crate) fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl BlockStats {
    /// `(fetched, empty_responses, abandoned, batches_enqueued, signatures_enqueued)`
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            read(&self.fetched),
            read(&self.empty_responses),
            read(&self.abandoned),
            read(&self.batches_enqueued),
            read(&self.signatures_enqueued),
        )
    }
}

impl EnrichStats {
    /// `(batches, sub_batches_ok, sub_batches_dropped, persisted, skipped)`
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            read(&self.batches),
            read(&self.sub_batches_ok),
            read(&self.sub_batches_dropped),
            read(&self.transactions_persisted),
            read(&self.transactions_skipped),
        )
    }
}
