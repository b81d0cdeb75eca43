//! Block filtering: drop validator votes and failed transactions, keep the
//! signatures of everything else in block order.

use chainpipe_core::types::Block;

/// What survived filtering, plus what was dropped for the logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDigest {
    pub signatures: Vec<String>,
    pub votes: usize,
    pub failed: usize,
}

impl BlockDigest {
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

pub fn filter_block(block: &Block) -> BlockDigest {
    let mut digest = BlockDigest::default();
    for tx in &block.transactions {
        if tx.is_vote() {
            digest.votes += 1;
            continue;
        }
        if tx.is_failed() {
            digest.failed += 1;
            continue;
        }
        digest.signatures.extend(tx.signatures().iter().cloned());
    }
    digest
}
