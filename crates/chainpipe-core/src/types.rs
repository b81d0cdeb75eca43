//! Work items and wire payloads that flow between pipeline stages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Program id whose presence in a transaction's log output marks it as a
/// validator vote.
pub const VOTE_PROGRAM_ID: &str = "Vote111111111111111111111111111111111111111";

/// Queue rank for a slot. Slots beyond `i64::MAX` saturate.
pub fn slot_rank(slot: u64) -> i64 {
    i64::try_from(slot).unwrap_or(i64::MAX)
}

// ─── Queue items ─────────────────────────────────────────────────────────────

/// A block waiting to be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTask {
    pub slot: u64,
    /// Notification that produced the task; never interpreted downstream.
    #[serde(default)]
    pub payload: Value,
}

impl BlockTask {
    pub fn new(slot: u64) -> Self {
        Self { slot, payload: Value::Null }
    }

    pub fn with_payload(slot: u64, payload: Value) -> Self {
        Self { slot, payload }
    }

    pub fn rank(&self) -> i64 {
        slot_rank(self.slot)
    }
}

/// Signatures of one block's qualifying transactions, in block order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub slot: u64,
    pub signatures: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TransactionBatch {
    pub fn new(slot: u64, signatures: Vec<String>) -> Self {
        Self {
            slot,
            signatures,
            created_at: Utc::now(),
        }
    }

    pub fn rank(&self) -> i64 {
        slot_rank(self.slot)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

// ─── Block payload ───────────────────────────────────────────────────────────

/// A block as returned by `getBlock` with full transaction details.
///
/// Only the fields the fanout stage reads are typed; the rest is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub blockhash: String,
    #[serde(default)]
    pub parent_slot: u64,
    #[serde(default)]
    pub previous_blockhash: String,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockTransaction {
    #[serde(default)]
    pub meta: Option<TransactionMeta>,
    pub transaction: TransactionEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub log_messages: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub message: Value,
}

impl BlockTransaction {
    /// `true` when any log line mentions the vote program.
    pub fn is_vote(&self) -> bool {
        self.meta
            .as_ref()
            .and_then(|m| m.log_messages.as_ref())
            .is_some_and(|logs| logs.iter().any(|l| l.contains(VOTE_PROGRAM_ID)))
    }

    /// `true` when the execution status carries a non-empty instruction error.
    pub fn is_failed(&self) -> bool {
        let Some(meta) = &self.meta else {
            return false;
        };
        let from_status = meta
            .status
            .as_ref()
            .and_then(|s| s.get("Err"))
            .and_then(|e| e.get("InstructionError"));
        let from_err = meta.err.as_ref().and_then(|e| e.get("InstructionError"));
        from_status.or(from_err).is_some_and(non_empty)
    }

    pub fn signatures(&self) -> &[String] {
        &self.transaction.signatures
    }
}

fn non_empty(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

// ─── Parsed transactions ─────────────────────────────────────────────────────

/// Classification label assigned by the enrichment API.
///
/// Labels the pipeline does not name are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransactionType {
    #[default]
    Unknown,
    Unlabeled,
    Transfer,
    Burn,
    InitializeAccount,
    TokenMint,
    Swap,
    Other(String),
}

impl TransactionType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Unlabeled => "UNLABELED",
            Self::Transfer => "TRANSFER",
            Self::Burn => "BURN",
            Self::InitializeAccount => "INITIALIZE_ACCOUNT",
            Self::TokenMint => "TOKEN_MINT",
            Self::Swap => "SWAP",
            Self::Other(s) => s,
        }
    }

    /// Labels persisted when no explicit list is configured.
    pub fn default_interest() -> Vec<TransactionType> {
        vec![
            Self::Transfer,
            Self::Burn,
            Self::TokenMint,
            Self::Swap,
            Self::InitializeAccount,
            Self::Unlabeled,
        ]
    }
}

impl From<String> for TransactionType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "UNKNOWN" => Self::Unknown,
            "UNLABELED" => Self::Unlabeled,
            "TRANSFER" => Self::Transfer,
            "BURN" => Self::Burn,
            "INITIALIZE_ACCOUNT" => Self::InitializeAccount,
            "TOKEN_MINT" => Self::TokenMint,
            "SWAP" => Self::Swap,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for TransactionType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<TransactionType> for String {
    fn from(t: TransactionType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction as classified by the enrichment API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub kind: TransactionType,
    /// Program or venue that produced the transaction (e.g. `RAYDIUM`).
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fee: i64,
    #[serde(default)]
    pub fee_payer: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub slot: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub native_transfers: Vec<NativeTransfer>,
    #[serde(default)]
    pub token_transfers: Vec<TokenTransfer>,
    #[serde(default)]
    pub account_data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_error: Option<TransactionError>,
    #[serde(default)]
    pub instructions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<TransactionEvents>,
}

impl ParsedTransaction {
    /// `true` when the API reports a non-empty instruction error.
    pub fn has_instruction_error(&self) -> bool {
        self.transaction_error
            .as_ref()
            .and_then(|e| e.instruction_error.as_ref())
            .is_some_and(non_empty)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransfer {
    #[serde(default)]
    pub from_user_account: String,
    #[serde(default)]
    pub to_user_account: String,
    #[serde(default)]
    pub amount: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    #[serde(default)]
    pub from_user_account: String,
    #[serde(default)]
    pub to_user_account: String,
    #[serde(default)]
    pub from_token_account: String,
    #[serde(default)]
    pub to_token_account: String,
    /// Decimal-adjusted amount; kept as JSON to avoid float rounding.
    #[serde(default)]
    pub token_amount: Value,
    #[serde(default)]
    pub mint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionError {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub instruction_error: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionEvents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<Value>,
}
