//! Port trait for the read-only chain indexer.
//!
//! The indexer is a relational mirror of the chain. Implementations live in
//! the infrastructure layer (e.g., `marketsync-dbsync`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::ChainResult;
use crate::models::TxHash;

/// A transaction the indexer saw touching an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTx {
    pub tx_hash: TxHash,
    /// Height of the including block.
    pub block_no: u64,
    pub block_time: Option<DateTime<Utc>>,
}

/// Indexer view of a single transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxStatus {
    /// Whether the transaction is currently in an indexed block.
    pub found: bool,
    /// Blocks mined after the including block. Zero when not found.
    pub confirmations: u32,
    /// Transaction metadata, keyed by label.
    pub metadata: Option<serde_json::Value>,
    /// Inline datum of the first output carrying one.
    pub datum: Option<serde_json::Value>,
}

impl TxStatus {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn seen(confirmations: u32) -> Self {
        Self {
            found: true,
            confirmations,
            ..Default::default()
        }
    }
}

/// Exchange rate published by the on-chain oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRate {
    pub currency: String,
    /// Native units per currency unit, before the scaling factor is applied.
    pub rate: Decimal,
    pub as_of: DateTime<Utc>,
}

/// Port trait for chain indexer queries.
#[async_trait]
pub trait ChainIndexer: Send + Sync {
    /// Most recent transactions with an output at `address`, newest first.
    async fn transactions_at(&self, address: &str, limit: u32) -> ChainResult<Vec<ObservedTx>>;

    /// Confirmation depth and payloads of a transaction.
    async fn status(&self, tx_hash: &TxHash) -> ChainResult<TxStatus>;

    /// Current oracle rate for `currency`, `None` when the oracle has no entry.
    async fn oracle_rate(&self, currency: &str) -> ChainResult<Option<OracleRate>>;
}
