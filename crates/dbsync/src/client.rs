//! Cardano db-sync queries.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, instrument, trace, warn};

use marketsync_core::error::{ChainError, ChainResult};
use marketsync_core::models::TxHash;
use marketsync_core::ports::{ChainIndexer, ObservedTx, OracleRate, TxStatus};

use crate::oracle::parse_oracle_rates;

/// Configuration for the db-sync adapter.
#[derive(Debug, Clone, Default)]
pub struct DbSyncConfig {
    /// Address holding the oracle UTXO.
    pub oracle_address: String,
    /// Load metadata and inline datum with every status lookup.
    ///
    /// Off by default: confirmation polling only needs depth.
    pub include_payload: bool,
}

/// db-sync adapter implementing the ChainIndexer port.
///
/// Expects a read-only pool on a db-sync database with the address stored
/// in `tx_out.address`. Domain-typed columns (`hash32type`, `word31type`,
/// `word64type`) are cast to their base types in every query.
pub struct DbSyncIndexer {
    pool: PgPool,
    config: DbSyncConfig,
}

impl DbSyncIndexer {
    pub fn new(pool: PgPool, config: DbSyncConfig) -> Self {
        Self { pool, config }
    }

    /// Height of the most recent indexed block.
    #[instrument(skip(self))]
    pub async fn tip(&self) -> ChainResult<u64> {
        let tip: (Option<i32>,) = sqlx::query_as("SELECT MAX(block_no)::integer FROM block")
            .fetch_one(&self.pool)
            .await
            .map_err(chain_error)?;

        Ok(tip.0.map(block_height).unwrap_or(0))
    }

    async fn tx_metadata(&self, tx_id: i64) -> ChainResult<Option<serde_json::Value>> {
        let rows: Vec<(Decimal, Option<serde_json::Value>)> =
            sqlx::query_as("SELECT key::numeric, json FROM tx_metadata WHERE tx_id = $1 ORDER BY key")
                .bind(tx_id)
                .fetch_all(&self.pool)
                .await
                .map_err(chain_error)?;

        if rows.is_empty() {
            return Ok(None);
        }
        let labels = rows
            .into_iter()
            .map(|(key, json)| (key.to_string(), json.unwrap_or(serde_json::Value::Null)))
            .collect();
        Ok(Some(serde_json::Value::Object(labels)))
    }

    async fn inline_datum(&self, tx_id: i64) -> ChainResult<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT datum.value
            FROM tx_out
            JOIN datum ON datum.id = tx_out.inline_datum_id
            WHERE tx_out.tx_id = $1
            ORDER BY tx_out.index
            LIMIT 1
            "#,
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(chain_error)?;

        Ok(row.map(|(value,)| value))
    }
}

#[async_trait]
impl ChainIndexer for DbSyncIndexer {
    #[instrument(skip(self))]
    async fn transactions_at(&self, address: &str, limit: u32) -> ChainResult<Vec<ObservedTx>> {
        let rows: Vec<(Vec<u8>, Option<i32>, NaiveDateTime)> = sqlx::query_as(
            r#"
            SELECT hash, block_no, time
            FROM (
                SELECT DISTINCT ON (tx.id)
                    tx.id, tx.hash::bytea AS hash, block.block_no::integer AS block_no, block.time
                FROM tx_out
                JOIN tx ON tx.id = tx_out.tx_id
                JOIN block ON block.id = tx.block_id
                WHERE tx_out.address = $1
                ORDER BY tx.id DESC
            ) recent
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(address)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(chain_error)?;

        let observed = rows
            .into_iter()
            .map(|(hash, block_no, time)| {
                Ok(ObservedTx {
                    tx_hash: TxHash::new(hex::encode(hash))
                        .map_err(|e| ChainError::DecodingError(e.to_string()))?,
                    block_no: block_no.map(block_height).unwrap_or(0),
                    block_time: Some(time.and_utc()),
                })
            })
            .collect::<ChainResult<Vec<_>>>()?;

        trace!(count = observed.len(), "Scanned address transactions");
        Ok(observed)
    }

    #[instrument(skip(self, tx_hash), fields(tx_hash = %tx_hash))]
    async fn status(&self, tx_hash: &TxHash) -> ChainResult<TxStatus> {
        let Ok(hash_bytes) = tx_hash.to_bytes() else {
            // Such a hash can never be indexed.
            warn!("Transaction hash is not hex, reporting not found");
            return Ok(TxStatus::not_found());
        };

        let row: Option<(i64, Option<i32>, Option<i32>)> = sqlx::query_as(
            r#"
            SELECT tx.id,
                   block.block_no::integer,
                   (SELECT MAX(block_no) FROM block)::integer AS tip
            FROM tx
            JOIN block ON block.id = tx.block_id
            WHERE tx.hash = $1
            "#,
        )
        .bind(hash_bytes)
        .fetch_optional(&self.pool)
        .await
        .map_err(chain_error)?;

        let Some((tx_id, block_no, tip)) = row else {
            return Ok(TxStatus::not_found());
        };

        let confirmations = confirmation_depth(
            block_no.map(block_height).unwrap_or(0),
            tip.map(block_height).unwrap_or(0),
        );

        let mut status = TxStatus::seen(confirmations);
        if self.config.include_payload {
            status.metadata = self.tx_metadata(tx_id).await?;
            status.datum = self.inline_datum(tx_id).await?;
        }
        Ok(status)
    }

    #[instrument(skip(self))]
    async fn oracle_rate(&self, currency: &str) -> ChainResult<Option<OracleRate>> {
        let row: Option<(serde_json::Value, NaiveDateTime)> = sqlx::query_as(
            r#"
            SELECT datum.value, block.time
            FROM tx_out
            JOIN tx ON tx.id = tx_out.tx_id
            JOIN block ON block.id = tx.block_id
            JOIN datum ON datum.id = tx_out.inline_datum_id
            WHERE tx_out.address = $1
              AND NOT EXISTS (
                  SELECT 1 FROM tx_in
                  WHERE tx_in.tx_out_id = tx_out.tx_id
                    AND tx_in.tx_out_index = tx_out.index
              )
            ORDER BY tx.id DESC
            LIMIT 1
            "#,
        )
        .bind(&self.config.oracle_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(chain_error)?;

        let Some((datum, time)) = row else {
            debug!("No unspent oracle output");
            return Ok(None);
        };

        let rate = parse_oracle_rates(&datum)?
            .remove(currency)
            .map(|rate| OracleRate {
                currency: currency.to_string(),
                rate,
                as_of: time.and_utc(),
            });
        Ok(rate)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn block_height(block_no: i32) -> u64 {
    u64::try_from(block_no).unwrap_or(0)
}

/// Blocks mined after `block_no`.
fn confirmation_depth(block_no: u64, tip: u64) -> u32 {
    u32::try_from(tip.saturating_sub(block_no)).unwrap_or(u32::MAX)
}

/// Classify a db-sync query failure.
fn chain_error(e: sqlx::Error) -> ChainError {
    match e {
        sqlx::Error::PoolTimedOut => ChainError::Timeout(e.to_string()),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
            ChainError::ConnectionFailed(e.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            ChainError::DecodingError(e.to_string())
        }
        other => ChainError::QueryError(other.to_string()),
    }
}
