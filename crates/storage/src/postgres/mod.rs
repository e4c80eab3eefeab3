//! PostgreSQL storage adapter.
//!
//! This module implements the ledger traits defined in `marketsync-core`
//! using PostgreSQL as the backing store.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool and migrations
//! - [`PgLedgerStore`] - Composite store implementing the `LedgerStore` trait
//! - Individual repos: `PgListingRepository`, `PgPurchaseRepository`, `PgFeeRepository`
//!
//! # Usage
//!
//! ```ignore
//! let config = DatabaseConfig::for_ledger(&database_url);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let store = PgLedgerStore::new(Arc::new(db));
//! ```

mod database;
mod fee_repo;
mod helpers;
mod listing_repo;
mod purchase_repo;

pub use database::{Database, DatabaseConfig};
pub use fee_repo::PgFeeRepository;
pub use listing_repo::PgListingRepository;
pub use purchase_repo::PgPurchaseRepository;

use std::sync::Arc;

use async_trait::async_trait;

use marketsync_core::error::{StorageError, StorageResult};
use marketsync_core::models::TxHash;
use marketsync_core::ports::{
    CompletionOutcome, FeeRepository, LedgerStore, ListingRepository, PurchaseCompletion,
    PurchaseRepository,
};

use helpers::{confirmations_to_db, write_error};

// =============================================================================
// Composite Store
// =============================================================================

/// Aggregated PostgreSQL repositories implementing the `LedgerStore` trait.
///
/// This provides a single entry point for all ledger operations and
/// implements the purchase completion that spans two tables.
pub struct PgLedgerStore {
    db: Arc<Database>,
    listings: PgListingRepository,
    purchases: PgPurchaseRepository,
    fees: PgFeeRepository,
}

impl PgLedgerStore {
    /// Create a new store from a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            listings: PgListingRepository::new(&db),
            purchases: PgPurchaseRepository::new(&db),
            fees: PgFeeRepository::new(&db),
            db,
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn listings(&self) -> &dyn ListingRepository {
        &self.listings
    }

    fn purchases(&self) -> &dyn PurchaseRepository {
        &self.purchases
    }

    fn fees(&self) -> &dyn FeeRepository {
        &self.fees
    }

    async fn complete_purchase_atomic(
        &self,
        completion: &PurchaseCompletion,
    ) -> StorageResult<CompletionOutcome> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        // Compare-and-set on the purchase status
        let transitioned = sqlx::query(
            r#"
            UPDATE purchases
            SET status = 'completed',
                confirmations = $2,
                completed_at = $3,
                subscription_expiry = $4,
                updated_at = $3
            WHERE id = $1 AND status = 'pending' AND tx_hash IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(completion.purchase_id.0)
        .bind(confirmations_to_db(completion.confirmations))
        .bind(completion.completed_at)
        .bind(completion.subscription_expiry)
        .bind(completion.tx_hash.as_ref().map(TxHash::as_str))
        .execute(&mut *tx)
        .await
        .map_err(write_error)?
        .rows_affected()
            == 1;

        if !transitioned {
            // Another writer settled it or it moved to another tx; nothing to commit.
            tx.rollback()
                .await
                .map_err(|e| StorageError::TransactionError(e.to_string()))?;
            return Ok(CompletionOutcome::default());
        }

        let mut fee_recorded = false;
        if let Some(fee) = &completion.fee {
            fee_recorded = sqlx::query(
                r#"
                INSERT INTO fees (purchase_id, fee_amount, recorded_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (purchase_id) DO NOTHING
                "#,
            )
            .bind(fee.purchase_id.0)
            .bind(fee.fee_amount)
            .bind(fee.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?
            .rows_affected()
                == 1;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        Ok(CompletionOutcome {
            transitioned,
            fee_recorded,
        })
    }
}
