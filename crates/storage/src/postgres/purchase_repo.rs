//! Purchase repository implementation for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use marketsync_core::error::{StorageError, StorageResult};
use marketsync_core::models::{ListingId, Purchase, PurchaseId, PurchaseStatus, TxHash};
use marketsync_core::ports::PurchaseRepository;

use super::database::Database;
use super::helpers::{
    confirmations_from_db, confirmations_to_db, parse_column, tx_hash_from_db, write_error,
};

/// PostgreSQL implementation of PurchaseRepository.
pub struct PgPurchaseRepository {
    pool: PgPool,
}

impl PgPurchaseRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl PurchaseRepository for PgPurchaseRepository {
    async fn insert_purchase(&self, purchase: &Purchase) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO purchases (
                id, buyer, listing_id, amount, currency, status, tx_hash,
                confirmations, subscription_expiry, created_at, submitted_at,
                completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(purchase.id.0)
        .bind(&purchase.buyer)
        .bind(purchase.listing_id.0)
        .bind(purchase.amount)
        .bind(&purchase.currency)
        .bind(purchase.status.as_str())
        .bind(purchase.tx_hash.as_ref().map(TxHash::as_str))
        .bind(purchase.confirmations.map(confirmations_to_db))
        .bind(purchase.subscription_expiry)
        .bind(purchase.created_at)
        .bind(purchase.submitted_at)
        .bind(purchase.completed_at)
        .bind(purchase.updated_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn get_purchase(&self, id: PurchaseId) -> StorageResult<Option<Purchase>> {
        let row = sqlx::query_as::<_, PurchaseRow>(
            r#"
            SELECT id, buyer, listing_id, amount, currency, status, tx_hash,
                   confirmations, subscription_expiry, created_at, submitted_at,
                   completed_at, updated_at
            FROM purchases
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(PurchaseRow::into_purchase).transpose()
    }

    async fn find_pending_by_tx_hash(
        &self,
        tx_hash: &TxHash,
    ) -> StorageResult<Option<Purchase>> {
        let row = sqlx::query_as::<_, PurchaseRow>(
            r#"
            SELECT id, buyer, listing_id, amount, currency, status, tx_hash,
                   confirmations, subscription_expiry, created_at, submitted_at,
                   completed_at, updated_at
            FROM purchases
            WHERE tx_hash = $1 AND status = 'pending'
            LIMIT 1
            "#,
        )
        .bind(tx_hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(PurchaseRow::into_purchase).transpose()
    }

    async fn list_pending(&self, limit: u32) -> StorageResult<Vec<Purchase>> {
        let rows = sqlx::query_as::<_, PurchaseRow>(
            r#"
            SELECT id, buyer, listing_id, amount, currency, status, tx_hash,
                   confirmations, subscription_expiry, created_at, submitted_at,
                   completed_at, updated_at
            FROM purchases
            WHERE status = 'pending'
            ORDER BY submitted_at ASC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        rows.into_iter().map(PurchaseRow::into_purchase).collect()
    }

    async fn compare_and_set_status(
        &self,
        id: PurchaseId,
        expected: PurchaseStatus,
        next: PurchaseStatus,
        tx_hash: Option<&TxHash>,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE purchases
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2 AND tx_hash IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(id.0)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(tx_hash.map(TxHash::as_str))
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_confirmations(
        &self,
        id: PurchaseId,
        tx_hash: Option<&TxHash>,
        confirmations: u32,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE purchases
            SET confirmations = $2, updated_at = NOW()
            WHERE id = $1
              AND status = 'pending'
              AND tx_hash IS NOT DISTINCT FROM $3
              AND confirmations IS DISTINCT FROM $2
            "#,
        )
        .bind(id.0)
        .bind(confirmations_to_db(confirmations))
        .bind(tx_hash.map(TxHash::as_str))
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(result.rows_affected() == 1)
    }
}

/// Database row representation for Purchase.
#[derive(sqlx::FromRow)]
struct PurchaseRow {
    id: Uuid,
    buyer: String,
    listing_id: Uuid,
    amount: Decimal,
    currency: String,
    status: String,
    tx_hash: Option<String>,
    confirmations: Option<i32>,
    subscription_expiry: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    submitted_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl PurchaseRow {
    fn into_purchase(self) -> StorageResult<Purchase> {
        Ok(Purchase {
            id: PurchaseId(self.id),
            buyer: self.buyer,
            listing_id: ListingId(self.listing_id),
            amount: self.amount,
            currency: self.currency,
            status: parse_column(&self.status, "purchase.status")?,
            tx_hash: tx_hash_from_db(self.tx_hash, "purchase.tx_hash")?,
            confirmations: confirmations_from_db(self.confirmations, "purchase.confirmations")?,
            subscription_expiry: self.subscription_expiry,
            created_at: self.created_at,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}
