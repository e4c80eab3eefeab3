//! Listing repository implementation for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use marketsync_core::error::{StorageError, StorageResult};
use marketsync_core::models::{Listing, ListingId, ListingMetadata, ListingStatus, TxHash};
use marketsync_core::ports::{ListingRearm, ListingRepository};

use super::database::Database;
use super::helpers::{
    confirmations_from_db, confirmations_to_db, parse_column, parse_optional_column,
    tx_hash_from_db, write_error,
};

/// PostgreSQL implementation of ListingRepository.
pub struct PgListingRepository {
    pool: PgPool,
}

impl PgListingRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl ListingRepository for PgListingRepository {
    async fn insert_listing(&self, listing: &Listing) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listings (
                id, seller, price, full_price, currency, access_type, status,
                pending_action, tx_hash, confirmations, metadata,
                created_at, submitted_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(listing.id.0)
        .bind(&listing.seller)
        .bind(listing.price)
        .bind(listing.full_price)
        .bind(&listing.currency)
        .bind(listing.access_type.as_str())
        .bind(listing.status.as_str())
        .bind(listing.pending_action.map(|a| a.as_str()))
        .bind(listing.tx_hash.as_ref().map(TxHash::as_str))
        .bind(listing.confirmations.map(confirmations_to_db))
        .bind(Json(&listing.metadata))
        .bind(listing.created_at)
        .bind(listing.submitted_at)
        .bind(listing.updated_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn get_listing(&self, id: ListingId) -> StorageResult<Option<Listing>> {
        let row = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT id, seller, price, full_price, currency, access_type, status,
                   pending_action, tx_hash, confirmations, metadata,
                   created_at, submitted_at, updated_at
            FROM listings
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(ListingRow::into_listing).transpose()
    }

    async fn find_pending_by_tx_hash(&self, tx_hash: &TxHash) -> StorageResult<Option<Listing>> {
        let row = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT id, seller, price, full_price, currency, access_type, status,
                   pending_action, tx_hash, confirmations, metadata,
                   created_at, submitted_at, updated_at
            FROM listings
            WHERE tx_hash = $1 AND status = 'pending'
            LIMIT 1
            "#,
        )
        .bind(tx_hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(ListingRow::into_listing).transpose()
    }

    async fn list_pending(&self, limit: u32) -> StorageResult<Vec<Listing>> {
        let rows = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT id, seller, price, full_price, currency, access_type, status,
                   pending_action, tx_hash, confirmations, metadata,
                   created_at, submitted_at, updated_at
            FROM listings
            WHERE status = 'pending'
            ORDER BY submitted_at ASC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        rows.into_iter().map(ListingRow::into_listing).collect()
    }

    async fn compare_and_set_status(
        &self,
        id: ListingId,
        expected: ListingStatus,
        next: ListingStatus,
        tx_hash: Option<&TxHash>,
        confirmations: Option<u32>,
    ) -> StorageResult<bool> {
        // Leaving pending clears the outstanding action.
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = $3,
                confirmations = COALESCE($4, confirmations),
                pending_action = CASE WHEN $3 = 'pending' THEN pending_action ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2 AND tx_hash IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(id.0)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(confirmations.map(confirmations_to_db))
        .bind(tx_hash.map(TxHash::as_str))
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_confirmations(
        &self,
        id: ListingId,
        tx_hash: Option<&TxHash>,
        confirmations: u32,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listings
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

    async fn rearm(
        &self,
        id: ListingId,
        expected: ListingStatus,
        rearm: &ListingRearm,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = 'pending',
                pending_action = $3,
                tx_hash = $4,
                confirmations = NULL,
                price = $5,
                full_price = $6,
                metadata = $7,
                submitted_at = $8,
                updated_at = $8
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.0)
        .bind(expected.as_str())
        .bind(rearm.action.as_str())
        .bind(rearm.tx_hash.as_str())
        .bind(rearm.price)
        .bind(rearm.full_price)
        .bind(Json(&rearm.metadata))
        .bind(rearm.submitted_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(result.rows_affected() == 1)
    }
}

/// Database row representation for Listing.
#[derive(sqlx::FromRow)]
struct ListingRow {
    id: Uuid,
    seller: String,
    price: Decimal,
    full_price: Option<Decimal>,
    currency: String,
    access_type: String,
    status: String,
    pending_action: Option<String>,
    tx_hash: Option<String>,
    confirmations: Option<i32>,
    metadata: Json<ListingMetadata>,
    created_at: DateTime<Utc>,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ListingRow {
    fn into_listing(self) -> StorageResult<Listing> {
        Ok(Listing {
            id: ListingId(self.id),
            seller: self.seller,
            price: self.price,
            full_price: self.full_price,
            currency: self.currency,
            access_type: parse_column(&self.access_type, "listing.access_type")?,
            status: parse_column(&self.status, "listing.status")?,
            pending_action: parse_optional_column(
                self.pending_action.as_deref(),
                "listing.pending_action",
            )?,
            tx_hash: tx_hash_from_db(self.tx_hash, "listing.tx_hash")?,
            confirmations: confirmations_from_db(self.confirmations, "listing.confirmations")?,
            metadata: self.metadata.0,
            created_at: self.created_at,
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketsync_core::models::{AccessType, AssetKind, ListingAction};

    fn row() -> ListingRow {
        let now = Utc::now();
        ListingRow {
            id: Uuid::new_v4(),
            seller: "addr_seller".into(),
            price: Decimal::new(100, 0),
            full_price: None,
            currency: "USD".into(),
            access_type: "subscription".into(),
            status: "pending".into(),
            pending_action: Some("cancel".into()),
            tx_hash: Some("ABC123".into()),
            confirmations: Some(4),
            metadata: Json(ListingMetadata::new(AssetKind::Model)),
            created_at: now,
            submitted_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_converts_to_listing() {
        let listing = row().into_listing().unwrap();
        assert_eq!(listing.access_type, AccessType::Subscription);
        assert_eq!(listing.status, ListingStatus::Pending);
        assert_eq!(listing.pending_action, Some(ListingAction::Cancel));
        assert_eq!(listing.tx_hash.unwrap().as_str(), "abc123");
        assert_eq!(listing.confirmations, Some(4));
    }

    // Test critique: un statut inconnu en base est une erreur, pas un défaut
    #[test]
    fn test_unknown_status_is_rejected() {
        let mut bad = row();
        bad.status = "archived".into();
        let err = bad.into_listing().unwrap_err().to_string();
        assert!(err.contains("listing.status"));
    }
}
