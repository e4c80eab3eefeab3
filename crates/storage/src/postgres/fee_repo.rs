//! Fee repository implementation for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use marketsync_core::error::{StorageError, StorageResult};
use marketsync_core::models::{Fee, PurchaseId};
use marketsync_core::ports::FeeRepository;

use super::database::Database;
use super::helpers::write_error;

/// PostgreSQL implementation of FeeRepository.
pub struct PgFeeRepository {
    pool: PgPool,
}

impl PgFeeRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl FeeRepository for PgFeeRepository {
    async fn fee_exists_for(&self, purchase_id: PurchaseId) -> StorageResult<bool> {
        let exists: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM fees WHERE purchase_id = $1)")
                .bind(purchase_id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(e.to_string()))?;

        Ok(exists.0)
    }

    async fn insert_fee(&self, fee: &Fee) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fees (purchase_id, fee_amount, recorded_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (purchase_id) DO NOTHING
            "#,
        )
        .bind(fee.purchase_id.0)
        .bind(fee.fee_amount)
        .bind(fee.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_fee(&self, purchase_id: PurchaseId) -> StorageResult<Option<Fee>> {
        let row: Option<(Uuid, Decimal, DateTime<Utc>)> = sqlx::query_as(
            "SELECT purchase_id, fee_amount, recorded_at FROM fees WHERE purchase_id = $1",
        )
        .bind(purchase_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        Ok(row.map(|(purchase_id, fee_amount, recorded_at)| Fee {
            purchase_id: PurchaseId(purchase_id),
            fee_amount,
            recorded_at,
        }))
    }
}
