//! Port traits for the off-chain ledger.
//!
//! These traits define the storage interface used by the domain layer.
//! Implementations live in the infrastructure layer (e.g., `marketsync-storage`).
//!
//! Every status write is a compare-and-set on the record's current status
//! and the transaction hash the caller observed: it returns `false` instead
//! of failing when another writer got there first, or when the record was
//! re-armed onto a newer transaction since it was read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::StorageResult;
use crate::models::{
    Fee, LedgerRecord, Listing, ListingAction, ListingId, ListingMetadata, ListingStatus,
    Purchase, PurchaseId, PurchaseStatus, RecordId, RecordKind, TxHash,
};

// =============================================================================
// Write Payloads
// =============================================================================

/// Seller-driven re-arm of a listing for an edit or cancel transaction.
#[derive(Debug, Clone)]
pub struct ListingRearm {
    pub action: ListingAction,
    pub tx_hash: TxHash,
    pub price: Decimal,
    pub full_price: Option<Decimal>,
    pub metadata: ListingMetadata,
    pub submitted_at: DateTime<Utc>,
}

/// Data for settling a purchase in one storage transaction.
#[derive(Debug, Clone)]
pub struct PurchaseCompletion {
    pub purchase_id: PurchaseId,
    /// Transaction the completion was decided on.
    pub tx_hash: Option<TxHash>,
    pub confirmations: u32,
    pub completed_at: DateTime<Utc>,
    pub subscription_expiry: Option<DateTime<Utc>>,
    /// Fee to record if the purchase has none yet.
    pub fee: Option<Fee>,
}

/// What a purchase completion actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionOutcome {
    /// The purchase moved `pending -> completed` in this call.
    pub transitioned: bool,
    /// A fee row was inserted in this call.
    pub fee_recorded: bool,
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Repository for listing records.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Insert a new listing.
    async fn insert_listing(&self, listing: &Listing) -> StorageResult<()>;

    /// Get listing by ID.
    async fn get_listing(&self, id: ListingId) -> StorageResult<Option<Listing>>;

    /// Find the pending listing waiting on `tx_hash`.
    async fn find_pending_by_tx_hash(&self, tx_hash: &TxHash) -> StorageResult<Option<Listing>>;

    /// Pending listings, oldest submission first.
    async fn list_pending(&self, limit: u32) -> StorageResult<Vec<Listing>>;

    /// Move `expected -> next` while the listing still points at `tx_hash`,
    /// optionally storing a confirmation count.
    async fn compare_and_set_status(
        &self,
        id: ListingId,
        expected: ListingStatus,
        next: ListingStatus,
        tx_hash: Option<&TxHash>,
        confirmations: Option<u32>,
    ) -> StorageResult<bool>;

    /// Store a new confirmation count on a listing pending on `tx_hash`.
    ///
    /// Returns `false` when the listing is no longer pending on that
    /// transaction or the count is unchanged.
    async fn record_confirmations(
        &self,
        id: ListingId,
        tx_hash: Option<&TxHash>,
        confirmations: u32,
    ) -> StorageResult<bool>;

    /// Point a listing in `expected` status at a new edit/cancel transaction
    /// and put it back to pending.
    async fn rearm(
        &self,
        id: ListingId,
        expected: ListingStatus,
        rearm: &ListingRearm,
    ) -> StorageResult<bool>;
}

/// Repository for purchase records.
#[async_trait]
pub trait PurchaseRepository: Send + Sync {
    /// Insert a new purchase.
    async fn insert_purchase(&self, purchase: &Purchase) -> StorageResult<()>;

    /// Get purchase by ID.
    async fn get_purchase(&self, id: PurchaseId) -> StorageResult<Option<Purchase>>;

    /// Find the pending purchase waiting on `tx_hash`.
    async fn find_pending_by_tx_hash(&self, tx_hash: &TxHash)
    -> StorageResult<Option<Purchase>>;

    /// Pending purchases, oldest submission first.
    async fn list_pending(&self, limit: u32) -> StorageResult<Vec<Purchase>>;

    /// Move `expected -> next` while the purchase still points at `tx_hash`.
    async fn compare_and_set_status(
        &self,
        id: PurchaseId,
        expected: PurchaseStatus,
        next: PurchaseStatus,
        tx_hash: Option<&TxHash>,
    ) -> StorageResult<bool>;

    /// Store a new confirmation count on a purchase pending on `tx_hash`.
    async fn record_confirmations(
        &self,
        id: PurchaseId,
        tx_hash: Option<&TxHash>,
        confirmations: u32,
    ) -> StorageResult<bool>;
}

/// Repository for fee audit records.
#[async_trait]
pub trait FeeRepository: Send + Sync {
    /// Whether a fee was already recorded for the purchase.
    async fn fee_exists_for(&self, purchase_id: PurchaseId) -> StorageResult<bool>;

    /// Insert a fee. Returns `false` if one already exists for the purchase.
    async fn insert_fee(&self, fee: &Fee) -> StorageResult<bool>;

    /// Get the fee recorded for a purchase.
    async fn get_fee(&self, purchase_id: PurchaseId) -> StorageResult<Option<Fee>>;
}

// =============================================================================
// Composite Store
// =============================================================================

/// Combined ledger access for the reconciliation services.
///
/// This trait provides access to the individual repositories, kind-generic
/// helpers used by the engine and tracker, and the one atomic operation that
/// spans two tables.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Access the listing repository.
    fn listings(&self) -> &dyn ListingRepository;

    /// Access the purchase repository.
    fn purchases(&self) -> &dyn PurchaseRepository;

    /// Access the fee repository.
    fn fees(&self) -> &dyn FeeRepository;

    /// Complete a pending purchase and record its fee atomically.
    ///
    /// The fee is only inserted when the purchase transitioned in this call
    /// and no fee exists yet. If anything fails, nothing is written.
    async fn complete_purchase_atomic(
        &self,
        completion: &PurchaseCompletion,
    ) -> StorageResult<CompletionOutcome>;

    /// Find the pending record of `kind` waiting on `tx_hash`.
    async fn find_pending_by_tx_hash(
        &self,
        kind: RecordKind,
        tx_hash: &TxHash,
    ) -> StorageResult<Option<LedgerRecord>> {
        Ok(match kind {
            RecordKind::Listing => self
                .listings()
                .find_pending_by_tx_hash(tx_hash)
                .await?
                .map(LedgerRecord::Listing),
            RecordKind::Purchase => self
                .purchases()
                .find_pending_by_tx_hash(tx_hash)
                .await?
                .map(LedgerRecord::Purchase),
        })
    }

    /// Pending records of `kind`.
    async fn list_pending(&self, kind: RecordKind, limit: u32) -> StorageResult<Vec<LedgerRecord>> {
        Ok(match kind {
            RecordKind::Listing => self
                .listings()
                .list_pending(limit)
                .await?
                .into_iter()
                .map(LedgerRecord::Listing)
                .collect(),
            RecordKind::Purchase => self
                .purchases()
                .list_pending(limit)
                .await?
                .into_iter()
                .map(LedgerRecord::Purchase)
                .collect(),
        })
    }

    /// Current state of any record.
    async fn get_record(&self, id: RecordId) -> StorageResult<Option<LedgerRecord>> {
        Ok(match id {
            RecordId::Listing(id) => self.listings().get_listing(id).await?.map(LedgerRecord::Listing),
            RecordId::Purchase(id) => self
                .purchases()
                .get_purchase(id)
                .await?
                .map(LedgerRecord::Purchase),
        })
    }

    /// Store a refreshed confirmation count on a record pending on `tx_hash`.
    async fn record_confirmations(
        &self,
        id: RecordId,
        tx_hash: Option<&TxHash>,
        confirmations: u32,
    ) -> StorageResult<bool> {
        match id {
            RecordId::Listing(id) => {
                self.listings()
                    .record_confirmations(id, tx_hash, confirmations)
                    .await
            }
            RecordId::Purchase(id) => {
                self.purchases()
                    .record_confirmations(id, tx_hash, confirmations)
                    .await
            }
        }
    }

    /// Move a record pending on `tx_hash` to `failed`.
    async fn fail_pending(&self, id: RecordId, tx_hash: Option<&TxHash>) -> StorageResult<bool> {
        match id {
            RecordId::Listing(id) => {
                self.listings()
                    .compare_and_set_status(
                        id,
                        ListingStatus::Pending,
                        ListingStatus::Failed,
                        tx_hash,
                        None,
                    )
                    .await
            }
            RecordId::Purchase(id) => {
                self.purchases()
                    .compare_and_set_status(
                        id,
                        PurchaseStatus::Pending,
                        PurchaseStatus::Failed,
                        tx_hash,
                    )
                    .await
            }
        }
    }
}
