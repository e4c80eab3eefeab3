//! Applies confirmation assessments to the ledger.
//!
//! Both the engine and the trackers go through [`Settler::apply`], so a
//! purchase completes the same way (fee row, subscription expiry) no matter
//! which of them wins the compare-and-set.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::StorageResult;
use crate::metrics::{record_fee_recorded, record_lost_race, record_transition};
use crate::models::{
    AccessType, Fee, LedgerRecord, Listing, ListingAction, ListingStatus, Purchase,
    PurchaseStatus,
};
use crate::ports::{LedgerStore, PurchaseCompletion};

use super::assessment::{Assessment, FailureReason};

/// Default subscription length granted by a completed subscription purchase.
pub const DEFAULT_SUBSCRIPTION_DAYS: u32 = 30;

/// Fee and subscription policy, supplied by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementPolicy {
    /// Marketplace fee as a percentage of the purchase amount (2.5 = 2.5%).
    pub fee_percent: Decimal,
    pub subscription_duration_days: u32,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            fee_percent: Decimal::ZERO,
            subscription_duration_days: DEFAULT_SUBSCRIPTION_DAYS,
        }
    }
}

impl SettlementPolicy {
    /// Fee owed on `amount`.
    pub fn fee_for(&self, amount: Decimal) -> Decimal {
        amount * self.fee_percent / Decimal::ONE_HUNDRED
    }

    /// Expiry granted by a purchase of a listing with `access` completing
    /// at `completed_at`.
    pub fn subscription_expiry(
        &self,
        access: AccessType,
        completed_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match access {
            AccessType::Subscription => {
                Some(completed_at + Duration::days(i64::from(self.subscription_duration_days)))
            }
            AccessType::Lifetime | AccessType::Ownership => None,
        }
    }
}

/// What [`Settler::apply`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Listing moved to `confirmed` or `cancelled`.
    ListingSettled(ListingStatus),
    /// Purchase moved to `completed`.
    PurchaseCompleted { fee_recorded: bool },
    /// Confirmation count refreshed, still pending.
    Refreshed,
    Failed(FailureReason),
    /// Another writer moved the record first.
    LostRace,
    Unchanged,
}

impl Applied {
    /// Whether the record has left `pending` (by this write or another).
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Refreshed | Self::Unchanged)
    }
}

/// Writes assessment outcomes with compare-and-set semantics.
pub struct Settler {
    store: Arc<dyn LedgerStore>,
    policy: SettlementPolicy,
}

impl Settler {
    pub fn new(store: Arc<dyn LedgerStore>, policy: SettlementPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &SettlementPolicy {
        &self.policy
    }

    /// Apply `assessment` to `record` as observed at `now`.
    pub async fn apply(
        &self,
        record: &LedgerRecord,
        assessment: Assessment,
        now: DateTime<Utc>,
    ) -> StorageResult<Applied> {
        match assessment {
            Assessment::Unchanged => Ok(Applied::Unchanged),
            Assessment::Progress { confirmations } => {
                let written = self
                    .store
                    .record_confirmations(record.id(), record.tx_hash(), confirmations)
                    .await?;
                if written {
                    debug!(record = %record.id(), confirmations, "Confirmations refreshed");
                    Ok(Applied::Refreshed)
                } else {
                    Ok(Applied::Unchanged)
                }
            }
            Assessment::Confirmed { confirmations } => match record {
                LedgerRecord::Listing(listing) => self.settle_listing(listing, confirmations).await,
                LedgerRecord::Purchase(purchase) => {
                    self.complete_purchase(purchase, confirmations, now).await
                }
            },
            Assessment::Failed(reason) => self.fail(record, reason).await,
        }
    }

    async fn settle_listing(&self, listing: &Listing, confirmations: u32) -> StorageResult<Applied> {
        let action = listing.pending_action.unwrap_or(ListingAction::List);
        let next = action.settled_status();

        let moved = self
            .store
            .listings()
            .compare_and_set_status(
                listing.id,
                ListingStatus::Pending,
                next,
                listing.tx_hash.as_ref(),
                Some(confirmations),
            )
            .await?;

        if !moved {
            debug!(listing = %listing.id, "Listing settled or re-armed by another writer");
            record_lost_race("listing");
            return Ok(Applied::LostRace);
        }

        info!(
            listing = %listing.id,
            action = %action,
            confirmations,
            status = %next,
            "✅ Listing settled"
        );
        record_transition("listing", next.as_str());
        Ok(Applied::ListingSettled(next))
    }

    async fn complete_purchase(
        &self,
        purchase: &Purchase,
        confirmations: u32,
        now: DateTime<Utc>,
    ) -> StorageResult<Applied> {
        let access = match self.store.listings().get_listing(purchase.listing_id).await? {
            Some(listing) => listing.access_type,
            None => {
                warn!(
                    purchase = %purchase.id,
                    listing = %purchase.listing_id,
                    "⚠️  Purchase references a missing listing, settling without subscription"
                );
                AccessType::Lifetime
            }
        };

        let fee = if self.store.fees().fee_exists_for(purchase.id).await? {
            None
        } else {
            Some(Fee {
                purchase_id: purchase.id,
                fee_amount: self.policy.fee_for(purchase.amount),
                recorded_at: now,
            })
        };

        let completion = PurchaseCompletion {
            purchase_id: purchase.id,
            tx_hash: purchase.tx_hash.clone(),
            confirmations,
            completed_at: now,
            subscription_expiry: self.policy.subscription_expiry(access, now),
            fee,
        };

        let outcome = self.store.complete_purchase_atomic(&completion).await?;
        if !outcome.transitioned {
            debug!(purchase = %purchase.id, "Purchase settled by another writer");
            record_lost_race("purchase");
            return Ok(Applied::LostRace);
        }

        info!(
            purchase = %purchase.id,
            confirmations,
            fee_recorded = outcome.fee_recorded,
            subscription_expiry = ?completion.subscription_expiry,
            "✅ Purchase completed"
        );
        record_transition("purchase", PurchaseStatus::Completed.as_str());
        if outcome.fee_recorded {
            record_fee_recorded();
        }
        Ok(Applied::PurchaseCompleted {
            fee_recorded: outcome.fee_recorded,
        })
    }

    async fn fail(&self, record: &LedgerRecord, reason: FailureReason) -> StorageResult<Applied> {
        if !self.store.fail_pending(record.id(), record.tx_hash()).await? {
            record_lost_race(record.kind().as_str());
            return Ok(Applied::LostRace);
        }

        warn!(
            record = %record.id(),
            tx_hash = ?record.tx_hash().map(|h| h.as_str()),
            reason = reason.as_str(),
            "❌ Pending record failed"
        );
        record_transition(record.kind().as_str(), "failed");
        Ok(Applied::Failed(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TxHash;
    use crate::ports::ListingRearm;
    use crate::testing::{MemoryLedger, confirmed_listing, pending_listing, pending_purchase};

    fn policy() -> SettlementPolicy {
        SettlementPolicy {
            fee_percent: Decimal::new(25, 1),
            subscription_duration_days: 30,
        }
    }

    #[test]
    fn test_fee_is_percentage_of_amount() {
        assert_eq!(policy().fee_for(Decimal::new(200, 0)), Decimal::new(5, 0));
        assert_eq!(
            SettlementPolicy::default().fee_for(Decimal::new(200, 0)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_expiry_only_for_subscriptions() {
        let now = Utc::now();
        assert_eq!(
            policy().subscription_expiry(AccessType::Subscription, now),
            Some(now + Duration::days(30))
        );
        assert_eq!(policy().subscription_expiry(AccessType::Lifetime, now), None);
        assert_eq!(policy().subscription_expiry(AccessType::Ownership, now), None);
    }

    // Test critique: deux écrivains concurrents, un seul frais enregistré
    #[tokio::test]
    async fn test_second_completion_loses_race_without_second_fee() {
        let ledger = Arc::new(MemoryLedger::new());
        let now = Utc::now();
        let listing = confirmed_listing(AccessType::Lifetime, now);
        let purchase = pending_purchase(&listing, "feed", now);
        ledger.seed_listing(listing);
        ledger.seed_purchase(purchase.clone());

        let settler = Settler::new(ledger.clone(), policy());
        let record = LedgerRecord::Purchase(purchase);
        let confirmed = Assessment::Confirmed { confirmations: 25 };

        let first = settler.apply(&record, confirmed, now).await.unwrap();
        let second = settler.apply(&record, confirmed, now).await.unwrap();

        assert_eq!(first, Applied::PurchaseCompleted { fee_recorded: true });
        assert_eq!(second, Applied::LostRace);
        assert_eq!(ledger.fee_count(), 1);
    }

    // Test critique: une copie périmée (tx A) ne touche pas la listing ré-armée sur tx B
    #[tokio::test]
    async fn test_stale_record_cannot_settle_rearmed_listing() {
        let ledger = Arc::new(MemoryLedger::new());
        let now = Utc::now();
        let stale = pending_listing("aaaa", now);
        let listing_id = stale.id;
        let metadata = stale.metadata.clone();
        ledger.seed_listing(stale.clone());

        let settler = Settler::new(ledger.clone(), policy());
        let stale = LedgerRecord::Listing(stale);
        let first = settler
            .apply(&stale, Assessment::Confirmed { confirmations: 25 }, now)
            .await
            .unwrap();
        assert_eq!(first, Applied::ListingSettled(ListingStatus::Confirmed));

        let edit = ListingRearm {
            action: ListingAction::Edit,
            tx_hash: TxHash::new("bbbb").unwrap(),
            price: Decimal::new(120, 0),
            full_price: None,
            metadata,
            submitted_at: now,
        };
        assert!(
            ledger
                .listings()
                .rearm(listing_id, ListingStatus::Confirmed, &edit)
                .await
                .unwrap()
        );
        let writes = ledger.writes();

        let progress = settler
            .apply(&stale, Assessment::Progress { confirmations: 7 }, now)
            .await
            .unwrap();
        let confirmed = settler
            .apply(&stale, Assessment::Confirmed { confirmations: 30 }, now)
            .await
            .unwrap();
        let failed = settler
            .apply(&stale, Assessment::Failed(FailureReason::RolledBack), now)
            .await
            .unwrap();

        assert_eq!(progress, Applied::Unchanged);
        assert_eq!(confirmed, Applied::LostRace);
        assert_eq!(failed, Applied::LostRace);
        assert_eq!(ledger.writes(), writes);

        let stored = ledger.listing(listing_id).unwrap();
        assert_eq!(stored.status, ListingStatus::Pending);
        assert_eq!(stored.pending_action, Some(ListingAction::Edit));
        assert_eq!(stored.tx_hash.unwrap().as_str(), "bbbb");
        assert_eq!(stored.confirmations, None);
    }

    #[tokio::test]
    async fn test_stale_purchase_hash_does_not_complete() {
        let ledger = Arc::new(MemoryLedger::new());
        let now = Utc::now();
        let listing = confirmed_listing(AccessType::Lifetime, now);
        let purchase = pending_purchase(&listing, "feed", now);
        ledger.seed_listing(listing);
        ledger.seed_purchase(purchase.clone());

        let mut stale = purchase;
        stale.tx_hash = Some(TxHash::new("dead").unwrap());
        let settler = Settler::new(ledger.clone(), policy());
        let applied = settler
            .apply(
                &LedgerRecord::Purchase(stale.clone()),
                Assessment::Confirmed { confirmations: 25 },
                now,
            )
            .await
            .unwrap();

        assert_eq!(applied, Applied::LostRace);
        assert_eq!(ledger.purchase(stale.id).unwrap().status, PurchaseStatus::Pending);
        assert_eq!(ledger.fee_count(), 0);
    }
}
