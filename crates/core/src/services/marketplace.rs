//! Marketplace actions: submit a transaction, then record it in the ledger.
//!
//! A successful submission creates (or re-arms) the record as `pending`. A
//! rejected list or purchase is recorded directly as `failed`; a rejected
//! edit or cancel leaves the listing as it was. Validation and exchange-rate
//! errors write nothing.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::error::{DomainError, ReconcileError, ReconcileResult, SubmitError};
use crate::models::{
    AccessType, Listing, ListingAction, ListingId, ListingMetadata, ListingStatus, Purchase,
    PurchaseId, PurchaseStatus, RecordId, TxHash,
};
use crate::ports::{LedgerStore, ListingRearm, PaymentOutput};

use super::submitter::{
    CancelParams, ListingParams, MarketAction, PurchaseParams, Submission, TransactionSubmitter,
};
use super::tracker::{ConfirmationTracker, TrackOutcome};

/// Per-call behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionOptions {
    /// Block until the tracker settles the record.
    pub await_confirmation: bool,
}

/// A new listing to publish.
#[derive(Debug, Clone)]
pub struct NewListing {
    pub seller: String,
    pub price: Decimal,
    pub full_price: Option<Decimal>,
    pub currency: String,
    pub access_type: AccessType,
    pub metadata: ListingMetadata,
}

/// New terms for an existing listing.
#[derive(Debug, Clone)]
pub struct ListingEdit {
    pub price: Decimal,
    pub full_price: Option<Decimal>,
    pub metadata: ListingMetadata,
}

/// What an accepted action produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionReceipt {
    pub record_id: RecordId,
    pub tx_hash: TxHash,
    pub payment: Option<PaymentOutput>,
    /// Set when the caller asked to await confirmation.
    pub outcome: Option<TrackOutcome>,
}

/// Entry point for seller and buyer actions.
pub struct Marketplace {
    submitter: Arc<TransactionSubmitter>,
    store: Arc<dyn LedgerStore>,
    tracker: Arc<ConfirmationTracker>,
}

impl Marketplace {
    pub fn new(
        submitter: Arc<TransactionSubmitter>,
        store: Arc<dyn LedgerStore>,
        tracker: Arc<ConfirmationTracker>,
    ) -> Self {
        Self {
            submitter,
            store,
            tracker,
        }
    }

    #[instrument(skip_all, fields(seller = %new.seller))]
    pub async fn create_listing(
        &self,
        new: NewListing,
        options: ActionOptions,
    ) -> ReconcileResult<ActionReceipt> {
        let id = ListingId::new();
        let action = MarketAction::List(ListingParams {
            listing_id: id,
            seller: new.seller.clone(),
            price: new.price,
            full_price: new.full_price,
            metadata: new.metadata.clone(),
        });

        let result = self.submitter.submit(&action).await;
        let now = Utc::now();
        let mut listing = Listing {
            id,
            seller: new.seller,
            price: new.price,
            full_price: new.full_price,
            currency: new.currency,
            access_type: new.access_type,
            status: ListingStatus::Pending,
            pending_action: Some(ListingAction::List),
            tx_hash: None,
            confirmations: None,
            metadata: new.metadata,
            created_at: now,
            submitted_at: now,
            updated_at: now,
        };

        let submission = match result {
            Ok(submission) => submission,
            Err(e) => {
                if let SubmitError::Rejected(_) = e {
                    listing.status = ListingStatus::Failed;
                    listing.pending_action = None;
                    self.store.listings().insert_listing(&listing).await?;
                    warn!(listing = %id, "Listing recorded as failed after rejection");
                }
                return Err(e.into());
            }
        };

        listing.tx_hash = Some(submission.tx_hash.clone());
        self.store.listings().insert_listing(&listing).await?;
        info!(listing = %id, tx_hash = %submission.tx_hash, "🆕 Listing pending confirmation");

        self.finish(RecordId::Listing(id), submission, options).await
    }

    #[instrument(skip(self, edit, options))]
    pub async fn edit_listing(
        &self,
        listing_id: ListingId,
        edit: ListingEdit,
        options: ActionOptions,
    ) -> ReconcileResult<ActionReceipt> {
        let listing = self.settled_listing(listing_id).await?;
        let action = MarketAction::Edit(ListingParams {
            listing_id,
            seller: listing.seller.clone(),
            price: edit.price,
            full_price: edit.full_price,
            metadata: edit.metadata.clone(),
        });
        let submission = self.submitter.submit(&action).await?;

        let rearm = ListingRearm {
            action: ListingAction::Edit,
            tx_hash: submission.tx_hash.clone(),
            price: edit.price,
            full_price: edit.full_price,
            metadata: edit.metadata,
            submitted_at: Utc::now(),
        };
        self.rearm(&listing, &rearm).await?;
        self.finish(RecordId::Listing(listing_id), submission, options).await
    }

    #[instrument(skip(self, options))]
    pub async fn cancel_listing(
        &self,
        listing_id: ListingId,
        options: ActionOptions,
    ) -> ReconcileResult<ActionReceipt> {
        let listing = self.settled_listing(listing_id).await?;
        let action = MarketAction::Cancel(CancelParams {
            listing_id,
            seller: listing.seller.clone(),
        });
        let submission = self.submitter.submit(&action).await?;

        let rearm = ListingRearm {
            action: ListingAction::Cancel,
            tx_hash: submission.tx_hash.clone(),
            price: listing.price,
            full_price: listing.full_price,
            metadata: listing.metadata.clone(),
            submitted_at: Utc::now(),
        };
        self.rearm(&listing, &rearm).await?;
        self.finish(RecordId::Listing(listing_id), submission, options).await
    }

    /// Buy a listing, or subscribe to it when its access type is
    /// `subscription`.
    #[instrument(skip(self, options))]
    pub async fn purchase(
        &self,
        listing_id: ListingId,
        buyer: &str,
        options: ActionOptions,
    ) -> ReconcileResult<ActionReceipt> {
        let listing = self.settled_listing(listing_id).await?;
        let params = PurchaseParams {
            listing_id,
            seller: listing.seller.clone(),
            buyer: buyer.to_string(),
            price: listing.price,
            currency: listing.currency.clone(),
        };
        let action = match listing.access_type {
            AccessType::Subscription => MarketAction::Subscribe {
                purchase: params,
                duration_days: self.tracker.config().settlement.subscription_duration_days,
            },
            AccessType::Lifetime | AccessType::Ownership => MarketAction::Buy(params),
        };

        let result = self.submitter.submit(&action).await;
        let now = Utc::now();
        let mut purchase = Purchase {
            id: PurchaseId::new(),
            buyer: buyer.to_string(),
            listing_id,
            amount: listing.price,
            currency: listing.currency,
            status: PurchaseStatus::Pending,
            tx_hash: None,
            confirmations: None,
            subscription_expiry: None,
            created_at: now,
            submitted_at: now,
            completed_at: None,
            updated_at: now,
        };

        let submission = match result {
            Ok(submission) => submission,
            Err(e) => {
                if let SubmitError::Rejected(_) = e {
                    purchase.status = PurchaseStatus::Failed;
                    self.store.purchases().insert_purchase(&purchase).await?;
                    warn!(purchase = %purchase.id, "Purchase recorded as failed after rejection");
                }
                return Err(e.into());
            }
        };

        purchase.tx_hash = Some(submission.tx_hash.clone());
        self.store.purchases().insert_purchase(&purchase).await?;
        info!(
            purchase = %purchase.id,
            listing = %listing_id,
            tx_hash = %submission.tx_hash,
            "🛒 Purchase pending confirmation"
        );

        self.finish(RecordId::Purchase(purchase.id), submission, options).await
    }

    /// A listing that can take a new transaction: it exists and is neither
    /// pending nor terminal.
    async fn settled_listing(&self, id: ListingId) -> ReconcileResult<Listing> {
        let listing = self
            .store
            .listings()
            .get_listing(id)
            .await?
            .ok_or_else(|| DomainError::ListingNotFound(id.to_string()))?;
        match listing.status {
            ListingStatus::Active | ListingStatus::Confirmed => Ok(listing),
            other => Err(DomainError::InvalidState(format!(
                "listing {} is {}",
                id, other
            ))
            .into()),
        }
    }

    /// Point the listing at the accepted transaction.
    ///
    /// The transaction is already out, so any failure here hands its hash
    /// back to the caller.
    async fn rearm(&self, listing: &Listing, rearm: &ListingRearm) -> ReconcileResult<()> {
        let unrecorded = |reason: String| ReconcileError::Unrecorded {
            record: RecordId::Listing(listing.id),
            tx_hash: rearm.tx_hash.clone(),
            reason,
        };

        let moved = self
            .store
            .listings()
            .rearm(listing.id, listing.status, rearm)
            .await
            .map_err(|e| unrecorded(e.to_string()))?;
        if !moved {
            warn!(
                listing = %listing.id,
                tx_hash = %rearm.tx_hash,
                "⚠️  Listing changed while the transaction was submitted, transaction not recorded"
            );
            return Err(unrecorded(format!("listing changed during {}", rearm.action)));
        }
        info!(listing = %listing.id, action = %rearm.action, tx_hash = %rearm.tx_hash, "Listing pending confirmation");
        Ok(())
    }

    async fn finish(
        &self,
        record_id: RecordId,
        submission: Submission,
        options: ActionOptions,
    ) -> ReconcileResult<ActionReceipt> {
        let outcome = if options.await_confirmation {
            Some(
                self.tracker
                    .track(submission.tx_hash.clone(), record_id)
                    .await,
            )
        } else {
            None
        };

        Ok(ActionReceipt {
            record_id,
            tx_hash: submission.tx_hash,
            payment: submission.payment,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubmitResult;
    use crate::models::AssetKind;
    use crate::ports::{ChainClient, TxRequest, TxStatus};
    use crate::retry::RetryPolicy;
    use crate::services::{
        ReconcilerConfig, ReconciliationEngine, SubmitterConfig, TrackerConfig,
    };
    use crate::testing::{MemoryLedger, ScriptedChainClient, ScriptedIndexer, ScriptedSubmit};
    use std::time::Duration;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        indexer: Arc<ScriptedIndexer>,
        client: Arc<ScriptedChainClient>,
        market: Marketplace,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let client = Arc::new(ScriptedChainClient::new());
        let retry = RetryPolicy::fixed(3, Duration::from_secs(2));
        let submitter = Arc::new(TransactionSubmitter::new(
            SubmitterConfig {
                retry,
                ..Default::default()
            },
            client.clone(),
            indexer.clone(),
        ));
        let tracker = Arc::new(ConfirmationTracker::new(
            TrackerConfig {
                retry,
                ..Default::default()
            },
            indexer.clone(),
            ledger.clone(),
        ));
        let market = Marketplace::new(submitter, ledger.clone(), tracker);
        Fixture {
            ledger,
            indexer,
            client,
            market,
        }
    }

    fn new_listing(access_type: AccessType, currency: &str) -> NewListing {
        NewListing {
            seller: "addr_seller".into(),
            price: Decimal::new(100, 0),
            full_price: Some(Decimal::new(120, 0)),
            currency: currency.into(),
            access_type,
            metadata: ListingMetadata::new(AssetKind::Agent).with("name", "router"),
        }
    }

    fn listing_id(receipt: &ActionReceipt) -> ListingId {
        match receipt.record_id {
            RecordId::Listing(id) => id,
            other => panic!("expected listing, got {other}"),
        }
    }

    /// Publish a listing and mark it confirmed.
    async fn confirmed(f: &Fixture, access_type: AccessType, currency: &str) -> ListingId {
        let receipt = f
            .market
            .create_listing(new_listing(access_type, currency), ActionOptions::default())
            .await
            .unwrap();
        f.indexer.set_status(receipt.tx_hash.as_str(), TxStatus::seen(20));
        let engine = ReconciliationEngine::new(
            ReconcilerConfig::default(),
            f.indexer.clone(),
            f.ledger.clone(),
        );
        engine.run_once().await.unwrap();
        listing_id(&receipt)
    }

    #[tokio::test]
    async fn test_create_listing_records_pending() {
        let f = fixture();

        let receipt = f
            .market
            .create_listing(new_listing(AccessType::Lifetime, "ADA"), ActionOptions::default())
            .await
            .unwrap();

        let stored = f.ledger.listing(listing_id(&receipt)).unwrap();
        assert_eq!(stored.status, ListingStatus::Pending);
        assert_eq!(stored.pending_action, Some(ListingAction::List));
        assert_eq!(stored.tx_hash, Some(receipt.tx_hash.clone()));
        assert_eq!(receipt.outcome, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_listing_can_await_confirmation() {
        let f = fixture();
        f.indexer.set_status(&format!("{:064x}", 1), TxStatus::seen(25));

        let receipt = f
            .market
            .create_listing(
                new_listing(AccessType::Lifetime, "ADA"),
                ActionOptions {
                    await_confirmation: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(receipt.outcome, Some(TrackOutcome::Confirmed));
        let stored = f.ledger.listing(listing_id(&receipt)).unwrap();
        assert_eq!(stored.status, ListingStatus::Confirmed);
    }

    // Test critique: un rejet crée directement un enregistrement en échec
    #[tokio::test]
    async fn test_rejected_listing_is_recorded_failed() {
        let f = fixture();
        f.client.push(ScriptedSubmit::Rejected("insufficient funds".into()));

        let err = f
            .market
            .create_listing(new_listing(AccessType::Lifetime, "ADA"), ActionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Submit(SubmitError::Rejected(_))));
        let listings = f.ledger.all_listings();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].status, ListingStatus::Failed);
        assert_eq!(listings[0].tx_hash, None);
    }

    #[tokio::test]
    async fn test_rejected_edit_leaves_listing_unchanged() {
        let f = fixture();
        let id = confirmed(&f, AccessType::Lifetime, "ADA").await;
        let before = f.ledger.listing(id).unwrap();
        f.client.push(ScriptedSubmit::Rejected("script failure".into()));

        let result = f
            .market
            .edit_listing(
                id,
                ListingEdit {
                    price: Decimal::new(80, 0),
                    full_price: None,
                    metadata: before.metadata.clone(),
                },
                ActionOptions::default(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(f.ledger.listing(id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_edit_rearms_listing() {
        let f = fixture();
        let id = confirmed(&f, AccessType::Lifetime, "ADA").await;

        let receipt = f
            .market
            .edit_listing(
                id,
                ListingEdit {
                    price: Decimal::new(80, 0),
                    full_price: None,
                    metadata: ListingMetadata::new(AssetKind::Agent).with("name", "router-v2"),
                },
                ActionOptions::default(),
            )
            .await
            .unwrap();

        let stored = f.ledger.listing(id).unwrap();
        assert_eq!(stored.status, ListingStatus::Pending);
        assert_eq!(stored.pending_action, Some(ListingAction::Edit));
        assert_eq!(stored.price, Decimal::new(80, 0));
        assert_eq!(stored.tx_hash, Some(receipt.tx_hash));
        assert_eq!(stored.confirmations, None);
    }

    #[tokio::test]
    async fn test_cancel_settles_to_cancelled() {
        let f = fixture();
        let id = confirmed(&f, AccessType::Lifetime, "ADA").await;

        let receipt = f
            .market
            .cancel_listing(id, ActionOptions::default())
            .await
            .unwrap();
        f.indexer.set_status(receipt.tx_hash.as_str(), TxStatus::seen(20));
        ReconciliationEngine::new(ReconcilerConfig::default(), f.indexer.clone(), f.ledger.clone())
            .run_once()
            .await
            .unwrap();

        let stored = f.ledger.listing(id).unwrap();
        assert_eq!(stored.status, ListingStatus::Cancelled);
        assert!(f.market.cancel_listing(id, ActionOptions::default()).await.is_err());
    }

    // Test critique: pas de taux, pas d'achat enregistré
    #[tokio::test]
    async fn test_purchase_without_rate_creates_no_record() {
        let f = fixture();
        let id = confirmed(&f, AccessType::Lifetime, "USD").await;

        let err = f
            .market
            .purchase(id, "addr_buyer", ActionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Submit(SubmitError::NoExchangeRate(_))));
        assert!(f.ledger.all_purchases().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_purchase_submits_subscribe_datum() {
        let f = fixture();
        let id = confirmed(&f, AccessType::Subscription, "USD").await;
        f.indexer.set_rate("USD", Decimal::new(5, 1));

        let receipt = f
            .market
            .purchase(id, "addr_buyer", ActionOptions::default())
            .await
            .unwrap();

        assert_eq!(
            receipt.payment.as_ref().map(|p| p.amount),
            Some(Decimal::new(5, 5))
        );
        let request = f.client.requests().pop().unwrap();
        assert_eq!(request.datum.action_name(), "subscribe");

        let RecordId::Purchase(purchase_id) = receipt.record_id else {
            panic!("expected purchase");
        };
        let stored = f.ledger.purchase(purchase_id).unwrap();
        assert_eq!(stored.status, PurchaseStatus::Pending);
        assert_eq!(stored.amount, Decimal::new(100, 0));
        assert_eq!(stored.currency, "USD");
    }

    #[tokio::test]
    async fn test_rejected_purchase_is_recorded_failed() {
        let f = fixture();
        let id = confirmed(&f, AccessType::Lifetime, "ADA").await;
        f.client.push(ScriptedSubmit::Rejected("double spend".into()));

        let result = f.market.purchase(id, "addr_buyer", ActionOptions::default()).await;

        assert!(result.is_err());
        let purchases = f.ledger.all_purchases();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].status, PurchaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_purchase_of_pending_listing_is_refused() {
        let f = fixture();
        let receipt = f
            .market
            .create_listing(new_listing(AccessType::Lifetime, "ADA"), ActionOptions::default())
            .await
            .unwrap();

        let err = f
            .market
            .purchase(listing_id(&receipt), "addr_buyer", ActionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Domain(DomainError::InvalidState(_))));
        assert_eq!(f.client.calls(), 1);
    }

    /// Accepts every submission while cancelling the listing underneath.
    struct RacingClient {
        ledger: Arc<MemoryLedger>,
        listing: ListingId,
    }

    #[async_trait::async_trait]
    impl ChainClient for RacingClient {
        async fn submit(&self, _request: &TxRequest) -> SubmitResult<TxHash> {
            let mut listing = self.ledger.listing(self.listing).unwrap();
            listing.status = ListingStatus::Cancelled;
            self.ledger.seed_listing(listing);
            Ok(TxHash::new("e0e0").unwrap())
        }
    }

    // Test critique: une transaction acceptée mais non enregistrée remonte son hash
    #[tokio::test]
    async fn test_lost_rearm_returns_accepted_hash() {
        let f = fixture();
        let id = confirmed(&f, AccessType::Lifetime, "ADA").await;
        let client = Arc::new(RacingClient {
            ledger: f.ledger.clone(),
            listing: id,
        });
        let submitter = Arc::new(TransactionSubmitter::new(
            SubmitterConfig::default(),
            client,
            f.indexer.clone(),
        ));
        let tracker = Arc::new(ConfirmationTracker::new(
            TrackerConfig::default(),
            f.indexer.clone(),
            f.ledger.clone(),
        ));
        let market = Marketplace::new(submitter, f.ledger.clone(), tracker);

        let err = market
            .cancel_listing(id, ActionOptions::default())
            .await
            .unwrap_err();

        let ReconcileError::Unrecorded {
            record, tx_hash, ..
        } = err
        else {
            panic!("expected an unrecorded transaction");
        };
        assert_eq!(record, RecordId::Listing(id));
        assert_eq!(tx_hash.as_str(), "e0e0");
        let stored = f.ledger.listing(id).unwrap();
        assert_eq!(stored.status, ListingStatus::Cancelled);
        assert_ne!(stored.tx_hash, Some(tx_hash));
    }
}
