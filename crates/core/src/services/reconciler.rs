//! Reconciliation engine - periodically aligns the ledger with the chain.
//!
//! Each cycle scans recent transactions at the marketplace address, joins
//! them with every record the ledger still holds as pending, and settles,
//! refreshes or fails those records through the shared [`Settler`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::metrics::{CycleTimer, record_cycle_completed, record_cycle_failed};
use crate::models::{LedgerRecord, ListingStatus, RecordId, RecordKind};
use crate::ports::{ChainIndexer, LedgerStore, TxStatus};

use super::assessment::{ConfirmationPolicy, assess};
use super::settlement::{Applied, SettlementPolicy, Settler};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Well-known marketplace script address.
    pub marketplace_address: String,
    /// Interval between cycles.
    pub scan_interval: Duration,
    /// How many recent address transactions each cycle looks at.
    pub scan_limit: u32,
    /// Upper bound on pending records pulled from the ledger per kind.
    pub pending_batch: u32,
    pub confirmation: ConfirmationPolicy,
    pub settlement: SettlementPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            marketplace_address: String::new(),
            scan_interval: Duration::from_secs(30),
            scan_limit: 100,
            pending_batch: 500,
            confirmation: ConfirmationPolicy::default(),
            settlement: SettlementPolicy::default(),
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Transactions returned by the address scan.
    pub observed: usize,
    /// Distinct pending records examined.
    pub examined: usize,
    pub listings_confirmed: usize,
    pub listings_cancelled: usize,
    pub purchases_completed: usize,
    pub fees_recorded: usize,
    /// Pending records whose confirmation count moved.
    pub refreshed: usize,
    pub failed: usize,
    /// Compare-and-set writes another writer beat.
    pub lost_races: usize,
}

impl ReconciliationReport {
    /// Ledger writes performed by this cycle.
    pub fn writes(&self) -> usize {
        self.listings_confirmed
            + self.listings_cancelled
            + self.purchases_completed
            + self.fees_recorded
            + self.refreshed
            + self.failed
    }

    fn absorb(&mut self, applied: Applied) {
        match applied {
            Applied::ListingSettled(ListingStatus::Cancelled) => self.listings_cancelled += 1,
            Applied::ListingSettled(_) => self.listings_confirmed += 1,
            Applied::PurchaseCompleted { fee_recorded } => {
                self.purchases_completed += 1;
                if fee_recorded {
                    self.fees_recorded += 1;
                }
            }
            Applied::Refreshed => self.refreshed += 1,
            Applied::Failed(_) => self.failed += 1,
            Applied::LostRace => self.lost_races += 1,
            Applied::Unchanged => {}
        }
    }
}

// =============================================================================
// ReconciliationEngine
// =============================================================================

/// Periodic scanner converging pending ledger records to chain truth.
///
/// # Flow
///
/// 1. Scan recent transactions at the marketplace address
/// 2. Map each hash to pending listings/purchases
/// 3. Add every other pending record from the ledger
/// 4. Re-read each transaction's depth and apply the assessment
///
/// An indexer failure aborts the cycle; writes already made stay.
pub struct ReconciliationEngine {
    config: ReconcilerConfig,
    indexer: Arc<dyn ChainIndexer>,
    store: Arc<dyn LedgerStore>,
    settler: Settler,
}

impl ReconciliationEngine {
    pub fn new(
        config: ReconcilerConfig,
        indexer: Arc<dyn ChainIndexer>,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        let settler = Settler::new(store.clone(), config.settlement);
        Self {
            config,
            indexer,
            store,
            settler,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run cycles every `scan_interval` until shutdown.
    ///
    /// A cycle in flight is never restarted; ticks missed while it runs are
    /// skipped. Cycle errors are logged and retried on the next tick.
    #[instrument(skip_all, fields(address = %self.config.marketplace_address))]
    pub async fn run_forever(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> ReconcileResult<()> {
        info!(
            interval_secs = self.config.scan_interval.as_secs(),
            threshold = self.config.confirmation.threshold,
            "🔁 Starting reconciliation engine"
        );

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown requested");
                        return Err(ReconcileError::ShutdownRequested);
                    }
                    continue;
                }
            }

            if *shutdown_rx.borrow() {
                debug!("Shutdown requested");
                return Err(ReconcileError::ShutdownRequested);
            }

            match self.run_once().await {
                Ok(report) if report.writes() > 0 || report.lost_races > 0 => {
                    info!(
                        examined = report.examined,
                        confirmed = report.listings_confirmed,
                        cancelled = report.listings_cancelled,
                        completed = report.purchases_completed,
                        fees = report.fees_recorded,
                        failed = report.failed,
                        refreshed = report.refreshed,
                        lost_races = report.lost_races,
                        "🔁 Reconciliation cycle applied changes"
                    );
                }
                Ok(report) => {
                    debug!(
                        observed = report.observed,
                        examined = report.examined,
                        "Reconciliation cycle found nothing to do"
                    );
                }
                Err(e) => {
                    record_cycle_failed();
                    warn!(error = %e, "⚠️  Reconciliation cycle aborted, retrying next interval");
                }
            }
        }
    }

    /// Run a single reconciliation cycle.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> ReconcileResult<ReconciliationReport> {
        let _timer = CycleTimer::new();
        let mut report = ReconciliationReport::default();

        let observed = self
            .indexer
            .transactions_at(&self.config.marketplace_address, self.config.scan_limit)
            .await?;
        report.observed = observed.len();

        let mut candidates: BTreeMap<RecordId, LedgerRecord> = BTreeMap::new();
        for tx in &observed {
            for kind in [RecordKind::Listing, RecordKind::Purchase] {
                if let Some(record) = self.store.find_pending_by_tx_hash(kind, &tx.tx_hash).await? {
                    trace!(record = %record.id(), tx_hash = %tx.tx_hash, "Observed transaction matches pending record");
                    candidates.entry(record.id()).or_insert(record);
                }
            }
        }
        for kind in [RecordKind::Listing, RecordKind::Purchase] {
            for record in self.store.list_pending(kind, self.config.pending_batch).await? {
                candidates.entry(record.id()).or_insert(record);
            }
        }
        report.examined = candidates.len();

        for record in candidates.into_values() {
            let applied = self.reconcile_record(&record).await?;
            report.absorb(applied);
        }

        record_cycle_completed();
        Ok(report)
    }

    /// Re-read one record's transaction and apply the outcome.
    async fn reconcile_record(&self, record: &LedgerRecord) -> ReconcileResult<Applied> {
        let now = Utc::now();

        // No hash to look up: only the lookback window applies.
        let status = match record.tx_hash() {
            Some(tx_hash) => self.indexer.status(tx_hash).await?,
            None => TxStatus::not_found(),
        };
        let assessment = assess(&self.config.confirmation, record, &status, false, now);

        Ok(self.settler.apply(record, assessment, now).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessType, ListingAction, PurchaseStatus, TxHash};
    use crate::testing::{
        MemoryLedger, ScriptedIndexer, confirmed_listing, pending_listing, pending_purchase,
    };
    use rust_decimal::Decimal;

    const ADDRESS: &str = "addr_test1_market";

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            marketplace_address: ADDRESS.into(),
            settlement: SettlementPolicy {
                fee_percent: Decimal::new(5, 0),
                subscription_duration_days: 30,
            },
            ..Default::default()
        }
    }

    fn engine(ledger: &Arc<MemoryLedger>, indexer: &Arc<ScriptedIndexer>) -> ReconciliationEngine {
        ReconciliationEngine::new(config(), indexer.clone(), ledger.clone())
    }

    fn hash(s: &str) -> TxHash {
        TxHash::new(s).unwrap()
    }

    // Test critique: scénario "abc" à 25 confirmations, second passage sans écriture
    #[tokio::test]
    async fn test_listing_confirms_and_second_pass_is_noop() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let listing = pending_listing("abc", Utc::now());
        let id = listing.id;
        ledger.seed_listing(listing);
        indexer.observe(ADDRESS, "abc", 100);
        indexer.set_status("abc", TxStatus::seen(25));

        let engine = engine(&ledger, &indexer);

        let first = engine.run_once().await.unwrap();
        assert_eq!(first.listings_confirmed, 1);
        let stored = ledger.listing(id).unwrap();
        assert_eq!(stored.status, ListingStatus::Confirmed);
        assert_eq!(stored.confirmations, Some(25));

        let writes_after_first = ledger.writes();
        let second = engine.run_once().await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(ledger.writes(), writes_after_first);
    }

    #[tokio::test]
    async fn test_threshold_minus_one_stays_pending() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let listing = pending_listing("abc", Utc::now());
        let id = listing.id;
        ledger.seed_listing(listing);
        indexer.set_status("abc", TxStatus::seen(19));

        let report = engine(&ledger, &indexer).run_once().await.unwrap();

        assert_eq!(report.refreshed, 1);
        let stored = ledger.listing(id).unwrap();
        assert_eq!(stored.status, ListingStatus::Pending);
        assert_eq!(stored.confirmations, Some(19));
    }

    // Test critique: idempotence, aucun frais en double
    #[tokio::test]
    async fn test_purchase_completion_records_one_fee() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let now = Utc::now();
        let listing = confirmed_listing(AccessType::Lifetime, now);
        let purchase = pending_purchase(&listing, "beef", now);
        let purchase_id = purchase.id;
        ledger.seed_listing(listing);
        ledger.seed_purchase(purchase);
        indexer.observe(ADDRESS, "beef", 10);
        indexer.set_status("beef", TxStatus::seen(30));

        let engine = engine(&ledger, &indexer);
        for _ in 0..3 {
            engine.run_once().await.unwrap();
        }

        let stored = ledger.purchase(purchase_id).unwrap();
        assert_eq!(stored.status, PurchaseStatus::Completed);
        assert_eq!(stored.subscription_expiry, None);
        assert_eq!(ledger.fee_count(), 1);
        let fee = ledger.fee(purchase_id).unwrap();
        // 5% de 100
        assert_eq!(fee.fee_amount, Decimal::new(5, 0));
    }

    #[tokio::test]
    async fn test_subscription_purchase_gets_expiry() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let now = Utc::now();
        let listing = confirmed_listing(AccessType::Subscription, now);
        let purchase = pending_purchase(&listing, "cafe", now);
        let purchase_id = purchase.id;
        ledger.seed_listing(listing);
        ledger.seed_purchase(purchase);
        indexer.set_status("cafe", TxStatus::seen(20));

        engine(&ledger, &indexer).run_once().await.unwrap();

        let stored = ledger.purchase(purchase_id).unwrap();
        let completed_at = stored.completed_at.unwrap();
        assert_eq!(
            stored.subscription_expiry,
            Some(completed_at + chrono::Duration::days(30))
        );
    }

    #[tokio::test]
    async fn test_confirmed_cancel_moves_listing_to_cancelled() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let mut listing = pending_listing("dead", Utc::now());
        listing.pending_action = Some(ListingAction::Cancel);
        let id = listing.id;
        ledger.seed_listing(listing);
        indexer.set_status("dead", TxStatus::seen(21));

        let report = engine(&ledger, &indexer).run_once().await.unwrap();

        assert_eq!(report.listings_cancelled, 1);
        assert_eq!(ledger.listing(id).unwrap().status, ListingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_never_observed_record_fails_after_max_age() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let listing = pending_listing("0bad", Utc::now() - chrono::Duration::hours(2));
        let id = listing.id;
        ledger.seed_listing(listing);

        let report = engine(&ledger, &indexer).run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(ledger.listing(id).unwrap().status, ListingStatus::Failed);
    }

    // Test critique: les états terminaux ne bougent plus
    #[tokio::test]
    async fn test_terminal_records_are_never_touched() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let now = Utc::now();

        let mut cancelled = pending_listing("aa01", now);
        cancelled.status = ListingStatus::Cancelled;
        let mut failed = pending_listing("aa02", now);
        failed.status = ListingStatus::Failed;
        let mut confirmed = pending_listing("aa03", now);
        confirmed.status = ListingStatus::Confirmed;
        confirmed.confirmations = Some(20);
        let ids = [cancelled.id, failed.id, confirmed.id];
        for listing in [cancelled, failed, confirmed] {
            ledger.seed_listing(listing);
        }
        for (i, tx) in ["aa01", "aa02", "aa03"].iter().enumerate() {
            indexer.observe(ADDRESS, tx, i as u64);
            indexer.set_status(tx, TxStatus::seen(99));
        }

        let before: Vec<_> = ids.iter().map(|id| ledger.listing(*id).unwrap()).collect();
        let report = engine(&ledger, &indexer).run_once().await.unwrap();
        let after: Vec<_> = ids.iter().map(|id| ledger.listing(*id).unwrap()).collect();

        assert_eq!(report.examined, 0);
        assert_eq!(before, after);
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_indexer_aborts_cycle() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        ledger.seed_listing(pending_listing("abc", Utc::now()));
        indexer.set_unreachable(true);

        let result = engine(&ledger, &indexer).run_once().await;

        assert!(matches!(result, Err(ReconcileError::Chain(_))));
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn test_observed_hash_without_record_is_ignored() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        indexer.observe(ADDRESS, "f00d", 1);
        indexer.set_status("f00d", TxStatus::seen(50));

        let report = engine(&ledger, &indexer).run_once().await.unwrap();

        assert_eq!(report.observed, 1);
        assert_eq!(report.examined, 0);
        assert!(indexer.status_calls(&hash("f00d")) == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_forever_stops_on_shutdown() {
        let ledger = Arc::new(MemoryLedger::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let engine = Arc::new(engine(&ledger, &indexer));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_forever(rx).await }
        });
        tokio::time::sleep(Duration::from_secs(65)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ReconcileError::ShutdownRequested)));
        assert!(indexer.scan_calls() >= 2);
    }
}
