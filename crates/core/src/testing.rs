//! In-memory port implementations and record fixtures.
//!
//! Compiled for this crate's own tests, and exported to downstream crates
//! through the `testing` feature so they can drive the services without a
//! database or a node.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{ChainError, ChainResult, StorageResult, SubmitError, SubmitResult};
use crate::models::{
    AccessType, AssetKind, Fee, Listing, ListingAction, ListingId, ListingMetadata,
    ListingStatus, Purchase, PurchaseId, PurchaseStatus, TxHash,
};
use crate::ports::{
    ChainClient, ChainIndexer, CompletionOutcome, FeeRepository, LedgerStore, ListingRearm,
    ListingRepository, ObservedTx, OracleRate, PurchaseCompletion, PurchaseRepository, TxRequest,
    TxStatus,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MemoryLedger
// =============================================================================

#[derive(Default)]
struct LedgerState {
    listings: HashMap<ListingId, Listing>,
    purchases: HashMap<PurchaseId, Purchase>,
    fees: HashMap<PurchaseId, Fee>,
}

/// Ledger store backed by hash maps, counting every write it performs.
///
/// Seeding does not count as a write.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    writes: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_listing(&self, listing: Listing) {
        lock(&self.state).listings.insert(listing.id, listing);
    }

    pub fn seed_purchase(&self, purchase: Purchase) {
        lock(&self.state).purchases.insert(purchase.id, purchase);
    }

    pub fn listing(&self, id: ListingId) -> Option<Listing> {
        lock(&self.state).listings.get(&id).cloned()
    }

    pub fn purchase(&self, id: PurchaseId) -> Option<Purchase> {
        lock(&self.state).purchases.get(&id).cloned()
    }

    pub fn fee(&self, purchase_id: PurchaseId) -> Option<Fee> {
        lock(&self.state).fees.get(&purchase_id).cloned()
    }

    pub fn all_listings(&self) -> Vec<Listing> {
        lock(&self.state).listings.values().cloned().collect()
    }

    pub fn all_purchases(&self) -> Vec<Purchase> {
        lock(&self.state).purchases.values().cloned().collect()
    }

    pub fn fee_count(&self) -> usize {
        lock(&self.state).fees.len()
    }

    /// Writes performed through the port traits so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn wrote(&self, n: usize) {
        self.writes.fetch_add(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ListingRepository for MemoryLedger {
    async fn insert_listing(&self, listing: &Listing) -> StorageResult<()> {
        lock(&self.state).listings.insert(listing.id, listing.clone());
        self.wrote(1);
        Ok(())
    }

    async fn get_listing(&self, id: ListingId) -> StorageResult<Option<Listing>> {
        Ok(self.listing(id))
    }

    async fn find_pending_by_tx_hash(&self, tx_hash: &TxHash) -> StorageResult<Option<Listing>> {
        Ok(lock(&self.state)
            .listings
            .values()
            .find(|l| l.status == ListingStatus::Pending && l.tx_hash.as_ref() == Some(tx_hash))
            .cloned())
    }

    async fn list_pending(&self, limit: u32) -> StorageResult<Vec<Listing>> {
        let mut pending: Vec<_> = lock(&self.state)
            .listings
            .values()
            .filter(|l| l.status == ListingStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|l| l.submitted_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn compare_and_set_status(
        &self,
        id: ListingId,
        expected: ListingStatus,
        next: ListingStatus,
        tx_hash: Option<&TxHash>,
        confirmations: Option<u32>,
    ) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        let Some(listing) = state.listings.get_mut(&id) else {
            return Ok(false);
        };
        if listing.status != expected || listing.tx_hash.as_ref() != tx_hash {
            return Ok(false);
        }
        listing.status = next;
        if next != ListingStatus::Pending {
            listing.pending_action = None;
        }
        if confirmations.is_some() {
            listing.confirmations = confirmations;
        }
        listing.updated_at = Utc::now();
        drop(state);
        self.wrote(1);
        Ok(true)
    }

    async fn record_confirmations(
        &self,
        id: ListingId,
        tx_hash: Option<&TxHash>,
        confirmations: u32,
    ) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        let Some(listing) = state.listings.get_mut(&id) else {
            return Ok(false);
        };
        if listing.status != ListingStatus::Pending
            || listing.tx_hash.as_ref() != tx_hash
            || listing.confirmations == Some(confirmations)
        {
            return Ok(false);
        }
        listing.confirmations = Some(confirmations);
        listing.updated_at = Utc::now();
        drop(state);
        self.wrote(1);
        Ok(true)
    }

    async fn rearm(
        &self,
        id: ListingId,
        expected: ListingStatus,
        rearm: &ListingRearm,
    ) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        let Some(listing) = state.listings.get_mut(&id) else {
            return Ok(false);
        };
        if listing.status != expected {
            return Ok(false);
        }
        listing.status = ListingStatus::Pending;
        listing.pending_action = Some(rearm.action);
        listing.tx_hash = Some(rearm.tx_hash.clone());
        listing.confirmations = None;
        listing.price = rearm.price;
        listing.full_price = rearm.full_price;
        listing.metadata = rearm.metadata.clone();
        listing.submitted_at = rearm.submitted_at;
        listing.updated_at = rearm.submitted_at;
        drop(state);
        self.wrote(1);
        Ok(true)
    }
}

#[async_trait]
impl PurchaseRepository for MemoryLedger {
    async fn insert_purchase(&self, purchase: &Purchase) -> StorageResult<()> {
        lock(&self.state).purchases.insert(purchase.id, purchase.clone());
        self.wrote(1);
        Ok(())
    }

    async fn get_purchase(&self, id: PurchaseId) -> StorageResult<Option<Purchase>> {
        Ok(self.purchase(id))
    }

    async fn find_pending_by_tx_hash(
        &self,
        tx_hash: &TxHash,
    ) -> StorageResult<Option<Purchase>> {
        Ok(lock(&self.state)
            .purchases
            .values()
            .find(|p| p.status == PurchaseStatus::Pending && p.tx_hash.as_ref() == Some(tx_hash))
            .cloned())
    }

    async fn list_pending(&self, limit: u32) -> StorageResult<Vec<Purchase>> {
        let mut pending: Vec<_> = lock(&self.state)
            .purchases
            .values()
            .filter(|p| p.status == PurchaseStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.submitted_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn compare_and_set_status(
        &self,
        id: PurchaseId,
        expected: PurchaseStatus,
        next: PurchaseStatus,
        tx_hash: Option<&TxHash>,
    ) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        let Some(purchase) = state.purchases.get_mut(&id) else {
            return Ok(false);
        };
        if purchase.status != expected || purchase.tx_hash.as_ref() != tx_hash {
            return Ok(false);
        }
        purchase.status = next;
        purchase.updated_at = Utc::now();
        drop(state);
        self.wrote(1);
        Ok(true)
    }

    async fn record_confirmations(
        &self,
        id: PurchaseId,
        tx_hash: Option<&TxHash>,
        confirmations: u32,
    ) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        let Some(purchase) = state.purchases.get_mut(&id) else {
            return Ok(false);
        };
        if purchase.status != PurchaseStatus::Pending
            || purchase.tx_hash.as_ref() != tx_hash
            || purchase.confirmations == Some(confirmations)
        {
            return Ok(false);
        }
        purchase.confirmations = Some(confirmations);
        purchase.updated_at = Utc::now();
        drop(state);
        self.wrote(1);
        Ok(true)
    }
}

#[async_trait]
impl FeeRepository for MemoryLedger {
    async fn fee_exists_for(&self, purchase_id: PurchaseId) -> StorageResult<bool> {
        Ok(lock(&self.state).fees.contains_key(&purchase_id))
    }

    async fn insert_fee(&self, fee: &Fee) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        if state.fees.contains_key(&fee.purchase_id) {
            return Ok(false);
        }
        state.fees.insert(fee.purchase_id, fee.clone());
        drop(state);
        self.wrote(1);
        Ok(true)
    }

    async fn get_fee(&self, purchase_id: PurchaseId) -> StorageResult<Option<Fee>> {
        Ok(self.fee(purchase_id))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    fn listings(&self) -> &dyn ListingRepository {
        self
    }

    fn purchases(&self) -> &dyn PurchaseRepository {
        self
    }

    fn fees(&self) -> &dyn FeeRepository {
        self
    }

    async fn complete_purchase_atomic(
        &self,
        completion: &PurchaseCompletion,
    ) -> StorageResult<CompletionOutcome> {
        let mut state = lock(&self.state);
        let Some(purchase) = state.purchases.get_mut(&completion.purchase_id) else {
            return Ok(CompletionOutcome::default());
        };
        if purchase.status != PurchaseStatus::Pending || purchase.tx_hash != completion.tx_hash {
            return Ok(CompletionOutcome::default());
        }
        purchase.status = PurchaseStatus::Completed;
        purchase.confirmations = Some(completion.confirmations);
        purchase.completed_at = Some(completion.completed_at);
        purchase.subscription_expiry = completion.subscription_expiry;
        purchase.updated_at = completion.completed_at;

        let mut outcome = CompletionOutcome {
            transitioned: true,
            fee_recorded: false,
        };
        if let Some(fee) = &completion.fee
            && !state.fees.contains_key(&fee.purchase_id)
        {
            state.fees.insert(fee.purchase_id, fee.clone());
            outcome.fee_recorded = true;
        }
        drop(state);
        self.wrote(1 + usize::from(outcome.fee_recorded));
        Ok(outcome)
    }
}

// =============================================================================
// ScriptedIndexer
// =============================================================================

#[derive(Default)]
struct IndexerState {
    observed: HashMap<String, Vec<ObservedTx>>,
    statuses: HashMap<TxHash, TxStatus>,
    queued: HashMap<TxHash, VecDeque<Result<TxStatus, String>>>,
    rates: HashMap<String, Decimal>,
    rate_errors: HashMap<String, VecDeque<String>>,
    unreachable: bool,
    status_calls: HashMap<TxHash, usize>,
    scan_calls: usize,
    rate_calls: usize,
}

/// Chain indexer answering from scripted state.
///
/// Queued status results are consumed first; after that the last value set
/// with [`ScriptedIndexer::set_status`] is returned, or not-found.
#[derive(Default)]
pub struct ScriptedIndexer {
    state: Mutex<IndexerState>,
}

fn tx(hash: &str) -> TxHash {
    TxHash::new(hash).unwrap_or_else(|e| panic!("fixture hash {hash:?}: {e}"))
}

impl ScriptedIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `tx_hash` as touching `address` in block `block_no`.
    pub fn observe(&self, address: &str, tx_hash: &str, block_no: u64) {
        lock(&self.state)
            .observed
            .entry(address.to_string())
            .or_default()
            .push(ObservedTx {
                tx_hash: tx(tx_hash),
                block_no,
                block_time: Some(Utc::now()),
            });
    }

    pub fn set_status(&self, tx_hash: &str, status: TxStatus) {
        lock(&self.state).statuses.insert(tx(tx_hash), status);
    }

    /// Queue one status lookup result; `Err` becomes a query error.
    pub fn queue_status(&self, tx_hash: &str, result: Result<TxStatus, String>) {
        lock(&self.state)
            .queued
            .entry(tx(tx_hash))
            .or_default()
            .push_back(result);
    }

    pub fn set_rate(&self, currency: &str, rate: Decimal) {
        lock(&self.state).rates.insert(currency.to_string(), rate);
    }

    /// Fail the next oracle lookup for `currency`.
    pub fn queue_rate_error(&self, currency: &str, message: &str) {
        lock(&self.state)
            .rate_errors
            .entry(currency.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    /// Fail every call with a connection error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    pub fn status_calls(&self, tx_hash: &TxHash) -> usize {
        lock(&self.state)
            .status_calls
            .get(tx_hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn scan_calls(&self) -> usize {
        lock(&self.state).scan_calls
    }

    pub fn rate_calls(&self) -> usize {
        lock(&self.state).rate_calls
    }
}

#[async_trait]
impl ChainIndexer for ScriptedIndexer {
    async fn transactions_at(&self, address: &str, limit: u32) -> ChainResult<Vec<ObservedTx>> {
        let mut state = lock(&self.state);
        state.scan_calls += 1;
        if state.unreachable {
            return Err(ChainError::ConnectionFailed("indexer unreachable".into()));
        }
        let mut txs = state.observed.get(address).cloned().unwrap_or_default();
        txs.sort_by(|a, b| b.block_no.cmp(&a.block_no));
        txs.truncate(limit as usize);
        Ok(txs)
    }

    async fn status(&self, tx_hash: &TxHash) -> ChainResult<TxStatus> {
        let mut state = lock(&self.state);
        *state.status_calls.entry(tx_hash.clone()).or_default() += 1;
        if state.unreachable {
            return Err(ChainError::ConnectionFailed("indexer unreachable".into()));
        }
        if let Some(next) = state.queued.get_mut(tx_hash).and_then(VecDeque::pop_front) {
            return next.map_err(ChainError::QueryError);
        }
        Ok(state
            .statuses
            .get(tx_hash)
            .cloned()
            .unwrap_or_else(TxStatus::not_found))
    }

    async fn oracle_rate(&self, currency: &str) -> ChainResult<Option<OracleRate>> {
        let mut state = lock(&self.state);
        state.rate_calls += 1;
        if state.unreachable {
            return Err(ChainError::ConnectionFailed("indexer unreachable".into()));
        }
        if let Some(message) = state
            .rate_errors
            .get_mut(currency)
            .and_then(VecDeque::pop_front)
        {
            return Err(ChainError::Timeout(message));
        }
        Ok(state.rates.get(currency).map(|rate| OracleRate {
            currency: currency.to_string(),
            rate: *rate,
            as_of: Utc::now(),
        }))
    }
}

// =============================================================================
// ScriptedChainClient
// =============================================================================

/// Scripted outcome of one submission.
#[derive(Debug, Clone)]
pub enum ScriptedSubmit {
    Accepted(String),
    Transient(String),
    Rejected(String),
}

/// Chain client replaying queued outcomes.
///
/// With an empty queue every submission is accepted under a fresh hash.
#[derive(Default)]
pub struct ScriptedChainClient {
    queue: Mutex<VecDeque<ScriptedSubmit>>,
    requests: Mutex<Vec<TxRequest>>,
    counter: AtomicUsize,
}

impl ScriptedChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ScriptedSubmit) {
        lock(&self.queue).push_back(outcome);
    }

    /// Every request received, accepted or not.
    pub fn requests(&self) -> Vec<TxRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl ChainClient for ScriptedChainClient {
    async fn submit(&self, request: &TxRequest) -> SubmitResult<TxHash> {
        lock(&self.requests).push(request.clone());
        let next = lock(&self.queue).pop_front();
        match next {
            Some(ScriptedSubmit::Accepted(hash)) => {
                TxHash::new(hash).map_err(|e| SubmitError::Rejected(e.to_string()))
            }
            Some(ScriptedSubmit::Transient(msg)) => Err(SubmitError::Transient(msg)),
            Some(ScriptedSubmit::Rejected(msg)) => Err(SubmitError::Rejected(msg)),
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                TxHash::new(format!("{:064x}", n + 1))
                    .map_err(|e| SubmitError::Rejected(e.to_string()))
            }
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A pending `list` listing priced at 100 USD waiting on `tx_hash`.
pub fn pending_listing(tx_hash: &str, submitted_at: DateTime<Utc>) -> Listing {
    Listing {
        id: ListingId::new(),
        seller: "addr_test1_seller".into(),
        price: Decimal::new(100, 0),
        full_price: None,
        currency: "USD".into(),
        access_type: AccessType::Lifetime,
        status: ListingStatus::Pending,
        pending_action: Some(ListingAction::List),
        tx_hash: Some(tx(tx_hash)),
        confirmations: None,
        metadata: ListingMetadata::new(AssetKind::Agent).with("name", "fixture-agent"),
        created_at: submitted_at,
        submitted_at,
        updated_at: submitted_at,
    }
}

/// A confirmed listing with the given access type.
pub fn confirmed_listing(access_type: AccessType, now: DateTime<Utc>) -> Listing {
    Listing {
        access_type,
        status: ListingStatus::Confirmed,
        pending_action: None,
        confirmations: Some(40),
        ..pending_listing("c0ffee", now)
    }
}

/// A pending purchase of `listing` at its price, waiting on `tx_hash`.
pub fn pending_purchase(listing: &Listing, tx_hash: &str, submitted_at: DateTime<Utc>) -> Purchase {
    Purchase {
        id: PurchaseId::new(),
        buyer: "addr_test1_buyer".into(),
        listing_id: listing.id,
        amount: listing.price,
        currency: listing.currency.clone(),
        status: PurchaseStatus::Pending,
        tx_hash: Some(tx(tx_hash)),
        confirmations: None,
        subscription_expiry: None,
        created_at: submitted_at,
        submitted_at,
        completed_at: None,
        updated_at: submitted_at,
    }
}
