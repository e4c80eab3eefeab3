//! Per-transaction confirmation tracking.
//!
//! A tracker follows one submitted transaction until its record leaves
//! `pending`. It runs alongside the reconciliation engine; both settle
//! records through the same [`Settler`], so whichever gets there first wins
//! and the other's compare-and-set becomes a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::ReconcileResult;
use crate::metrics::record_tracker_lookup_error;
use crate::models::{RecordId, RecordKind, TxHash};
use crate::ports::{ChainIndexer, LedgerStore};
use crate::retry::{Attempts, Backoff, RetryPolicy};

use super::assessment::{Assessment, ConfirmationPolicy, FailureReason, assess};
use super::settlement::{Applied, SettlementPolicy, Settler};

/// Configuration for confirmation trackers.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub confirmation: ConfirmationPolicy,
    pub settlement: SettlementPolicy,
    /// Consecutive lookup errors tolerated before failing the record.
    pub retry: RetryPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            confirmation: ConfirmationPolicy::default(),
            settlement: SettlementPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// How tracking of one transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// This tracker settled the record.
    Confirmed,
    /// This tracker failed the record.
    Failed(FailureReason),
    /// Another writer moved the record out of `pending`.
    SettledElsewhere { status: &'static str },
    /// The record now waits on a different transaction.
    Superseded,
    /// The record no longer exists.
    Missing,
    /// Shutdown fired first.
    Cancelled,
}

/// State of one tracked transaction. Held in memory only.
#[derive(Debug, Clone)]
pub struct TrackedHandle {
    pub tx_hash: TxHash,
    pub record_id: RecordId,
    attempts: Attempts,
    seen: bool,
}

impl TrackedHandle {
    pub fn new(tx_hash: TxHash, record_id: RecordId, retry: &RetryPolicy) -> Self {
        Self {
            tx_hash,
            record_id,
            attempts: retry.budget(),
            seen: false,
        }
    }

    /// Consecutive lookup errors since the last success.
    pub fn failures(&self) -> u32 {
        self.attempts.failures()
    }

    /// Whether the indexer has reported the transaction at least once.
    pub fn seen(&self) -> bool {
        self.seen
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Pending,
    Done(TrackOutcome),
}

/// Follows submitted transactions until their records are terminal.
pub struct ConfirmationTracker {
    config: TrackerConfig,
    indexer: Arc<dyn ChainIndexer>,
    store: Arc<dyn LedgerStore>,
    settler: Settler,
}

impl ConfirmationTracker {
    pub fn new(
        config: TrackerConfig,
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

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn handle(&self, tx_hash: TxHash, record_id: RecordId) -> TrackedHandle {
        TrackedHandle::new(tx_hash, record_id, &self.config.retry)
    }

    /// Track `tx_hash` for `record_id` until the record is terminal.
    pub async fn track(&self, tx_hash: TxHash, record_id: RecordId) -> TrackOutcome {
        let (_keep_open, shutdown_rx) = watch::channel(false);
        self.run(self.handle(tx_hash, record_id), shutdown_rx).await
    }

    /// Track in a background task that also stops on shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        tx_hash: TxHash,
        record_id: RecordId,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<TrackOutcome> {
        let span = info_span!("tracker", record = %record_id, tx_hash = %tx_hash);
        let handle = self.handle(tx_hash, record_id);
        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.run(handle, shutdown_rx).await }.instrument(span))
    }

    /// Spawn a tracker for every pending record in the ledger.
    pub async fn resume_pending(
        self: &Arc<Self>,
        limit: u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ReconcileResult<Vec<JoinHandle<TrackOutcome>>> {
        let mut handles = Vec::new();
        for kind in [RecordKind::Listing, RecordKind::Purchase] {
            for record in self.store.list_pending(kind, limit).await? {
                let Some(tx_hash) = record.tx_hash() else {
                    continue;
                };
                handles.push(self.spawn(tx_hash.clone(), record.id(), shutdown_rx.clone()));
            }
        }
        info!(count = handles.len(), "📡 Resumed confirmation trackers");
        Ok(handles)
    }

    async fn run(
        &self,
        mut handle: TrackedHandle,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> TrackOutcome {
        debug!(record = %handle.record_id, tx_hash = %handle.tx_hash, "Tracking transaction");

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(record = %handle.record_id, "Tracker stopped by shutdown");
                        return TrackOutcome::Cancelled;
                    }
                    continue;
                }
            }

            match self.poll(&mut handle).await {
                Ok(Step::Done(outcome)) => {
                    debug!(record = %handle.record_id, ?outcome, "Tracking finished");
                    return outcome;
                }
                Ok(Step::Pending) => {}
                Err(e) => {
                    warn!(record = %handle.record_id, error = %e, "⚠️  Tracker check failed, retrying next interval");
                }
            }
        }
    }

    /// One check of a tracked transaction.
    ///
    /// Ledger errors are returned; indexer errors are counted against the
    /// handle's budget and fail the record once it is exhausted.
    pub async fn poll(&self, handle: &mut TrackedHandle) -> ReconcileResult<Step> {
        let Some(record) = self.store.get_record(handle.record_id).await? else {
            return Ok(Step::Done(TrackOutcome::Missing));
        };
        if !record.is_pending() {
            return Ok(Step::Done(TrackOutcome::SettledElsewhere {
                status: record.status_str(),
            }));
        }
        if record.tx_hash() != Some(&handle.tx_hash) {
            return Ok(Step::Done(TrackOutcome::Superseded));
        }

        let now = Utc::now();
        let assessment = match self.indexer.status(&handle.tx_hash).await {
            Ok(status) => {
                handle.attempts.reset();
                let assessment =
                    assess(&self.config.confirmation, &record, &status, handle.seen, now);
                handle.seen |= status.found;
                assessment
            }
            Err(e) => {
                record_tracker_lookup_error();
                match handle.attempts.record_failure() {
                    Backoff::Retry(_) => {
                        warn!(
                            record = %handle.record_id,
                            failures = handle.attempts.failures(),
                            max_retries = self.config.retry.max_retries,
                            error = %e,
                            "⚠️  Indexer lookup failed"
                        );
                        return Ok(Step::Pending);
                    }
                    Backoff::Exhausted => Assessment::Failed(FailureReason::RetriesExhausted),
                }
            }
        };

        let step = match self.settler.apply(&record, assessment, now).await? {
            Applied::ListingSettled(_) | Applied::PurchaseCompleted { .. } => {
                Step::Done(TrackOutcome::Confirmed)
            }
            Applied::Failed(reason) => Step::Done(TrackOutcome::Failed(reason)),
            Applied::LostRace => {
                let status = self
                    .store
                    .get_record(handle.record_id)
                    .await?
                    .map(|r| r.status_str());
                Step::Done(match status {
                    Some(status) => TrackOutcome::SettledElsewhere { status },
                    None => TrackOutcome::Missing,
                })
            }
            Applied::Refreshed | Applied::Unchanged => Step::Pending,
        };
        Ok(step)
    }
}
