//! Confirmation assessment shared by the engine and the trackers.
//!
//! Given a pending record and the indexer's view of its transaction, decide
//! what should happen to the record. Pure: no I/O, no clock reads.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::LedgerRecord;
use crate::ports::TxStatus;

/// Default confirmation depth treated as final (~10 minutes of blocks).
pub const DEFAULT_CONFIRMATION_THRESHOLD: u32 = 20;

/// When a transaction counts as final, and how long it may stay unseen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Minimum depth for `pending -> confirmed/completed`.
    pub threshold: u32,
    /// Lookback window after submission. A transaction still unseen past it
    /// fails its record.
    pub max_age: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIRMATION_THRESHOLD,
            max_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Why a pending record was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Never showed up within the lookback window.
    NeverObserved,
    /// Was seen, then disappeared from the indexer.
    RolledBack,
    /// Too many consecutive lookup errors.
    RetriesExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeverObserved => "never_observed",
            Self::RolledBack => "rolled_back",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// What should happen to a pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Deep enough: settle the record.
    Confirmed { confirmations: u32 },
    /// Seen but shallow, with a depth different from the stored one.
    Progress { confirmations: u32 },
    Failed(FailureReason),
    /// Nothing to write.
    Unchanged,
}

/// Assess `record` against `status`.
///
/// `seen_before` carries in-memory evidence that the transaction was found
/// earlier (trackers keep it); a stored confirmation count counts as
/// evidence too.
pub fn assess(
    policy: &ConfirmationPolicy,
    record: &LedgerRecord,
    status: &TxStatus,
    seen_before: bool,
    now: DateTime<Utc>,
) -> Assessment {
    if status.found {
        let confirmations = status.confirmations;
        if confirmations >= policy.threshold {
            return Assessment::Confirmed { confirmations };
        }
        if record.confirmations() == Some(confirmations) {
            return Assessment::Unchanged;
        }
        return Assessment::Progress { confirmations };
    }

    if seen_before || record.confirmations().is_some() {
        return Assessment::Failed(FailureReason::RolledBack);
    }

    let age = now
        .signed_duration_since(record.submitted_at())
        .to_std()
        .unwrap_or_default();
    if age >= policy.max_age {
        Assessment::Failed(FailureReason::NeverObserved)
    } else {
        Assessment::Unchanged
    }
}
