//! Reconciliation services.
//!
//! - [`ReconciliationEngine`] - periodic scan converging pending records
//! - [`ConfirmationTracker`] - per-transaction confirmation loop
//! - [`TransactionSubmitter`] - datum building, price conversion, submission
//! - [`Marketplace`] - seller and buyer actions over the submitter and ledger
//!
//! The engine and the trackers share [`assess`] and [`Settler`], so they
//! reach the same final state whichever of them observes a transaction first.

mod assessment;
mod marketplace;
mod reconciler;
mod settlement;
mod submitter;
mod tracker;

pub use assessment::*;
pub use marketplace::*;
pub use reconciler::*;
pub use settlement::*;
pub use submitter::*;
pub use tracker::*;
