//! Core domain layer for marketsync.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! reconciliation services that keep the off-chain marketplace ledger in
//! line with the chain. It follows hexagonal architecture principles: this
//! is the innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     marketsync (binary)                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ marketsync-storage │ marketsync-dbsync  │ marketsync-txbuilder │
//! │  (ledger, Postgres)│ (indexer, Postgres)│    (HTTP builder)    │
//! ├────────────────────┴────────────────────┴──────────────────────┤
//! │                marketsync-core  ← YOU ARE HERE                │
//! │         (models, ports, services, retry, metrics)             │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Listings, purchases, fees, transaction hashes, datums
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Engine, tracker, submitter and marketplace actions
//! - [`retry`] - Retry policy shared by submission and tracking
//! - [`error`] - Error types per layer
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Ports
//!
//! - [`ports::ChainIndexer`] - Read transaction depth and oracle rates
//! - [`ports::ChainClient`] - Build, sign and submit transactions
//! - [`ports::LedgerStore`] - Persist listings, purchases and fees
//!
//! # Record Lifecycle
//!
//! 1. An action is submitted; its record is written `pending`
//! 2. Trackers and the engine re-read the transaction's depth
//! 3. At the confirmation threshold the record is settled by compare-and-set
//! 4. Purchases record their fee in the same storage transaction
//! 5. Transactions never seen, or rolled back, fail their record

pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod retry;
pub mod services;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
