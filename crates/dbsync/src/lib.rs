//! Cardano db-sync adapter for marketsync.
//!
//! This crate implements the [`ChainIndexer`] port from `marketsync-core`
//! on top of a db-sync Postgres database.
//!
//! # Features
//!
//! - Recent transactions touching an address (`tx_out`)
//! - Confirmation depth against the indexed tip (`block`)
//! - Transaction metadata by label (`tx_metadata`) and inline datums (`datum`)
//! - Exchange rates from the unspent oracle output's inline datum
//!
//! # Usage
//!
//! ```ignore
//! use marketsync_dbsync::{DbSyncConfig, DbSyncIndexer};
//! use marketsync_storage::{Database, DatabaseConfig};
//!
//! let db = Database::connect(&DatabaseConfig::for_indexer(&dbsync_url)).await?;
//! let indexer = DbSyncIndexer::new(
//!     db.pool().clone(),
//!     DbSyncConfig { oracle_address: oracle.to_string(), ..Default::default() },
//! );
//!
//! let status = indexer.status(&tx_hash).await?;
//! ```
//!
//! [`ChainIndexer`]: marketsync_core::ports::ChainIndexer

mod client;
mod oracle;

pub use client::{DbSyncConfig, DbSyncIndexer};
pub use oracle::parse_oracle_rates;
