//! Storage layer for marketsync.
//!
//! This crate provides PostgreSQL implementations of the ledger traits
//! defined in `marketsync-core`. It handles all database interactions
//! including connection pooling, migrations, and conditional writes.
//!
//! # Architecture
//!
//! The storage layer follows the repository pattern:
//!
//! - [`postgres::Database`] - Connection pool management
//! - [`postgres::PgLedgerStore`] - Composite store for listings, purchases and fees
//!
//! Every status change is an `UPDATE ... WHERE status = <expected>`, so a
//! writer that lost the race sees zero affected rows instead of an error.
//!
//! # Usage
//!
//! ```ignore
//! use marketsync_storage::{Database, DatabaseConfig, PgLedgerStore};
//!
//! let db = Database::connect(&DatabaseConfig::for_ledger(&database_url)).await?;
//! db.migrate().await?;
//!
//! let store = Arc::new(PgLedgerStore::new(Arc::new(db)));
//! ```

pub mod postgres;

pub use postgres::{Database, DatabaseConfig, PgLedgerStore};
