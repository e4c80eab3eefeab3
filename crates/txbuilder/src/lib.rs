//! Transaction builder adapter for marketsync.
//!
//! This crate implements the [`ChainClient`] port from `marketsync-core`
//! against an HTTP service that builds, signs and submits transactions.
//! Keys never reach this process.
//!
//! # Usage
//!
//! ```ignore
//! use marketsync_txbuilder::{TxBuilderClient, TxBuilderConfig};
//!
//! let client = TxBuilderClient::new(TxBuilderConfig {
//!     base_url: "http://localhost:8090".to_string(),
//!     ..Default::default()
//! })?;
//! let tx_hash = client.submit(&request).await?;
//! ```
//!
//! [`ChainClient`]: marketsync_core::ports::ChainClient

mod client;

pub use client::{TxBuilderClient, TxBuilderConfig};
