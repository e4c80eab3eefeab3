//! Error types for the reconciliation domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`DomainError`] - Business rule and payload validation errors
//! - [`StorageError`] - Ledger database errors
//! - [`ChainError`] - Chain indexer errors
//! - [`SubmitError`] - Transaction submission errors
//! - [`ReconcileError`] - Top-level orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

use crate::models::{RecordId, TxHash};

// =============================================================================
// Domain Errors
// =============================================================================

/// Business logic and domain rule violations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Listing was not found in the ledger.
    #[error("Listing not found: {0}")]
    ListingNotFound(String),

    /// Transaction hash failed validation.
    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),

    /// Datum payload could not be built or decoded.
    #[error("Invalid datum: {0}")]
    InvalidDatum(String),

    /// A record is not in the state the operation requires.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic validation error.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Database constraint was violated (unique, foreign key, etc.).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// =============================================================================
// Chain Errors
// =============================================================================

/// Chain indexer connectivity and query errors.
///
/// Every variant is treated as transient by the services: a failed lookup
/// never mutates persisted state on its own.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Indexer database connection failed.
    #[error("Indexer connection failed: {0}")]
    ConnectionFailed(String),

    /// Indexer query failed.
    #[error("Indexer query error: {0}")]
    QueryError(String),

    /// Indexer returned data that could not be decoded.
    #[error("Indexer decoding error: {0}")]
    DecodingError(String),

    /// Lookup did not complete in time.
    #[error("Indexer timeout: {0}")]
    Timeout(String),
}

// =============================================================================
// Submission Errors
// =============================================================================

/// Errors surfaced by the transaction submission path.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Node provider or builder hiccup; safe to retry.
    #[error("Transient submission failure: {0}")]
    Transient(String),

    /// The transaction was refused (malformed, insufficient funds,
    /// double-spend). Never retried.
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// No oracle entry exists for the requested settlement currency.
    #[error("No exchange rate available for currency {0}")]
    NoExchangeRate(String),

    /// The action failed validation before anything was sent.
    #[error("Invalid action: {0}")]
    InvalidAction(#[from] DomainError),

    /// The oracle lookup kept failing.
    #[error("Oracle lookup failed: {0}")]
    Oracle(#[from] ChainError),
}

impl SubmitError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// =============================================================================
// Reconcile Errors
// =============================================================================

/// Top-level reconciliation and tracking errors.
///
/// This is the error type returned by [`crate::services::ReconciliationEngine`]
/// and [`crate::services::ConfirmationTracker`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Domain logic error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Storage/database error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chain indexer error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Submission error.
    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    /// A transaction was accepted on-chain but the ledger could not take it.
    ///
    /// Carries the hash so the caller can reconcile the record.
    #[error("Transaction {tx_hash} for {record} accepted but not recorded: {reason}")]
    Unrecorded {
        record: RecordId,
        tx_hash: TxHash,
        reason: String,
    },

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error type for control flow.
    #[error("Shutdown requested")]
    ShutdownRequested,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for chain indexer operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for submission operations.
pub type SubmitResult<T> = Result<T, SubmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    // Test critique: la chaîne de conversion d'erreurs fonctionne
    // Permet d'utiliser ? à travers les couches
    #[test]
    fn test_error_conversion_chain() {
        // Storage -> Reconcile
        let storage_err = StorageError::QueryError("db failed".into());
        let err: ReconcileError = storage_err.into();
        assert!(err.to_string().contains("db failed"));

        // Domain -> Submit -> Reconcile
        let domain_err = DomainError::InvalidDatum("missing seller".into());
        let err: ReconcileError = SubmitError::from(domain_err).into();
        assert!(err.to_string().contains("missing seller"));

        // Chain -> Submit -> Reconcile
        let chain_err = ChainError::QueryError("indexer down".into());
        let submit_err: SubmitError = chain_err.into();
        let err: ReconcileError = submit_err.into();
        assert!(err.to_string().contains("indexer down"));
    }

    // Seules les erreurs transitoires sont rejouées
    #[test]
    fn test_only_transient_submissions_are_retryable() {
        assert!(SubmitError::Transient("502".into()).is_transient());
        assert!(!SubmitError::Rejected("double spend".into()).is_transient());
        assert!(!SubmitError::NoExchangeRate("USD".into()).is_transient());
    }

    #[test]
    fn test_no_exchange_rate_names_currency() {
        let msg = SubmitError::NoExchangeRate("EUR".into()).to_string();
        assert!(msg.contains("EUR"));
    }

    #[test]
    fn test_unrecorded_transaction_names_hash() {
        let err = ReconcileError::Unrecorded {
            record: RecordId::Listing(crate::models::ListingId::new()),
            tx_hash: TxHash::new("e0e0").unwrap(),
            reason: "listing changed during cancel".into(),
        };
        assert!(err.to_string().contains("e0e0"));
    }
}
