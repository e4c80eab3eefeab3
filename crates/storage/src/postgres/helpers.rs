//! Shared helper functions for PostgreSQL row conversion.

use std::fmt::Display;
use std::str::FromStr;

use marketsync_core::error::{StorageError, StorageResult};
use marketsync_core::models::TxHash;

/// Parse a text column into a domain enum.
pub fn parse_column<T>(value: &str, field_name: &str) -> StorageResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| {
        StorageError::SerializationError(format!("{} is invalid: {}", field_name, e))
    })
}

/// Parse an optional text column into a domain enum.
pub fn parse_optional_column<T>(value: Option<&str>, field_name: &str) -> StorageResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    value.map(|v| parse_column(v, field_name)).transpose()
}

/// Convert a stored transaction hash.
pub fn tx_hash_from_db(value: Option<String>, field_name: &str) -> StorageResult<Option<TxHash>> {
    value
        .map(|v| {
            TxHash::new(&v).map_err(|e| {
                StorageError::SerializationError(format!("{} is invalid: {}", field_name, e))
            })
        })
        .transpose()
}

/// Convert a stored confirmation count, rejecting negative values.
pub fn confirmations_from_db(value: Option<i32>, field_name: &str) -> StorageResult<Option<u32>> {
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| {
                StorageError::SerializationError(format!(
                    "{} is negative: {}",
                    field_name, v
                ))
            })
        })
        .transpose()
}

/// Convert a confirmation count for binding.
pub fn confirmations_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Map a failed write, surfacing unique and foreign key violations.
pub fn write_error(e: sqlx::Error) -> StorageError {
    if let Some(db_err) = e.as_database_error()
        && (db_err.is_unique_violation() || db_err.is_foreign_key_violation())
    {
        return StorageError::ConstraintViolation(db_err.message().to_string());
    }
    StorageError::QueryError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketsync_core::models::ListingStatus;

    #[test]
    fn test_parse_column_accepts_known_status() {
        let status: ListingStatus = parse_column("cancelled", "listing.status").unwrap();
        assert_eq!(status, ListingStatus::Cancelled);
    }

    // Test critique: erreurs incluent le nom du champ pour debug
    #[test]
    fn test_error_includes_field_name() {
        let err = parse_column::<ListingStatus>("settled", "listing.status")
            .unwrap_err()
            .to_string();
        assert!(err.contains("listing.status"));
        assert!(err.contains("settled"));
    }

    // Test critique: un nombre de confirmations négatif indique une corruption
    #[test]
    fn test_negative_confirmations_are_rejected() {
        assert!(confirmations_from_db(Some(-1), "listing.confirmations").is_err());
        assert_eq!(
            confirmations_from_db(Some(25), "listing.confirmations").unwrap(),
            Some(25)
        );
        assert_eq!(confirmations_from_db(None, "listing.confirmations").unwrap(), None);
    }

    #[test]
    fn test_confirmations_saturate_on_bind() {
        assert_eq!(confirmations_to_db(20), 20);
        assert_eq!(confirmations_to_db(u32::MAX), i32::MAX);
    }

    #[test]
    fn test_stored_hash_is_normalized() {
        let hash = tx_hash_from_db(Some("0xABCD".into()), "listing.tx_hash").unwrap();
        assert_eq!(hash.unwrap().as_str(), "abcd");
        assert!(tx_hash_from_db(Some(" ".into()), "listing.tx_hash").is_err());
    }
}
