//! Domain models for the off-chain marketplace ledger.
//!
//! These models are storage-agnostic and represent the canonical
//! form of ledger records within the domain layer.

mod datum;

pub use datum::*;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

// =============================================================================
// Identifiers
// =============================================================================

/// Macro to generate UUID-backed record identifiers.
///
/// Generates:
/// - `new()` - Random v4 identifier
/// - `as_uuid()` - Borrow the inner UUID
/// - `Display` and `FromStr` implementations
/// - `From<Uuid>` implementation
macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of a [`Listing`].
    ListingId
);

uuid_newtype!(
    /// Identifier of a [`Purchase`].
    PurchaseId
);

/// Transaction hash as reported by the submitter and the indexer.
///
/// Stored lowercase without a `0x` prefix. Hex validity is only checked
/// when raw bytes are needed (see [`TxHash::to_bytes`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// Normalize and wrap a transaction hash.
    pub fn new(hash: impl AsRef<str>) -> Result<Self, DomainError> {
        let trimmed = hash.as_ref().trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(DomainError::InvalidTxHash("empty hash".into()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidTxHash(hash.as_ref().to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the hash into raw bytes for byte-keyed indexer lookups.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DomainError> {
        hex::decode(&self.0).map_err(|e| DomainError::InvalidTxHash(format!("{}: {}", self.0, e)))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TxHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// =============================================================================
// Record Kinds
// =============================================================================

/// Which ledger table a tracked transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Listing,
    Purchase,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listing => "listing",
            Self::Purchase => "purchase",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reference to a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
    Listing(ListingId),
    Purchase(PurchaseId),
}

impl RecordId {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Listing(_) => RecordKind::Listing,
            Self::Purchase(_) => RecordKind::Purchase,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listing(id) => write!(f, "listing:{}", id),
            Self::Purchase(id) => write!(f, "purchase:{}", id),
        }
    }
}

/// Macro to generate string conversions for snake_case status enums.
macro_rules! status_strings {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DomainError::ValidationError(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// Listings
// =============================================================================

/// Lifecycle state of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    /// A list/edit/cancel transaction is waiting for confirmation.
    Pending,
    /// Published off-chain, no transaction outstanding.
    Active,
    Confirmed,
    Cancelled,
    Failed,
}

status_strings!(ListingStatus {
    Pending => "pending",
    Active => "active",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Failed => "failed",
});

impl ListingStatus {
    /// `cancelled` and `failed` are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed)
    }
}

/// The marketplace action a pending listing transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingAction {
    List,
    Edit,
    Cancel,
}

status_strings!(ListingAction {
    List => "list",
    Edit => "edit",
    Cancel => "cancel",
});

impl ListingAction {
    /// Status a listing reaches once this action's transaction is final.
    pub fn settled_status(&self) -> ListingStatus {
        match self {
            Self::List | Self::Edit => ListingStatus::Confirmed,
            Self::Cancel => ListingStatus::Cancelled,
        }
    }
}

/// How a buyer holds access to a listing after purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Lifetime,
    Ownership,
    Subscription,
}

status_strings!(AccessType {
    Lifetime => "lifetime",
    Ownership => "ownership",
    Subscription => "subscription",
});

/// What kind of asset a listing sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Agent,
    Model,
}

/// Listing content, tagged by asset kind. Everything besides the tag is
/// opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingMetadata {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ListingMetadata {
    pub fn new(kind: AssetKind) -> Self {
        Self {
            kind,
            attributes: serde_json::Map::new(),
        }
    }

    /// Builder-style attribute insertion.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// A sell-side offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    /// Seller address or account reference.
    pub seller: String,
    pub price: Decimal,
    pub full_price: Option<Decimal>,
    /// Currency `price` is quoted in.
    pub currency: String,
    pub access_type: AccessType,
    pub status: ListingStatus,
    /// Action of the outstanding transaction while `Pending`.
    pub pending_action: Option<ListingAction>,
    pub tx_hash: Option<TxHash>,
    pub confirmations: Option<u32>,
    pub metadata: ListingMetadata,
    pub created_at: DateTime<Utc>,
    /// When the current `tx_hash` was submitted.
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Purchases
// =============================================================================

/// Lifecycle state of a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

status_strings!(PurchaseStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
});

impl PurchaseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A buy-side transaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: PurchaseId,
    pub buyer: String,
    pub listing_id: ListingId,
    /// Amount in `currency`, before conversion to the native unit.
    pub amount: Decimal,
    pub currency: String,
    pub status: PurchaseStatus,
    pub tx_hash: Option<TxHash>,
    pub confirmations: Option<u32>,
    /// Only ever set for subscription listings.
    pub subscription_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Fees
// =============================================================================

/// Immutable marketplace fee audit record, one per completed purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub purchase_id: PurchaseId,
    pub fee_amount: Decimal,
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// Tracked Records
// =============================================================================

/// A ledger record that carries a tracked transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerRecord {
    Listing(Listing),
    Purchase(Purchase),
}

impl LedgerRecord {
    pub fn id(&self) -> RecordId {
        match self {
            Self::Listing(l) => RecordId::Listing(l.id),
            Self::Purchase(p) => RecordId::Purchase(p.id),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.id().kind()
    }

    pub fn tx_hash(&self) -> Option<&TxHash> {
        match self {
            Self::Listing(l) => l.tx_hash.as_ref(),
            Self::Purchase(p) => p.tx_hash.as_ref(),
        }
    }

    pub fn confirmations(&self) -> Option<u32> {
        match self {
            Self::Listing(l) => l.confirmations,
            Self::Purchase(p) => p.confirmations,
        }
    }

    pub fn is_pending(&self) -> bool {
        match self {
            Self::Listing(l) => l.status == ListingStatus::Pending,
            Self::Purchase(p) => p.status == PurchaseStatus::Pending,
        }
    }

    /// When the tracked transaction was submitted.
    pub fn submitted_at(&self) -> DateTime<Utc> {
        match self {
            Self::Listing(l) => l.submitted_at,
            Self::Purchase(p) => p.submitted_at,
        }
    }

    /// Status as its storage string, for logs.
    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Listing(l) => l.status.as_str(),
            Self::Purchase(p) => p.status.as_str(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_hash_is_normalized() {
        let hash = TxHash::new(" 0xABCdef ").unwrap();
        assert_eq!(hash.as_str(), "abcdef");
        assert_eq!(hash.to_bytes().unwrap(), vec![0xab, 0xcd, 0xef]);
    }

    #[test]
    fn tx_hash_rejects_empty_and_spaced() {
        assert!(TxHash::new("").is_err());
        assert!(TxHash::new("0x").is_err());
        assert!(TxHash::new("ab cd").is_err());
    }

    // Un hash non-hex est accepté comme identifiant mais pas comme octets
    #[test]
    fn tx_hash_bytes_require_hex() {
        let hash = TxHash::new("abc").unwrap();
        assert!(hash.to_bytes().is_err());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            ListingStatus::Pending,
            ListingStatus::Active,
            ListingStatus::Confirmed,
            ListingStatus::Cancelled,
            ListingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ListingStatus>().unwrap(), status);
        }
        assert!("settled".parse::<PurchaseStatus>().is_err());
    }

    // Test critique: les états terminaux ne sont jamais rouverts
    #[test]
    fn terminal_states() {
        assert!(ListingStatus::Cancelled.is_terminal());
        assert!(ListingStatus::Failed.is_terminal());
        assert!(!ListingStatus::Confirmed.is_terminal());
        assert!(PurchaseStatus::Completed.is_terminal());
        assert!(PurchaseStatus::Refunded.is_terminal());
        assert!(!PurchaseStatus::Pending.is_terminal());
    }

    #[test]
    fn cancel_settles_to_cancelled() {
        assert_eq!(ListingAction::List.settled_status(), ListingStatus::Confirmed);
        assert_eq!(ListingAction::Edit.settled_status(), ListingStatus::Confirmed);
        assert_eq!(ListingAction::Cancel.settled_status(), ListingStatus::Cancelled);
    }

    #[test]
    fn metadata_keeps_type_tag_and_attributes() {
        let metadata = ListingMetadata::new(AssetKind::Model).with("name", "llama-ft");
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["type"], "model");
        assert_eq!(json["name"], "llama-ft");

        let back: ListingMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, metadata);
    }
}
