//! Chain-native datum payloads attached to marketplace transactions.
//!
//! The payload is a versioned, tagged union keyed by `action`. Each variant
//! spells out its required fields so nothing downstream has to trust an
//! opaque JSON blob.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ListingId, ListingMetadata};
use crate::error::{DomainError, DomainResult};

/// Current datum layout version.
pub const DATUM_VERSION: u16 = 1;

/// Versioned datum envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDatum {
    pub version: u16,
    #[serde(flatten)]
    pub body: DatumBody,
}

/// Action-specific datum content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DatumBody {
    List(ListingTerms),
    Edit(ListingTerms),
    Cancel(CancelTerms),
    Buy(PurchaseTerms),
    Subscribe(PurchaseTerms),
}

/// Terms published by a list or edit transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingTerms {
    pub listing_id: ListingId,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_price: Option<Decimal>,
    pub seller: String,
    pub metadata: ListingMetadata,
}

/// Terms of a delist transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTerms {
    pub listing_id: ListingId,
    pub seller: String,
}

/// Terms of a buy or subscribe transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseTerms {
    pub listing_id: ListingId,
    /// Price in the listing's quote currency.
    pub price: Decimal,
    pub seller: String,
    pub buyer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionTerms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTerms {
    pub duration_days: u32,
}

impl MarketDatum {
    /// Wrap a body with the current version and validate it.
    pub fn new(body: DatumBody) -> DomainResult<Self> {
        let datum = Self {
            version: DATUM_VERSION,
            body,
        };
        datum.validate()?;
        Ok(datum)
    }

    /// Decode and validate a datum read back from the chain.
    pub fn decode(value: &serde_json::Value) -> DomainResult<Self> {
        let datum: Self = serde_json::from_value(value.clone())
            .map_err(|e| DomainError::InvalidDatum(e.to_string()))?;
        datum.validate()?;
        Ok(datum)
    }

    pub fn to_json(&self) -> DomainResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| DomainError::InvalidDatum(e.to_string()))
    }

    pub fn listing_id(&self) -> ListingId {
        match &self.body {
            DatumBody::List(t) | DatumBody::Edit(t) => t.listing_id,
            DatumBody::Cancel(t) => t.listing_id,
            DatumBody::Buy(t) | DatumBody::Subscribe(t) => t.listing_id,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match &self.body {
            DatumBody::List(_) => "list",
            DatumBody::Edit(_) => "edit",
            DatumBody::Cancel(_) => "cancel",
            DatumBody::Buy(_) => "buy",
            DatumBody::Subscribe(_) => "subscribe",
        }
    }

    /// Check the per-variant field rules.
    pub fn validate(&self) -> DomainResult<()> {
        if self.version != DATUM_VERSION {
            return Err(DomainError::InvalidDatum(format!(
                "unsupported datum version {} (expected {})",
                self.version, DATUM_VERSION
            )));
        }

        match &self.body {
            DatumBody::List(terms) | DatumBody::Edit(terms) => {
                require_party("seller", &terms.seller)?;
                require_positive("price", terms.price)?;
                if let Some(full_price) = terms.full_price
                    && full_price < terms.price
                {
                    return Err(DomainError::InvalidDatum(format!(
                        "fullPrice {} is below price {}",
                        full_price, terms.price
                    )));
                }
            }
            DatumBody::Cancel(terms) => require_party("seller", &terms.seller)?,
            DatumBody::Buy(terms) => {
                validate_purchase(terms)?;
                if terms.subscription.is_some() {
                    return Err(DomainError::InvalidDatum(
                        "buy datum must not carry subscription terms".into(),
                    ));
                }
            }
            DatumBody::Subscribe(terms) => {
                validate_purchase(terms)?;
                match terms.subscription {
                    Some(sub) if sub.duration_days > 0 => {}
                    Some(_) => {
                        return Err(DomainError::InvalidDatum(
                            "subscription duration must be at least one day".into(),
                        ));
                    }
                    None => {
                        return Err(DomainError::InvalidDatum(
                            "subscribe datum requires subscription terms".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

fn validate_purchase(terms: &PurchaseTerms) -> DomainResult<()> {
    require_party("seller", &terms.seller)?;
    require_party("buyer", &terms.buyer)?;
    require_positive("price", terms.price)?;
    if terms.buyer == terms.seller {
        return Err(DomainError::InvalidDatum(
            "buyer and seller must differ".into(),
        ));
    }
    Ok(())
}

fn require_party(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::InvalidDatum(format!("{} is required", field)));
    }
    Ok(())
}

fn require_positive(field: &str, value: Decimal) -> DomainResult<()> {
    if value <= Decimal::ZERO {
        return Err(DomainError::InvalidDatum(format!(
            "{} must be positive, got {}",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetKind;

    fn listing_terms(price: i64, full_price: Option<i64>) -> ListingTerms {
        ListingTerms {
            listing_id: ListingId::new(),
            price: Decimal::new(price, 0),
            full_price: full_price.map(|p| Decimal::new(p, 0)),
            seller: "addr_seller".into(),
            metadata: ListingMetadata::new(AssetKind::Agent),
        }
    }

    fn purchase_terms(subscription: Option<u32>) -> PurchaseTerms {
        PurchaseTerms {
            listing_id: ListingId::new(),
            price: Decimal::new(100, 0),
            seller: "addr_seller".into(),
            buyer: "addr_buyer".into(),
            subscription: subscription.map(|duration_days| SubscriptionTerms { duration_days }),
        }
    }

    // Test critique: le tag "action" et les champs camelCase sont sur le fil
    #[test]
    fn test_datum_wire_shape() {
        let datum = MarketDatum::new(DatumBody::List(listing_terms(10, Some(12)))).unwrap();
        let json = datum.to_json().unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["action"], "list");
        assert!(json.get("listingId").is_some());
        assert!(json.get("fullPrice").is_some());
        assert_eq!(json["metadata"]["type"], "agent");

        let back = MarketDatum::decode(&json).unwrap();
        assert_eq!(back, datum);
    }

    #[test]
    fn test_full_price_below_price_rejected() {
        let err = MarketDatum::new(DatumBody::Edit(listing_terms(10, Some(5)))).unwrap_err();
        assert!(err.to_string().contains("fullPrice"));
    }

    #[test]
    fn test_non_positive_price_rejected() {
        assert!(MarketDatum::new(DatumBody::List(listing_terms(0, None))).is_err());
    }

    #[test]
    fn test_subscription_terms_per_variant() {
        assert!(MarketDatum::new(DatumBody::Subscribe(purchase_terms(Some(30)))).is_ok());
        assert!(MarketDatum::new(DatumBody::Subscribe(purchase_terms(None))).is_err());
        assert!(MarketDatum::new(DatumBody::Subscribe(purchase_terms(Some(0)))).is_err());
        assert!(MarketDatum::new(DatumBody::Buy(purchase_terms(Some(30)))).is_err());
        assert!(MarketDatum::new(DatumBody::Buy(purchase_terms(None))).is_ok());
    }

    #[test]
    fn test_decode_rejects_unknown_version_and_action() {
        let mut json = MarketDatum::new(DatumBody::Buy(purchase_terms(None)))
            .unwrap()
            .to_json()
            .unwrap();
        json["version"] = serde_json::json!(7);
        assert!(MarketDatum::decode(&json).is_err());

        json["version"] = serde_json::json!(1);
        json["action"] = serde_json::json!("gift");
        assert!(MarketDatum::decode(&json).is_err());
    }

    #[test]
    fn test_self_purchase_rejected() {
        let mut terms = purchase_terms(None);
        terms.buyer = terms.seller.clone();
        assert!(MarketDatum::new(DatumBody::Buy(terms)).is_err());
    }
}
