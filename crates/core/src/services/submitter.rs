//! Transaction submission for marketplace actions.
//!
//! Maps an action onto a validated datum, converts purchase prices into the
//! chain's native unit through the on-chain oracle, and hands the request to
//! the [`ChainClient`] with transient-failure retries.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use crate::error::{ChainError, DomainError, SubmitError, SubmitResult};
use crate::metrics::record_submission;
use crate::models::{
    CancelTerms, DatumBody, ListingId, ListingMetadata, ListingTerms, MarketDatum, PurchaseTerms,
    SubscriptionTerms, TxHash,
};
use crate::ports::{ChainClient, ChainIndexer, PaymentOutput, TxRequest};
use crate::retry::{RetryPolicy, retry};

/// Default divisor applied to oracle rates.
pub const DEFAULT_SCALING_FACTOR: i64 = 1_000_000;

/// Configuration for the transaction submitter.
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Retries for transient submission and oracle failures.
    pub retry: RetryPolicy,
    /// Currency code of the chain's native unit. Prices in it skip the oracle.
    pub native_currency: String,
    pub scaling_factor: Decimal,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            native_currency: "ADA".into(),
            scaling_factor: Decimal::from(DEFAULT_SCALING_FACTOR),
        }
    }
}

/// Parameters of a list or edit action.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingParams {
    pub listing_id: ListingId,
    pub seller: String,
    pub price: Decimal,
    pub full_price: Option<Decimal>,
    pub metadata: ListingMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelParams {
    pub listing_id: ListingId,
    pub seller: String,
}

/// Parameters of a buy or subscribe action.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseParams {
    pub listing_id: ListingId,
    pub seller: String,
    pub buyer: String,
    /// Price in `currency`.
    pub price: Decimal,
    pub currency: String,
}

/// A marketplace action to put on chain.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketAction {
    List(ListingParams),
    Edit(ListingParams),
    Cancel(CancelParams),
    Buy(PurchaseParams),
    Subscribe {
        purchase: PurchaseParams,
        duration_days: u32,
    },
}

impl MarketAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Edit(_) => "edit",
            Self::Cancel(_) => "cancel",
            Self::Buy(_) => "buy",
            Self::Subscribe { .. } => "subscribe",
        }
    }

    /// Party that signs the transaction.
    pub fn signer(&self) -> &str {
        match self {
            Self::List(p) | Self::Edit(p) => &p.seller,
            Self::Cancel(p) => &p.seller,
            Self::Buy(p) | Self::Subscribe { purchase: p, .. } => &p.buyer,
        }
    }

    /// Build the validated datum for this action.
    pub fn datum(&self) -> Result<MarketDatum, DomainError> {
        let body = match self {
            Self::List(p) => DatumBody::List(listing_terms(p)),
            Self::Edit(p) => DatumBody::Edit(listing_terms(p)),
            Self::Cancel(p) => DatumBody::Cancel(CancelTerms {
                listing_id: p.listing_id,
                seller: p.seller.clone(),
            }),
            Self::Buy(p) => DatumBody::Buy(purchase_terms(p, None)),
            Self::Subscribe {
                purchase,
                duration_days,
            } => DatumBody::Subscribe(purchase_terms(
                purchase,
                Some(SubscriptionTerms {
                    duration_days: *duration_days,
                }),
            )),
        };
        MarketDatum::new(body)
    }

    fn purchase(&self) -> Option<&PurchaseParams> {
        match self {
            Self::Buy(p) | Self::Subscribe { purchase: p, .. } => Some(p),
            _ => None,
        }
    }
}

fn listing_terms(p: &ListingParams) -> ListingTerms {
    ListingTerms {
        listing_id: p.listing_id,
        price: p.price,
        full_price: p.full_price,
        seller: p.seller.clone(),
        metadata: p.metadata.clone(),
    }
}

fn purchase_terms(p: &PurchaseParams, subscription: Option<SubscriptionTerms>) -> PurchaseTerms {
    PurchaseTerms {
        listing_id: p.listing_id,
        price: p.price,
        seller: p.seller.clone(),
        buyer: p.buyer.clone(),
        subscription,
    }
}

/// A transaction accepted by the chain client.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub tx_hash: TxHash,
    pub datum: MarketDatum,
    pub payment: Option<PaymentOutput>,
}

/// Convert `amount` with an oracle `rate`: `amount × rate / scaling_factor`.
pub fn convert_amount(
    amount: Decimal,
    rate: Decimal,
    scaling_factor: Decimal,
) -> Result<Decimal, DomainError> {
    if scaling_factor <= Decimal::ZERO {
        return Err(DomainError::ValidationError(format!(
            "scaling factor must be positive, got {}",
            scaling_factor
        )));
    }
    amount
        .checked_mul(rate)
        .and_then(|scaled| scaled.checked_div(scaling_factor))
        .ok_or_else(|| {
            DomainError::ValidationError(format!(
                "conversion of {} at rate {} overflows",
                amount, rate
            ))
        })
}

/// Submits marketplace actions as chain transactions.
pub struct TransactionSubmitter {
    config: SubmitterConfig,
    client: Arc<dyn ChainClient>,
    indexer: Arc<dyn ChainIndexer>,
}

impl TransactionSubmitter {
    pub fn new(
        config: SubmitterConfig,
        client: Arc<dyn ChainClient>,
        indexer: Arc<dyn ChainIndexer>,
    ) -> Self {
        Self {
            config,
            client,
            indexer,
        }
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    /// Build, validate and submit `action`.
    ///
    /// Transient failures are retried under the configured policy; a
    /// rejection surfaces immediately.
    #[instrument(skip_all, fields(action = action.name()))]
    pub async fn submit(&self, action: &MarketAction) -> SubmitResult<Submission> {
        let result = self.try_submit(action).await;
        let outcome = match &result {
            Ok(_) => "submitted",
            Err(SubmitError::Rejected(_)) => "rejected",
            Err(SubmitError::NoExchangeRate(_)) => "no_rate",
            Err(SubmitError::InvalidAction(_)) => "invalid",
            Err(_) => "error",
        };
        record_submission(action.name(), outcome);
        result
    }

    async fn try_submit(&self, action: &MarketAction) -> SubmitResult<Submission> {
        let datum = action.datum()?;

        let payment = match action.purchase() {
            Some(purchase) => Some(PaymentOutput {
                recipient: purchase.seller.clone(),
                amount: self.native_amount(purchase.price, &purchase.currency).await?,
            }),
            None => None,
        };

        let request = TxRequest {
            signer: action.signer().to_string(),
            datum,
            payment,
        };

        let tx_hash = retry(
            &self.config.retry,
            "submit",
            SubmitError::is_transient,
            || self.client.submit(&request),
        )
        .await
        .inspect_err(|e| warn!(error = %e, "❌ Submission failed"))?;

        info!(
            tx_hash = %tx_hash,
            listing = %request.datum.listing_id(),
            "📤 Transaction submitted"
        );

        Ok(Submission {
            tx_hash,
            datum: request.datum,
            payment: request.payment,
        })
    }

    /// Price of `amount` in the native unit.
    ///
    /// Fails closed with [`SubmitError::NoExchangeRate`] when the oracle has
    /// no entry for `currency`.
    pub async fn native_amount(&self, amount: Decimal, currency: &str) -> SubmitResult<Decimal> {
        if currency.eq_ignore_ascii_case(&self.config.native_currency) {
            return Ok(amount);
        }

        let rate = retry(
            &self.config.retry,
            "oracle_rate",
            |_: &ChainError| true,
            || self.indexer.oracle_rate(currency),
        )
        .await?
        .ok_or_else(|| SubmitError::NoExchangeRate(currency.to_string()))?;

        let converted = convert_amount(amount, rate.rate, self.config.scaling_factor)?;
        debug!(
            %amount,
            currency,
            rate = %rate.rate,
            %converted,
            "Converted price with oracle rate"
        );
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetKind;
    use crate::testing::{ScriptedChainClient, ScriptedIndexer, ScriptedSubmit};
    use std::time::Duration;

    fn setup() -> (Arc<ScriptedChainClient>, Arc<ScriptedIndexer>, TransactionSubmitter) {
        let client = Arc::new(ScriptedChainClient::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let submitter = TransactionSubmitter::new(
            SubmitterConfig {
                retry: RetryPolicy::fixed(3, Duration::from_secs(2)),
                ..Default::default()
            },
            client.clone(),
            indexer.clone(),
        );
        (client, indexer, submitter)
    }

    fn buy(price: i64, currency: &str) -> MarketAction {
        MarketAction::Buy(PurchaseParams {
            listing_id: ListingId::new(),
            seller: "addr_seller".into(),
            buyer: "addr_buyer".into(),
            price: Decimal::new(price, 0),
            currency: currency.into(),
        })
    }

    fn list(price: i64) -> MarketAction {
        MarketAction::List(ListingParams {
            listing_id: ListingId::new(),
            seller: "addr_seller".into(),
            price: Decimal::new(price, 0),
            full_price: None,
            metadata: ListingMetadata::new(AssetKind::Model),
        })
    }

    #[test]
    fn test_convert_amount() {
        let converted =
            convert_amount(Decimal::new(100, 0), Decimal::new(5, 1), Decimal::from(1_000_000))
                .unwrap();
        assert_eq!(converted, Decimal::new(5, 5));
        assert!(convert_amount(Decimal::ONE, Decimal::ONE, Decimal::ZERO).is_err());
    }

    // Test critique: 100 USD au taux 0.5, facteur 1_000_000
    #[tokio::test]
    async fn test_buy_converts_price_with_oracle_rate() {
        let (client, indexer, submitter) = setup();
        indexer.set_rate("USD", Decimal::new(5, 1));

        let submission = submitter.submit(&buy(100, "USD")).await.unwrap();

        let payment = submission.payment.unwrap();
        assert_eq!(payment.amount, Decimal::new(100, 0) * Decimal::new(5, 1) / Decimal::from(1_000_000));
        assert_eq!(payment.recipient, "addr_seller");
        assert_eq!(client.requests()[0].signer, "addr_buyer");
        assert_eq!(submission.datum.action_name(), "buy");
    }

    #[tokio::test]
    async fn test_missing_rate_fails_closed() {
        let (client, _indexer, submitter) = setup();

        let err = submitter.submit(&buy(100, "USD")).await.unwrap_err();

        assert!(matches!(err, SubmitError::NoExchangeRate(ref c) if c == "USD"));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_native_price_skips_oracle() {
        let (_client, indexer, submitter) = setup();

        let submission = submitter.submit(&buy(7, "ada")).await.unwrap();

        assert_eq!(submission.payment.unwrap().amount, Decimal::new(7, 0));
        assert_eq!(indexer.rate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_oracle_errors_are_retried() {
        let (_client, indexer, submitter) = setup();
        indexer.set_rate("EUR", Decimal::new(2, 0));
        indexer.queue_rate_error("EUR", "oracle utxo busy");

        let amount = submitter.native_amount(Decimal::new(3, 0), "EUR").await.unwrap();

        assert_eq!(amount, Decimal::new(6, 6));
        assert_eq!(indexer.rate_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_submission_errors_are_retried() {
        let (client, _indexer, submitter) = setup();
        client.push(ScriptedSubmit::Transient("502".into()));
        client.push(ScriptedSubmit::Transient("502".into()));
        client.push(ScriptedSubmit::Accepted("abcd".into()));

        let submission = submitter.submit(&list(10)).await.unwrap();

        assert_eq!(submission.tx_hash.as_str(), "abcd");
        assert_eq!(client.calls(), 3);
        assert!(submission.payment.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_budget() {
        let (client, _indexer, submitter) = setup();
        for _ in 0..4 {
            client.push(ScriptedSubmit::Transient("node down".into()));
        }

        let err = submitter.submit(&list(10)).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(client.calls(), 4);
    }

    // Test critique: un rejet n'est jamais rejoué
    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (client, _indexer, submitter) = setup();
        client.push(ScriptedSubmit::Rejected("BadInputsUTxO".into()));

        let err = submitter.submit(&list(10)).await.unwrap_err();

        assert!(matches!(err, SubmitError::Rejected(_)));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_datum_is_never_sent() {
        let (client, _indexer, submitter) = setup();

        let err = submitter.submit(&list(0)).await.unwrap_err();

        assert!(matches!(err, SubmitError::InvalidAction(_)));
        assert_eq!(client.calls(), 0);
    }

    #[test]
    fn test_subscribe_datum_carries_duration() {
        let action = MarketAction::Subscribe {
            purchase: PurchaseParams {
                listing_id: ListingId::new(),
                seller: "addr_seller".into(),
                buyer: "addr_buyer".into(),
                price: Decimal::new(12, 0),
                currency: "ADA".into(),
            },
            duration_days: 30,
        };

        let datum = action.datum().unwrap();
        let json = datum.to_json().unwrap();
        assert_eq!(json["action"], "subscribe");
        assert_eq!(json["subscription"]["durationDays"], 30);
        assert_eq!(action.signer(), "addr_buyer");
    }
}
