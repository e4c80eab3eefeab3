//! Port trait for the opaque transaction build/sign/submit capability.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::SubmitResult;
use crate::models::{MarketDatum, TxHash};

/// Payment output of a buy or subscribe transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutput {
    pub recipient: String,
    /// Amount in the chain's native unit.
    pub amount: Decimal,
}

/// Everything the external builder needs to produce one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    /// Party whose wallet signs the transaction.
    pub signer: String,
    pub datum: MarketDatum,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentOutput>,
}

/// Port trait for transaction submission.
///
/// Implementations must report transient transport failures as
/// [`crate::error::SubmitError::Transient`] and refusals by the builder or
/// node as [`crate::error::SubmitError::Rejected`].
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn submit(&self, request: &TxRequest) -> SubmitResult<TxHash>;
}
