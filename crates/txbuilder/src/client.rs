//! HTTP client for the transaction building and signing service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use marketsync_core::error::{SubmitError, SubmitResult};
use marketsync_core::models::TxHash;
use marketsync_core::ports::{ChainClient, TxRequest};

/// Configuration for the builder client.
#[derive(Debug, Clone)]
pub struct TxBuilderConfig {
    /// Base URL of the builder service (e.g., "http://localhost:8090").
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Bearer token sent with every request.
    pub api_key: Option<String>,
}

impl Default for TxBuilderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            timeout: Duration::from_secs(30),
            api_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    tx_hash: String,
}

/// Builder adapter implementing the ChainClient port.
///
/// The service builds, signs and submits the transaction; this client only
/// classifies its answer. 4xx is a rejection, except 408 and 429; 5xx and
/// transport failures are transient.
pub struct TxBuilderClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl TxBuilderClient {
    pub fn new(config: TxBuilderConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: transactions_endpoint(&config.base_url),
            api_key: config.api_key,
        })
    }
}

#[async_trait]
impl ChainClient for TxBuilderClient {
    #[instrument(skip_all, fields(action = request.datum.action_name()))]
    async fn submit(&self, request: &TxRequest) -> SubmitResult<TxHash> {
        debug!(endpoint = %self.endpoint, "Sending transaction to builder");

        let mut call = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call
            .send()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string());
        interpret(status, body)
    }
}

/// Turn the builder's status and body into a submission result.
///
/// Once the builder answered 2xx the transaction may already be on its way,
/// so every failure past that point is a rejection and never retried.
fn interpret(status: StatusCode, body: Result<String, String>) -> SubmitResult<TxHash> {
    if !status.is_success() {
        return Err(match body {
            Ok(body) => classify(status, &body),
            Err(e) => classify(status, &e),
        });
    }

    let body = body
        .map_err(|e| SubmitError::Rejected(format!("unreadable builder response: {}", e)))?;
    let parsed: SubmitResponse = serde_json::from_str(&body)
        .map_err(|e| SubmitError::Rejected(format!("unreadable builder response: {}", e)))?;
    TxHash::new(&parsed.tx_hash).map_err(|e| SubmitError::Rejected(e.to_string()))
}

fn transactions_endpoint(base_url: &str) -> String {
    format!("{}/transactions", base_url.trim_end_matches('/'))
}

/// Classify a non-success builder response.
fn classify(status: StatusCode, body: &str) -> SubmitError {
    let message = format!("HTTP {} - {}", status.as_u16(), error_message(body));
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SubmitError::Transient(message)
        }
        s if s.is_client_error() => SubmitError::Rejected(message),
        _ => SubmitError::Transient(message),
    }
}

/// Pull `error` or `message` out of a JSON error body, else the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
