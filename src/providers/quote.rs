// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Quote & swap provider client.
//!
//! The provider is a black box with three calls: quote a settlement (returns
//! a deposit address), report the status of a deposit address, and prepare
//! a same-chain swap transaction for a companion wallet to sign.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::blockchain::PreparedTransaction;
use crate::error::SettlementError;
use crate::storage::TokenRef;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider configuration missing: {0}")]
    MissingConfig(String),

    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Provider response was invalid: {0}")]
    InvalidResponse(String),
}

impl From<ProviderError> for SettlementError {
    fn from(err: ProviderError) -> Self {
        match &err {
            ProviderError::Request(_) | ProviderError::InvalidResponse(_) => {
                SettlementError::Transient(err.to_string())
            }
            ProviderError::Status { status, .. }
                if *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16() =>
            {
                SettlementError::Transient(err.to_string())
            }
            ProviderError::Status { .. } | ProviderError::MissingConfig(_) => {
                SettlementError::ExecutionFailed(err.to_string())
            }
        }
    }
}

/// Exact-output settlement quote request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    /// Idempotency reference (the claim id).
    pub reference: String,
    pub origin_chain: String,
    pub origin_asset: String,
    pub destination_chain: String,
    pub destination_asset: String,
    /// Amount the recipient receives, in destination smallest units.
    pub amount_out: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_to: Option<String>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub quote_id: String,
    pub deposit_address: String,
    #[serde(default)]
    pub deposit_memo: Option<String>,
    pub deadline: DateTime<Utc>,
    #[serde(default, rename = "timeEstimate")]
    pub estimated_duration_secs: Option<u64>,
    /// Amount the payer must deposit, in origin smallest units.
    #[serde(default)]
    pub amount_in: Option<String>,
}

/// Status body as returned by the provider, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatusResponse {
    pub status: String,
    pub deposited_amount: Option<String>,
    pub expected_amount: Option<String>,
    pub settlement_tx_hash: Option<String>,
    pub payload: Value,
}

impl RawStatusResponse {
    /// Extract the fields the engine uses; the full body is kept as `payload`.
    pub fn from_json(payload: Value) -> Result<Self, ProviderError> {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidResponse("missing status".to_string()))?
            .to_string();

        let text = |pointers: &[&str]| {
            pointers.iter().find_map(|p| {
                payload.pointer(p).and_then(|v| match v {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
            })
        };

        Ok(Self {
            deposited_amount: text(&["/swapDetails/depositedAmount", "/depositedAmount"]),
            expected_amount: text(&[
                "/swapDetails/expectedAmount",
                "/expectedAmount",
                "/quoteResponse/quote/amountIn",
            ]),
            settlement_tx_hash: text(&[
                "/swapDetails/destinationChainTxHashes/0/hash",
                "/settlementTxHash",
            ]),
            status,
            payload,
        })
    }
}

/// Same-chain swap for a companion wallet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest {
    pub chain_id: u64,
    pub from_token: TokenRef,
    pub to_token: TokenRef,
    pub amount_in: String,
    pub min_amount_out: String,
    /// Ephemeral address that signs the swap.
    pub sender: String,
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedSwap {
    /// Allowance transaction required before `swap`, for ERC-20 inputs.
    #[serde(default)]
    pub approval: Option<PreparedTransaction>,
    pub swap: PreparedTransaction,
}

#[async_trait]
pub trait QuoteSwapProvider: Send + Sync {
    async fn request_quote(&self, request: &QuoteRequest) -> Result<Quote, ProviderError>;

    async fn fetch_status(
        &self,
        deposit_address: &str,
        deposit_memo: Option<&str>,
    ) -> Result<RawStatusResponse, ProviderError>;

    async fn prepare_swap(&self, request: &SwapRequest) -> Result<PreparedSwap, ProviderError>;
}

/// JSON-over-HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpQuoteProvider {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl HttpQuoteProvider {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Result<Self, ProviderError> {
        let base_url = base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ProviderError::MissingConfig("QUOTE_PROVIDER_URL".to_string()))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            api_key,
            http,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ProviderError> {
        let request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("GET {path} failed: {e}")))?;
        Self::read_json(path, response).await
    }

    async fn post_json(&self, path: &str, payload: &Value) -> Result<Value, ProviderError> {
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(payload);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("POST {path} failed: {e}")))?;
        Self::read_json(path, response).await
    }

    async fn read_json(path: &str, response: reqwest::Response) -> Result<Value, ProviderError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("{path} invalid JSON: {e}")))
    }
}

#[async_trait]
impl QuoteSwapProvider for HttpQuoteProvider {
    async fn request_quote(&self, request: &QuoteRequest) -> Result<Quote, ProviderError> {
        let payload = json!({
            "swapType": "EXACT_OUTPUT",
            "dry": false,
            "request": request,
        });
        let response = self.post_json("/v0/quote", &payload).await?;
        let quote = response.get("quote").cloned().unwrap_or(response);
        serde_json::from_value(quote)
            .map_err(|e| ProviderError::InvalidResponse(format!("quote: {e}")))
    }

    async fn fetch_status(
        &self,
        deposit_address: &str,
        deposit_memo: Option<&str>,
    ) -> Result<RawStatusResponse, ProviderError> {
        let mut query = vec![("depositAddress", deposit_address)];
        if let Some(memo) = deposit_memo {
            query.push(("depositMemo", memo));
        }
        let response = self.get_json("/v0/status", &query).await?;
        RawStatusResponse::from_json(response)
    }

    async fn prepare_swap(&self, request: &SwapRequest) -> Result<PreparedSwap, ProviderError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| ProviderError::InvalidResponse(format!("serialize swap: {e}")))?;
        let response = self.post_json("/v0/swap/prepare", &payload).await?;
        serde_json::from_value(response)
            .map_err(|e| ProviderError::InvalidResponse(format!("prepared swap: {e}")))
    }
}
