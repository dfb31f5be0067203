// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Settlement status normalization.
//!
//! Provider statuses are free-form strings. Every string heuristic lives in
//! [`normalize`]; the rest of the engine only sees [`NormalizedStatus`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::quote::{QuoteSwapProvider, RawStatusResponse};
use crate::error::SettlementResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizedStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl NormalizedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NormalizedStatus::Pending => "PENDING",
            NormalizedStatus::Processing => "PROCESSING",
            NormalizedStatus::Complete => "COMPLETE",
            NormalizedStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_positive_amount(value: Option<&str>) -> bool {
    value
        .map(str::trim)
        .and_then(|v| v.parse::<rust_decimal::Decimal>().ok())
        .is_some_and(|amount| amount > rust_decimal::Decimal::ZERO)
}

/// Map a raw provider response to the internal vocabulary.
pub fn normalize(raw: &RawStatusResponse) -> NormalizedStatus {
    match raw.status.trim().to_ascii_uppercase().as_str() {
        "PENDING_DEPOSIT" | "PENDING" => NormalizedStatus::Pending,
        "KNOWN_DEPOSIT_TX" | "PROCESSING" => NormalizedStatus::Processing,
        "SUCCESS" | "COMPLETE" | "COMPLETED" => NormalizedStatus::Complete,
        "REFUNDED" | "FAILED" => NormalizedStatus::Failed,
        // Provider reports an incomplete deposit while already holding funds
        // and quoting no expected amount; the deposit is still being matched.
        "INCOMPLETE_DEPOSIT"
            if is_positive_amount(raw.deposited_amount.as_deref())
                && raw.expected_amount.is_none() =>
        {
            NormalizedStatus::Processing
        }
        "INCOMPLETE_DEPOSIT" => NormalizedStatus::Failed,
        other => {
            warn!(status = %other, "Unknown provider status, treating as pending");
            NormalizedStatus::Pending
        }
    }
}

/// One normalized poll result.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: NormalizedStatus,
    pub deposited_amount: Option<String>,
    pub settlement_tx_hash: Option<String>,
    pub payload: Value,
}

impl StatusSnapshot {
    pub fn is_complete(&self) -> bool {
        self.status == NormalizedStatus::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.status == NormalizedStatus::Failed
    }
}

impl From<RawStatusResponse> for StatusSnapshot {
    fn from(raw: RawStatusResponse) -> Self {
        Self {
            status: normalize(&raw),
            deposited_amount: raw.deposited_amount,
            settlement_tx_hash: raw.settlement_tx_hash,
            payload: raw.payload,
        }
    }
}

/// Polls the provider by deposit address and normalizes the answer.
///
/// Network and timeout failures surface as `ErrorKind::Transient`; callers
/// keep the previous state when they see one.
#[derive(Clone)]
pub struct StatusAdapter {
    provider: Arc<dyn QuoteSwapProvider>,
}

impl StatusAdapter {
    pub fn new(provider: Arc<dyn QuoteSwapProvider>) -> Self {
        Self { provider }
    }

    pub async fn poll(
        &self,
        deposit_address: &str,
        deposit_memo: Option<&str>,
    ) -> SettlementResult<StatusSnapshot> {
        let raw = self
            .provider
            .fetch_status(deposit_address, deposit_memo)
            .await?;
        let snapshot = StatusSnapshot::from(raw);
        debug!(
            deposit_address = %deposit_address,
            status = %snapshot.status,
            "Polled settlement status"
        );
        Ok(snapshot)
    }
}
