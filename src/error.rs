// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::storage::{StorageError, WorkDbError};

// =============================================================================
// Domain errors
// =============================================================================

/// Coarse classification of settlement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Network or timeout; retry next tick without a state change.
    Transient,
    /// Bad input to a creation call.
    Validation,
    /// Companion wallet underfunded.
    InsufficientFunds,
    /// No USD price for a token.
    PriceUnavailable,
    /// Intent deadline passed.
    Expired,
    /// Intent older than the configured maximum age.
    TooOld,
    /// Swap, transfer or attestation submission failed.
    ExecutionFailed,
    /// Lock store could not be reached.
    LockUnavailable,
    /// Persistence store failure.
    Storage,
    NotFound,
    InvalidTransition,
    /// Another worker holds the item's lock.
    Busy,
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("intent {0} passed its deadline")]
    Expired(String),

    #[error("intent {0} exceeded the maximum age")]
    TooOld(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("lock store unavailable: {0}")]
    LockUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("work index error: {0}")]
    WorkIndex(#[from] WorkDbError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0} is being processed by another worker")]
    Busy(String),
}

pub type SettlementResult<T> = Result<T, SettlementError>;

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::Transient(_) => ErrorKind::Transient,
            SettlementError::Validation(_) => ErrorKind::Validation,
            SettlementError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            SettlementError::PriceUnavailable(_) => ErrorKind::PriceUnavailable,
            SettlementError::Expired(_) => ErrorKind::Expired,
            SettlementError::TooOld(_) => ErrorKind::TooOld,
            SettlementError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            SettlementError::LockUnavailable(_) => ErrorKind::LockUnavailable,
            SettlementError::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            SettlementError::Storage(_) | SettlementError::WorkIndex(_) => ErrorKind::Storage,
            SettlementError::NotFound(_) => ErrorKind::NotFound,
            SettlementError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            SettlementError::Busy(_) => ErrorKind::Busy,
        }
    }

    /// Only lock-store and persistence failures may end a tick early.
    pub fn aborts_tick(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LockUnavailable | ErrorKind::Storage
        )
    }

    /// Message safe to show across the operator boundary.
    pub fn public_message(&self) -> String {
        match self {
            SettlementError::Transient(_) => "upstream service temporarily unavailable".into(),
            SettlementError::Validation(msg) => msg.clone(),
            SettlementError::InsufficientFunds(_) => "insufficient funds".into(),
            SettlementError::PriceUnavailable(symbol) => format!("price unavailable for {symbol}"),
            SettlementError::Expired(_) => "intent expired".into(),
            SettlementError::TooOld(_) => "intent too old".into(),
            SettlementError::ExecutionFailed(_) => "execution failed".into(),
            SettlementError::LockUnavailable(_) => "lock store unavailable".into(),
            SettlementError::Storage(StorageError::NotFound(what)) => format!("{what} not found"),
            SettlementError::Storage(_) | SettlementError::WorkIndex(_) => {
                "internal storage error".into()
            }
            SettlementError::NotFound(what) => format!("{what} not found"),
            SettlementError::InvalidTransition { .. } | SettlementError::Busy(_) => {
                self.to_string()
            }
        }
    }
}

// =============================================================================
// HTTP boundary
// =============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        let status = match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InsufficientFunds | ErrorKind::PriceUnavailable => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::InvalidTransition
            | ErrorKind::Busy
            | ErrorKind::Expired
            | ErrorKind::TooOld => StatusCode::CONFLICT,
            ErrorKind::Transient | ErrorKind::LockUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ExecutionFailed => StatusCode::BAD_GATEWAY,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self::new(status, err.public_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}
