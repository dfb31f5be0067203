// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Claim import, settlement intents and the per-claim operator triggers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    attestation::VerificationReport,
    engine::{CreateIntentRequest, NewClaim},
    error::ApiError,
    state::AppState,
    storage::{ClaimRepository, ClaimStatus, StoredClaim, StoredIntent},
};

const OPERATOR: &str = "operator";

#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimDetail {
    pub claim: StoredClaim,
    /// Newest first, superseded intents included.
    pub intents: Vec<StoredIntent>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimListResponse {
    pub claims: Vec<StoredClaim>,
    pub total: usize,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ClaimListQuery {
    /// Filter by status, e.g. `PENDING_DEPOSIT`.
    pub status: Option<ClaimStatus>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrivateTransferRequest {
    /// Reference of the completed private transfer.
    pub execution_ref: String,
}

/// Import a payment obligation.
#[utoipa::path(
    post,
    path = "/v1/claims",
    tag = "Claims",
    request_body = NewClaim,
    responses(
        (status = 201, description = "Claim created", body = StoredClaim),
        (status = 400, description = "Invalid claim")
    )
)]
pub async fn create_claim(
    State(state): State<AppState>,
    Json(request): Json<NewClaim>,
) -> Result<(StatusCode, Json<StoredClaim>), ApiError> {
    let claim = state.machine.create_claim(&request)?;
    Ok((StatusCode::CREATED, Json(claim)))
}

#[utoipa::path(
    get,
    path = "/v1/claims",
    tag = "Claims",
    params(ClaimListQuery),
    responses(
        (status = 200, description = "Claims", body = ClaimListResponse)
    )
)]
pub async fn list_claims(
    State(state): State<AppState>,
    Query(query): Query<ClaimListQuery>,
) -> Result<Json<ClaimListResponse>, ApiError> {
    let repo = ClaimRepository::new(&state.storage);
    let claims = match query.status {
        Some(status) => repo.list_by_status(status),
        None => repo.list(),
    }
    .map_err(crate::error::SettlementError::from)?;
    Ok(Json(ClaimListResponse {
        total: claims.len(),
        claims,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/claims/{id}",
    tag = "Claims",
    params(("id" = String, Path, description = "Claim id")),
    responses(
        (status = 200, description = "Claim with its intents", body = ClaimDetail),
        (status = 404, description = "Unknown claim")
    )
)]
pub async fn get_claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClaimDetail>, ApiError> {
    let claim = state.machine.get_claim(&id)?;
    let intents = state.machine.intents_for(&id)?;
    Ok(Json(ClaimDetail { claim, intents }))
}

/// Quote a settlement and issue a deposit address.
#[utoipa::path(
    post,
    path = "/v1/claims/{id}/intents",
    tag = "Claims",
    params(("id" = String, Path, description = "Claim id")),
    request_body = CreateIntentRequest,
    responses(
        (status = 201, description = "Intent created", body = StoredIntent),
        (status = 404, description = "Unknown claim"),
        (status = 409, description = "Claim not open or locked"),
        (status = 422, description = "Price unavailable")
    )
)]
pub async fn create_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CreateIntentRequest>,
) -> Result<(StatusCode, Json<StoredIntent>), ApiError> {
    let intent = state.machine.create_intent(&id, &request).await?;
    Ok((StatusCode::CREATED, Json(intent)))
}

#[utoipa::path(
    post,
    path = "/v1/claims/{id}/cancel",
    tag = "Claims",
    params(("id" = String, Path, description = "Claim id")),
    responses(
        (status = 200, description = "Claim cancelled", body = StoredClaim),
        (status = 409, description = "Claim already terminal or locked")
    )
)]
pub async fn cancel_claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredClaim>, ApiError> {
    let claim = state.machine.cancel(&id, OPERATOR).await?;
    Ok(Json(claim))
}

/// Finish a private claim once its out-of-band transfer is done.
#[utoipa::path(
    post,
    path = "/v1/claims/{id}/private-transfer",
    tag = "Claims",
    params(("id" = String, Path, description = "Claim id")),
    request_body = PrivateTransferRequest,
    responses(
        (status = 200, description = "Claim settled", body = StoredClaim),
        (status = 409, description = "Claim not awaiting a private transfer")
    )
)]
pub async fn complete_private_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PrivateTransferRequest>,
) -> Result<Json<StoredClaim>, ApiError> {
    let claim = state
        .machine
        .complete_private_transfer(&id, &request.execution_ref, OPERATOR)
        .await?;
    Ok(Json(claim))
}

/// Recompute the commitment and compare it with the ledger record.
#[utoipa::path(
    get,
    path = "/v1/claims/{id}/attestation",
    tag = "Claims",
    params(("id" = String, Path, description = "Claim id")),
    responses(
        (status = 200, description = "Verification report", body = VerificationReport),
        (status = 404, description = "Unknown claim")
    )
)]
pub async fn verify_attestation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VerificationReport>, ApiError> {
    let report = state.recorder.verify(&id).await?;
    Ok(Json(report))
}
