// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    engine::{CreateSessionRequest, SessionCreated},
    error::ApiError,
    state::AppState,
    storage::StoredSession,
};

/// Open a companion wallet session and return its deposit address.
#[utoipa::path(
    post,
    path = "/v1/companion/sessions",
    tag = "Companion",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = SessionCreated),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Unknown claim"),
        (status = 409, description = "Claim already settled or busy"),
        (status = 422, description = "Price unavailable")
    )
)]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreated>), ApiError> {
    let created = state.companion.create_session(&request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/v1/companion/sessions/{key}",
    tag = "Companion",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Session metadata", body = StoredSession),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<StoredSession>, ApiError> {
    let session = state.companion.get_session(&key)?;
    Ok(Json(session))
}
