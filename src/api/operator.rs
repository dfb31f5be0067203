// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Operator trigger surface.
//!
//! "Process now", driver status, attestation sweep, run receipts and audit
//! queries. Authentication sits in front of this service.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};

use crate::{
    attestation::{RunReceipt, RunReceiptRequest, SweepReport},
    audit_log,
    engine::ProcessReport,
    error::ApiError,
    state::AppState,
    storage::{AuditEvent, AuditEventType, AuditRepository, StorageError},
};

const OPERATOR: &str = "operator";
const DEFAULT_AUDIT_LIMIT: usize = 100;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub is_processing: bool,
    /// Items waiting in the pending-work index.
    pub pending: usize,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(rename_all = "camelCase")]
pub struct AuditQuery {
    /// First day (YYYY-MM-DD), defaults to today.
    pub start_date: Option<String>,
    /// Last day (YYYY-MM-DD), defaults to `startDate`.
    pub end_date: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditLogResponse {
    pub events: Vec<AuditEvent>,
    pub total: usize,
}

/// Run one settlement tick now.
#[utoipa::path(
    post,
    path = "/v1/operator/process",
    tag = "Operator",
    responses(
        (status = 200, description = "Tick report", body = ProcessReport),
        (status = 409, description = "A tick is already running"),
        (status = 500, description = "Tick aborted by a store failure")
    )
)]
pub async fn process_now(State(state): State<AppState>) -> Result<Json<ProcessReport>, ApiError> {
    audit_log!(
        &state.storage,
        AuditEvent::new(AuditEventType::OperatorTrigger)
            .with_actor(OPERATOR)
            .with_details(json!({ "action": "process" }))
    );
    let report = state.orchestrator.process_pending().await?;
    Ok(Json(report))
}

/// Whether a tick is running and how much work is queued.
#[utoipa::path(
    get,
    path = "/v1/operator/status",
    tag = "Operator",
    responses(
        (status = 200, description = "Driver status", body = StatusResponse)
    )
)]
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let pending = state
        .work_db
        .list_pending()
        .map_err(|e| {
            tracing::error!(error = %e, "Work index read failed");
            ApiError::internal("work index unavailable")
        })?
        .len();
    Ok(Json(StatusResponse {
        is_processing: state.orchestrator.is_processing(),
        pending,
    }))
}

/// Attest every successful claim that lacks an attestation.
#[utoipa::path(
    post,
    path = "/v1/operator/attestations/sweep",
    tag = "Operator",
    responses(
        (status = 200, description = "Sweep counts", body = SweepReport)
    )
)]
pub async fn sweep_attestations(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, ApiError> {
    audit_log!(
        &state.storage,
        AuditEvent::new(AuditEventType::OperatorTrigger)
            .with_actor(OPERATOR)
            .with_details(json!({ "action": "attestation_sweep" }))
    );
    let report = state.orchestrator.sweep_attestations().await?;
    Ok(Json(report))
}

/// Record a hash-only receipt for a payout run.
#[utoipa::path(
    post,
    path = "/v1/operator/receipts",
    tag = "Operator",
    request_body = RunReceiptRequest,
    responses(
        (status = 200, description = "Receipt recorded or already present", body = RunReceipt),
        (status = 400, description = "Invalid request"),
        (status = 503, description = "No attestation ledger configured")
    )
)]
pub async fn record_receipt(
    State(state): State<AppState>,
    Json(request): Json<RunReceiptRequest>,
) -> Result<Json<RunReceipt>, ApiError> {
    let logger = state
        .receipts
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("attestation ledger not configured"))?;
    let receipt = logger.log_run(&request).await?;
    Ok(Json(receipt))
}

/// Query the audit log by day range and resource.
#[utoipa::path(
    get,
    path = "/v1/operator/audit",
    tag = "Operator",
    params(AuditQuery),
    responses(
        (status = 200, description = "Matching audit events", body = AuditLogResponse),
        (status = 400, description = "Invalid date")
    )
)]
pub async fn audit_events(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditLogResponse>, ApiError> {
    let start = query
        .start_date
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
    let end = query.end_date.unwrap_or_else(|| start.clone());

    let events = AuditRepository::new(&state.storage)
        .read_events_range(&start, &end)
        .map_err(|e| match e {
            StorageError::SerializationError(msg) => ApiError::bad_request(msg),
            other => {
                tracing::error!(error = %other, "Audit log read failed");
                ApiError::internal("audit log unavailable")
            }
        })?;

    let events: Vec<AuditEvent> = events
        .into_iter()
        .filter(|e| {
            query
                .resource_type
                .as_deref()
                .is_none_or(|t| e.resource_type.as_deref() == Some(t))
                && query
                    .resource_id
                    .as_deref()
                    .is_none_or(|id| e.resource_id.as_deref() == Some(id))
        })
        .take(query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
        .collect();

    Ok(Json(AuditLogResponse {
        total: events.len(),
        events,
    }))
}
