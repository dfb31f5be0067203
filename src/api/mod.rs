// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    attestation::{RunReceipt, RunReceiptRequest, RunStatus, SweepReport, VerificationReport},
    engine::{
        CreateIntentRequest, CreateSessionRequest, ItemResult, NewClaim, ProcessReport,
        SessionCreated,
    },
    state::AppState,
    storage::{
        AuditEvent, AuditEventType, ClaimStatus, SessionStatus, StoredClaim, StoredIntent,
        StoredSession, TokenRef,
    },
};

pub mod claims;
pub mod companion;
pub mod health;
pub mod operator;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/operator/process", post(operator::process_now))
        .route("/operator/status", get(operator::status))
        .route(
            "/operator/attestations/sweep",
            post(operator::sweep_attestations),
        )
        .route("/operator/receipts", post(operator::record_receipt))
        .route("/operator/audit", get(operator::audit_events))
        .route(
            "/claims",
            get(claims::list_claims).post(claims::create_claim),
        )
        .route("/claims/{id}", get(claims::get_claim))
        .route("/claims/{id}/intents", post(claims::create_intent))
        .route("/claims/{id}/cancel", post(claims::cancel_claim))
        .route(
            "/claims/{id}/private-transfer",
            post(claims::complete_private_transfer),
        )
        .route("/claims/{id}/attestation", get(claims::verify_attestation))
        .route("/companion/sessions", post(companion::create_session))
        .route("/companion/sessions/{key}", get(companion::get_session));

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/v1", v1_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        operator::process_now,
        operator::status,
        operator::sweep_attestations,
        operator::record_receipt,
        operator::audit_events,
        claims::create_claim,
        claims::list_claims,
        claims::get_claim,
        claims::create_intent,
        claims::cancel_claim,
        claims::complete_private_transfer,
        claims::verify_attestation,
        companion::create_session,
        companion::get_session
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            operator::StatusResponse,
            operator::AuditLogResponse,
            claims::ClaimDetail,
            claims::ClaimListResponse,
            claims::PrivateTransferRequest,
            ProcessReport,
            ItemResult,
            SweepReport,
            VerificationReport,
            RunReceiptRequest,
            RunReceipt,
            RunStatus,
            NewClaim,
            CreateIntentRequest,
            CreateSessionRequest,
            SessionCreated,
            StoredClaim,
            StoredIntent,
            StoredSession,
            ClaimStatus,
            SessionStatus,
            TokenRef,
            AuditEvent,
            AuditEventType
        )
    ),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Operator", description = "Settlement ticks, sweeps and receipts"),
        (name = "Claims", description = "Claim lifecycle"),
        (name = "Companion", description = "Companion wallet sessions")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::blockchain::{ChainRegistry, EvmRail};
    use crate::config::AppConfig;
    use crate::providers::HttpQuoteProvider;
    use crate::state::Collaborators;

    fn test_state() -> (TempDir, AppState) {
        let temp = TempDir::new().unwrap();
        let vars = HashMap::from([(
            "DATA_DIR".to_string(),
            temp.path().to_string_lossy().to_string(),
        )]);
        let config = AppConfig::from_vars(&vars).unwrap();
        let collaborators = Collaborators {
            quotes: Arc::new(
                HttpQuoteProvider::new(Some("http://127.0.0.1:9".into()), None).unwrap(),
            ),
            price_feed: None,
            rail: Arc::new(EvmRail::new(ChainRegistry::new(HashMap::new()))),
            ledger: None,
            gas_sponsor: None,
        };
        let state = AppState::build(&config, collaborators).unwrap();
        (temp, state)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let (_temp, state) = test_state();
        let _ = router(state).into_make_service();
    }

    #[tokio::test]
    async fn health_reports_ledger_disabled() {
        let (_temp, state) = test_state();
        let (status, body) =
            send(router(state), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["storage"], "ok");
        assert_eq!(body["checks"]["ledger"], "disabled");
    }

    #[tokio::test]
    async fn operator_status_and_empty_tick() {
        let (_temp, state) = test_state();
        let app = router(state);

        let (status, body) = send(
            app.clone(),
            Request::get("/v1/operator/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "isProcessing": false, "pending": 0 }));

        let (status, body) = send(app, post_json("/v1/operator/process", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "processed": 0, "results": [] }));
    }

    #[tokio::test]
    async fn claim_import_and_lookup() {
        let (_temp, state) = test_state();
        let app = router(state);

        let (status, created) = send(
            app.clone(),
            post_json(
                "/v1/claims",
                json!({
                    "id": "claim-1",
                    "amount": "100",
                    "tokenSymbol": "USDC",
                    "tokenChain": "base",
                    "recipientAddress": "0x1111111111111111111111111111111111111111"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "OPEN");

        let (status, detail) = send(
            app.clone(),
            Request::get("/v1/claims/claim-1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["claim"]["id"], "claim-1");
        assert_eq!(detail["intents"], json!([]));

        let (status, _) = send(
            app.clone(),
            Request::get("/v1/claims/missing").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, cancelled) =
            send(app, post_json("/v1/claims/claim-1/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "CANCELLED");
    }

    #[tokio::test]
    async fn invalid_claim_is_bad_request() {
        let (_temp, state) = test_state();
        let (status, body) = send(
            router(state),
            post_json(
                "/v1/claims",
                json!({
                    "amount": "0",
                    "tokenSymbol": "USDC",
                    "tokenChain": "base",
                    "recipientAddress": "0x1111111111111111111111111111111111111111"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "amount must be positive");
    }

    #[tokio::test]
    async fn receipts_need_a_ledger() {
        let (_temp, state) = test_state();
        let (status, _) = send(
            router(state),
            post_json(
                "/v1/operator/receipts",
                json!({ "runId": "r1", "authorizerId": "ops", "claimIds": ["c1"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
