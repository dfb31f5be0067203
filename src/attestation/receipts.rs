// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payout-run receipts.
//!
//! A run is a batch of claims settled together. Its receipt carries only
//! hashes: the batch hash over the sorted claim ids and a hash over the
//! execution references of the paid claims.

use std::sync::Arc;

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;
use utoipa::ToSchema;

use super::ledger::{AttestationLedger, ReceiptRecord};
use crate::audit_log;
use crate::error::{SettlementError, SettlementResult};
use crate::storage::{AuditEvent, AuditEventType, ClaimRepository, ClaimStatus, FileStore, WorkDatabase};

/// Attempts at finding an unused nonce when the local counter lags the ledger.
const MAX_NONCE_PROBES: usize = 16;

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunReceiptRequest {
    pub run_id: String,
    /// Who approved the run.
    pub authorizer_id: String,
    pub claim_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    fn from_counts(paid: usize, total: usize) -> Self {
        match paid {
            0 => RunStatus::Failed,
            n if n == total => RunStatus::Success,
            _ => RunStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunReceipt {
    pub run_id: String,
    #[schema(value_type = String)]
    pub batch_hash: B256,
    #[schema(value_type = String)]
    pub tx_refs_hash: B256,
    pub nonce: u64,
    pub status: String,
    /// Ledger transaction; `None` when the run was already on the ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
}

fn hash_lines<'a>(items: impl IntoIterator<Item = &'a str>) -> B256 {
    let mut items: Vec<&str> = items.into_iter().collect();
    items.sort_unstable();
    B256::from_slice(&Sha256::digest(items.join("\n").as_bytes()))
}

/// SHA-256 over the newline-joined, sorted claim ids.
pub fn batch_hash(claim_ids: &[String]) -> B256 {
    hash_lines(claim_ids.iter().map(String::as_str))
}

/// SHA-256 over the newline-joined, sorted execution references.
pub fn tx_refs_hash(execution_refs: &[String]) -> B256 {
    hash_lines(execution_refs.iter().map(String::as_str))
}

pub struct ReceiptLogger {
    storage: Arc<FileStore>,
    work_db: Arc<WorkDatabase>,
    ledger: Arc<dyn AttestationLedger>,
    executor_id: String,
}

impl ReceiptLogger {
    pub fn new(
        storage: Arc<FileStore>,
        work_db: Arc<WorkDatabase>,
        ledger: Arc<dyn AttestationLedger>,
        executor_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            work_db,
            ledger,
            executor_id: executor_id.into(),
        }
    }

    /// Record a receipt for a run. Repeating a run id returns the existing receipt.
    pub async fn log_run(&self, request: &RunReceiptRequest) -> SettlementResult<RunReceipt> {
        if request.run_id.trim().is_empty() || request.authorizer_id.trim().is_empty() {
            return Err(SettlementError::Validation(
                "runId and authorizerId are required".to_string(),
            ));
        }
        if request.claim_ids.is_empty() {
            return Err(SettlementError::Validation(
                "a run needs at least one claim".to_string(),
            ));
        }

        if let Some(existing) = self.ledger.get_receipt(&request.run_id).await? {
            return Ok(RunReceipt {
                run_id: existing.run_id,
                batch_hash: existing.batch_hash,
                tx_refs_hash: existing.tx_refs_hash,
                nonce: existing.nonce,
                status: existing.status,
                tx_ref: None,
            });
        }

        let claims = ClaimRepository::new(&self.storage);
        let mut execution_refs = Vec::new();
        for claim_id in &request.claim_ids {
            let claim = claims.get(claim_id)?;
            if claim.status == ClaimStatus::Success {
                if let Some(execution_ref) = claim.execution_ref {
                    execution_refs.push(execution_ref);
                }
            }
        }
        let status = RunStatus::from_counts(execution_refs.len(), request.claim_ids.len());
        let nonce = self.allocate_nonce(&request.authorizer_id).await?;

        let record = ReceiptRecord {
            run_id: request.run_id.clone(),
            batch_hash: batch_hash(&request.claim_ids),
            authorizer_id: request.authorizer_id.clone(),
            nonce,
            executor_id: self.executor_id.clone(),
            status: status.as_str().to_string(),
            tx_refs_hash: tx_refs_hash(&execution_refs),
            timestamp: 0,
        };
        let tx_ref = self.ledger.record_receipt(&record).await?;

        info!(
            run_id = %record.run_id,
            status = %record.status,
            nonce,
            "Run receipt recorded"
        );
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::ReceiptRecorded)
                .with_actor(request.authorizer_id.clone())
                .with_resource("receipt", request.run_id.clone())
                .with_details(json!({
                    "status": record.status,
                    "claims": request.claim_ids.len(),
                    "txRef": tx_ref,
                }))
        );

        Ok(RunReceipt {
            run_id: record.run_id,
            batch_hash: record.batch_hash,
            tx_refs_hash: record.tx_refs_hash,
            nonce,
            status: record.status,
            tx_ref: Some(tx_ref),
        })
    }

    async fn allocate_nonce(&self, authorizer_id: &str) -> SettlementResult<u64> {
        let counter = format!("receipt:{authorizer_id}");
        for _ in 0..MAX_NONCE_PROBES {
            let nonce = self.work_db.next_counter(&counter)?;
            if !self.ledger.is_nonce_used(authorizer_id, nonce).await? {
                return Ok(nonce);
            }
        }
        Err(SettlementError::ExecutionFailed(format!(
            "no unused receipt nonce for {authorizer_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::ledger::InMemoryLedger;
    use crate::error::ErrorKind;
    use crate::storage::StoredClaim;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<FileStore>, Arc<InMemoryLedger>, ReceiptLogger) {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(FileStore::open(temp.path()).unwrap());
        let work_db = Arc::new(WorkDatabase::open(&temp.path().join("work.redb")).unwrap());
        let ledger = Arc::new(InMemoryLedger::new());
        let logger = ReceiptLogger::new(storage.clone(), work_db, ledger.clone(), "test-executor");
        (temp, storage, ledger, logger)
    }

    fn claim(storage: &FileStore, id: &str, status: ClaimStatus, execution_ref: Option<&str>) {
        let mut claim = StoredClaim::new_open(
            id.into(),
            "10".into(),
            "USDC".into(),
            "base".into(),
            "0xabc".into(),
            false,
        );
        claim.status = status;
        claim.execution_ref = execution_ref.map(str::to_string);
        ClaimRepository::new(storage).create(&claim).unwrap();
    }

    fn request(run_id: &str, claim_ids: &[&str]) -> RunReceiptRequest {
        RunReceiptRequest {
            run_id: run_id.into(),
            authorizer_id: "ops".into(),
            claim_ids: claim_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn batch_hash_ignores_order() {
        let a = batch_hash(&["b".to_string(), "a".to_string()]);
        let b = batch_hash(&["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, batch_hash(&["a".to_string()]));
    }

    #[test]
    fn run_status_from_counts() {
        assert_eq!(RunStatus::from_counts(2, 2), RunStatus::Success);
        assert_eq!(RunStatus::from_counts(1, 2), RunStatus::Partial);
        assert_eq!(RunStatus::from_counts(0, 2), RunStatus::Failed);
    }

    #[tokio::test]
    async fn logs_partial_run_with_fresh_nonces() {
        let (_temp, storage, ledger, logger) = setup();
        claim(&storage, "c1", ClaimStatus::Success, Some("0x01"));
        claim(&storage, "c2", ClaimStatus::Refunded, None);
        claim(&storage, "c3", ClaimStatus::Success, Some("0x03"));

        let first = logger.log_run(&request("run-1", &["c1", "c2"])).await.unwrap();
        assert_eq!(first.status, "partial");
        assert_eq!(first.nonce, 1);
        assert_eq!(first.tx_refs_hash, tx_refs_hash(&["0x01".to_string()]));

        let second = logger.log_run(&request("run-2", &["c3"])).await.unwrap();
        assert_eq!(second.status, "success");
        assert_eq!(second.nonce, 2);
        assert!(ledger.is_nonce_used("ops", 2).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_run_returns_existing_receipt() {
        let (_temp, storage, _ledger, logger) = setup();
        claim(&storage, "c1", ClaimStatus::Success, Some("0x01"));

        let first = logger.log_run(&request("run-1", &["c1"])).await.unwrap();
        let again = logger.log_run(&request("run-1", &["c1"])).await.unwrap();
        assert_eq!(again.nonce, first.nonce);
        assert!(again.tx_ref.is_none());
    }

    #[tokio::test]
    async fn empty_run_is_rejected() {
        let (_temp, _storage, _ledger, logger) = setup();
        let err = logger.log_run(&request("run-1", &[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unknown_claim_is_not_found() {
        let (_temp, _storage, _ledger, logger) = setup();
        let err = logger.log_run(&request("run-1", &["missing"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
