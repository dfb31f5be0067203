// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Attestation Recorder
//!
//! Writes the commitment of a successful claim to the attestation ledger,
//! exactly once per claim.
//!
//! `attest` runs under the `attest:<claim_id>` lock:
//! 1. return early when the claim already has an attestation tx hash
//! 2. generate and persist a nonce if the claim has none
//! 3. build the commitment
//! 4. submit it; on failure nothing is written and the claim stays eligible
//! 5. re-read the claim and persist the tx reference only if still unset
//!
//! The two writes of steps 2 and 5 also take the `claim:<id>` lock. When the
//! claim is busy the attempt ends as `Busy`; a ledger record submitted before
//! that is picked up by the next sweep as an existing record.
//!
//! [`AttestationRecorder::sweep`] retries every successful claim that is
//! still missing its tx hash.

use std::sync::Arc;

use alloy::primitives::B256;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::commitment::{generate_nonce, CommitmentInput};
use super::ledger::{AttestationLedger, LedgerError};
use crate::audit_log;
use crate::error::{SettlementError, SettlementResult};
use crate::lock::{claim_lock_key, DistributedLock, LockOutcome};
use crate::storage::{
    AuditEvent, AuditEventType, ClaimRepository, ClaimStatus, FileStore, StoredClaim,
};

/// Result of one `attest` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestOutcome {
    /// Submitted now; carries the persisted tx reference.
    Recorded(String),
    /// The claim already carried a tx reference.
    AlreadyRecorded(String),
    /// No ledger configured; only the nonce was persisted.
    NonceOnly,
    /// Another worker holds the attestation lock.
    Busy,
}

/// Counts logged by each sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub attempted: usize,
    pub recorded: usize,
    pub failed: usize,
}

/// Auditor view of one claim's attestation.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub claim_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_tx_hash: Option<String>,
    pub nonce_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub local_commitment: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub ledger_commitment: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_execution_ref: Option<String>,
    /// Recomputed commitment equals the ledger's.
    pub verified: bool,
}

#[derive(Clone)]
pub struct AttestationRecorder {
    storage: Arc<FileStore>,
    lock: DistributedLock,
    ledger: Option<Arc<dyn AttestationLedger>>,
}

pub(crate) fn lock_key(claim_id: &str) -> String {
    format!("attest:{claim_id}")
}

impl AttestationRecorder {
    pub fn new(
        storage: Arc<FileStore>,
        lock: DistributedLock,
        ledger: Option<Arc<dyn AttestationLedger>>,
    ) -> Self {
        Self {
            storage,
            lock,
            ledger,
        }
    }

    pub fn ledger_configured(&self) -> bool {
        self.ledger.is_some()
    }

    /// Attest a claim in `SUCCESS`. Idempotent.
    pub async fn attest(&self, claim_id: &str) -> SettlementResult<AttestOutcome> {
        let key = lock_key(claim_id);
        let outcome = self
            .lock
            .with_lock(&key, self.lock.default_ttl(), || self.attest_locked(claim_id))
            .await?;
        match outcome {
            LockOutcome::Acquired(result) => result,
            LockOutcome::NotAcquired => Ok(AttestOutcome::Busy),
        }
    }

    async fn attest_locked(&self, claim_id: &str) -> SettlementResult<AttestOutcome> {
        let claim = ClaimRepository::new(&self.storage).get(claim_id)?;

        if let Some(tx_hash) = &claim.attestation_tx_hash {
            return Ok(AttestOutcome::AlreadyRecorded(tx_hash.clone()));
        }
        if claim.status != ClaimStatus::Success {
            return Err(SettlementError::Validation(format!(
                "claim {claim_id} is {} and cannot be attested",
                claim.status
            )));
        }
        let execution_ref = claim.execution_ref.clone().ok_or_else(|| {
            SettlementError::Validation(format!("claim {claim_id} has no execution reference"))
        })?;

        let nonce = match &claim.attestation_nonce {
            Some(nonce) => nonce.clone(),
            None => {
                let fresh = generate_nonce();
                let edited = self
                    .edit_claim(claim_id, |claim| {
                        if claim.attestation_nonce.is_some() {
                            return false;
                        }
                        claim.attestation_nonce = Some(fresh.clone());
                        true
                    })
                    .await?;
                let Some(edited) = edited else {
                    return Ok(AttestOutcome::Busy);
                };
                debug!(claim_id = %claim_id, "Attestation nonce persisted");
                edited.attestation_nonce.unwrap_or(fresh)
            }
        };

        let commitment = CommitmentInput::from_claim(&claim, &execution_ref).commit(&nonce);

        let Some(ledger) = &self.ledger else {
            debug!(claim_id = %claim_id, "No attestation ledger configured");
            return Ok(AttestOutcome::NonceOnly);
        };

        let tx_ref = match ledger
            .record_payment(claim_id, &execution_ref, commitment.as_slice())
            .await
        {
            Ok(tx_ref) => tx_ref,
            Err(LedgerError::AlreadyRecorded(_)) => {
                self.existing_record_ref(ledger.as_ref(), claim_id, &commitment)
                    .await?
            }
            Err(error) => {
                warn!(claim_id = %claim_id, %error, "Attestation submission failed");
                audit_log!(
                    &self.storage,
                    AuditEvent::new(AuditEventType::AttestationFailed)
                        .with_actor("engine")
                        .with_resource("claim", claim_id)
                        .failed(error.to_string())
                );
                return Err(error.into());
            }
        };

        // Another attempt may have landed between submission and now.
        let mut written = false;
        let edited = self
            .edit_claim(claim_id, |claim| {
                if claim.attestation_tx_hash.is_some() {
                    return false;
                }
                claim.attestation_tx_hash = Some(tx_ref.clone());
                written = true;
                true
            })
            .await?;
        let Some(edited) = edited else {
            debug!(claim_id = %claim_id, "Claim busy, attestation hash left to the sweep");
            return Ok(AttestOutcome::Busy);
        };
        if !written {
            let existing = edited.attestation_tx_hash.unwrap_or_default();
            return Ok(AttestOutcome::AlreadyRecorded(existing));
        }

        info!(claim_id = %claim_id, tx_ref = %tx_ref, "Attestation recorded");
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::AttestationRecorded)
                .with_actor("engine")
                .with_resource("claim", claim_id)
                .with_details(json!({ "txRef": tx_ref }))
        );
        Ok(AttestOutcome::Recorded(tx_ref))
    }

    /// Re-read the claim and apply `edit` under the claim lock, writing it back
    /// when `edit` returns true. `None` when the claim lock is held elsewhere.
    async fn edit_claim<F>(&self, claim_id: &str, edit: F) -> SettlementResult<Option<StoredClaim>>
    where
        F: FnOnce(&mut StoredClaim) -> bool,
    {
        let outcome = self
            .lock
            .with_lock(&claim_lock_key(claim_id), self.lock.default_ttl(), || {
                self.edit_claim_locked(claim_id, edit)
            })
            .await?;
        outcome.acquired().transpose()
    }

    async fn edit_claim_locked<F>(&self, claim_id: &str, edit: F) -> SettlementResult<StoredClaim>
    where
        F: FnOnce(&mut StoredClaim) -> bool,
    {
        let claims = ClaimRepository::new(&self.storage);
        let mut claim = claims.get(claim_id)?;
        if edit(&mut claim) {
            claims.update(&mut claim)?;
        }
        Ok(claim)
    }

    /// The ledger already holds a record: accept it only if it carries our commitment.
    async fn existing_record_ref(
        &self,
        ledger: &dyn AttestationLedger,
        claim_id: &str,
        commitment: &B256,
    ) -> SettlementResult<String> {
        let record = ledger.get_payment(claim_id).await?.ok_or_else(|| {
            SettlementError::Transient(format!("ledger record for {claim_id} not readable yet"))
        })?;
        if record.commitment != *commitment {
            return Err(SettlementError::ExecutionFailed(format!(
                "ledger holds a different commitment for claim {claim_id}"
            )));
        }
        Ok(format!("ledger:{claim_id}@{}", record.timestamp))
    }

    /// Retry every successful claim without an attestation tx hash.
    pub async fn sweep(&self) -> SettlementResult<SweepReport> {
        let pending = ClaimRepository::new(&self.storage).list_needing_attestation()?;
        let mut report = SweepReport::default();

        for claim in pending {
            report.attempted += 1;
            match self.attest(&claim.id).await {
                Ok(AttestOutcome::Recorded(_)) | Ok(AttestOutcome::AlreadyRecorded(_)) => {
                    report.recorded += 1;
                }
                Ok(AttestOutcome::NonceOnly) | Ok(AttestOutcome::Busy) => {}
                Err(error) if error.aborts_tick() => return Err(error),
                Err(error) => {
                    report.failed += 1;
                    warn!(claim_id = %claim.id, %error, "Attestation retry failed");
                }
            }
        }

        info!(
            attempted = report.attempted,
            recorded = report.recorded,
            failed = report.failed,
            "Attestation sweep finished"
        );
        Ok(report)
    }

    /// Recompute the commitment from stored claim data and compare with the ledger.
    pub async fn verify(&self, claim_id: &str) -> SettlementResult<VerificationReport> {
        let claim = ClaimRepository::new(&self.storage).get(claim_id)?;

        let local_commitment = match (&claim.attestation_nonce, &claim.execution_ref) {
            (Some(nonce), Some(execution_ref)) => {
                Some(CommitmentInput::from_claim(&claim, execution_ref).commit(nonce))
            }
            _ => None,
        };

        let ledger_record = match &self.ledger {
            Some(ledger) => ledger.get_payment(claim_id).await?,
            None => None,
        };

        let verified = match (&local_commitment, &ledger_record) {
            (Some(local), Some(record)) => {
                claim.execution_ref.as_deref() == Some(record.execution_ref.as_str())
                    && *local == record.commitment
            }
            _ => false,
        };

        Ok(VerificationReport {
            claim_id: claim.id.clone(),
            attestation_tx_hash: claim.attestation_tx_hash.clone(),
            nonce_present: claim.attestation_nonce.is_some(),
            local_commitment,
            ledger_commitment: ledger_record.as_ref().map(|r| r.commitment),
            ledger_execution_ref: ledger_record.map(|r| r.execution_ref),
            verified,
        })
    }
}
