// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Claim repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::super::{FileStore, StorageError, StorageResult};

/// Claim lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    /// Obligation recorded, no deposit address issued yet.
    Open,
    /// A settlement intent exists and its deposit address awaits funds.
    PendingDeposit,
    /// The provider reported the deposit as being processed.
    InFlight,
    /// Funds reached the intermediate custody point of a private claim.
    PrivateTransferPending,
    /// Paid.
    Success,
    /// Provider refunded the deposit.
    Refunded,
    /// Deadline or maximum age passed.
    Expired,
    /// Cancelled by an operator.
    Cancelled,
}

impl ClaimStatus {
    /// Terminal states are never re-evaluated by the engine.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClaimStatus::Success
                | ClaimStatus::Refunded
                | ClaimStatus::Expired
                | ClaimStatus::Cancelled
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ClaimStatus) -> bool {
        use ClaimStatus::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Expired | Cancelled => true,
            PendingDeposit => matches!(self, Open | PendingDeposit),
            InFlight => matches!(self, PendingDeposit | InFlight),
            Refunded => matches!(self, PendingDeposit | InFlight),
            Success => matches!(self, InFlight | PrivateTransferPending),
            PrivateTransferPending => self == InFlight,
            Open => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Open => "OPEN",
            ClaimStatus::PendingDeposit => "PENDING_DEPOSIT",
            ClaimStatus::InFlight => "IN_FLIGHT",
            ClaimStatus::PrivateTransferPending => "PRIVATE_TRANSFER_PENDING",
            ClaimStatus::Success => "SUCCESS",
            ClaimStatus::Refunded => "REFUNDED",
            ClaimStatus::Expired => "EXPIRED",
            ClaimStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted payment claim.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StoredClaim {
    /// Unique claim identifier.
    pub id: String,
    /// USD amount as a decimal string, kept verbatim (part of the commitment preimage).
    pub amount: String,
    /// Destination token symbol (e.g. `USDC`).
    pub token_symbol: String,
    /// Destination chain name (e.g. `base`).
    pub token_chain: String,
    /// Recipient address on the destination chain.
    pub recipient_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ClaimStatus,
    /// Settle through the private-transfer custody point.
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    /// Execution reference (settlement tx hash or provider id) of the payment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_ref: Option<String>,
    /// Set once, after `status` reached `SUCCESS`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_tx_hash: Option<String>,
    /// 32-byte hex nonce; written before the first attestation attempt, never changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_nonce: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredClaim {
    /// Construct a new open claim.
    pub fn new_open(
        id: String,
        amount: String,
        token_symbol: String,
        token_chain: String,
        recipient_address: String,
        is_private: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            amount,
            token_symbol,
            token_chain,
            recipient_address,
            creator_id: None,
            description: None,
            status: ClaimStatus::Open,
            is_private,
            paid_at: None,
            execution_ref: None,
            attestation_tx_hash: None,
            attestation_nonce: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `SUCCESS` without a recorded attestation.
    pub fn needs_attestation(&self) -> bool {
        self.status == ClaimStatus::Success && self.attestation_tx_hash.is_none()
    }
}

/// Repository for claim documents.
pub struct ClaimRepository<'a> {
    storage: &'a FileStore,
}

impl<'a> ClaimRepository<'a> {
    pub fn new(storage: &'a FileStore) -> Self {
        Self { storage }
    }

    pub fn exists(&self, claim_id: &str) -> bool {
        self.storage.exists(self.storage.paths().claim(claim_id))
    }

    pub fn get(&self, claim_id: &str) -> StorageResult<StoredClaim> {
        let path = self.storage.paths().claim(claim_id);
        if !self.storage.exists(&path) {
            return Err(StorageError::NotFound(format!("Claim {claim_id}")));
        }
        self.storage.read_json(path)
    }

    pub fn create(&self, claim: &StoredClaim) -> StorageResult<()> {
        if self.exists(&claim.id) {
            return Err(StorageError::AlreadyExists(format!("Claim {}", claim.id)));
        }
        self.storage
            .write_json(self.storage.paths().claim(&claim.id), claim)
    }

    /// Overwrite an existing claim, bumping `updated_at`.
    pub fn update(&self, claim: &mut StoredClaim) -> StorageResult<()> {
        if !self.exists(&claim.id) {
            return Err(StorageError::NotFound(format!("Claim {}", claim.id)));
        }
        claim.updated_at = Utc::now();
        self.storage
            .write_json(self.storage.paths().claim(&claim.id), claim)
    }

    /// All claims, newest first.
    pub fn list(&self) -> StorageResult<Vec<StoredClaim>> {
        let ids = self
            .storage
            .list_files(self.storage.paths().claims_dir(), "json")?;

        let mut claims = Vec::with_capacity(ids.len());
        for id in ids {
            claims.push(self.get(&id)?);
        }
        claims.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(claims)
    }

    pub fn list_by_status(&self, status: ClaimStatus) -> StorageResult<Vec<StoredClaim>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|claim| claim.status == status)
            .collect())
    }

    /// Successful claims still waiting for an attestation record.
    pub fn list_needing_attestation(&self) -> StorageResult<Vec<StoredClaim>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(StoredClaim::needs_attestation)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileStore) {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).unwrap();
        (temp, store)
    }

    fn sample_claim(id: &str) -> StoredClaim {
        StoredClaim::new_open(
            id.to_string(),
            "100".to_string(),
            "USDC".to_string(),
            "base".to_string(),
            "0x1111111111111111111111111111111111111111".to_string(),
            false,
        )
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ClaimStatus::PrivateTransferPending).unwrap();
        assert_eq!(json, "\"PRIVATE_TRANSFER_PENDING\"");
        assert_eq!(ClaimStatus::InFlight.to_string(), "IN_FLIGHT");
    }

    #[test]
    fn terminal_states_allow_no_transitions() {
        for terminal in [
            ClaimStatus::Success,
            ClaimStatus::Refunded,
            ClaimStatus::Expired,
            ClaimStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(ClaimStatus::Cancelled));
            assert!(!terminal.can_transition_to(ClaimStatus::InFlight));
        }
    }

    #[test]
    fn lifecycle_edges() {
        use ClaimStatus::*;
        assert!(Open.can_transition_to(PendingDeposit));
        assert!(!Open.can_transition_to(InFlight));
        assert!(PendingDeposit.can_transition_to(InFlight));
        assert!(!PendingDeposit.can_transition_to(Success));
        assert!(InFlight.can_transition_to(Success));
        assert!(InFlight.can_transition_to(PrivateTransferPending));
        assert!(PrivateTransferPending.can_transition_to(Success));
        assert!(!PrivateTransferPending.can_transition_to(Refunded));
        assert!(PendingDeposit.can_transition_to(Expired));
    }

    #[test]
    fn create_get_update() {
        let (_temp, store) = setup();
        let repo = ClaimRepository::new(&store);
        let claim = sample_claim("c-1");

        repo.create(&claim).unwrap();
        assert!(matches!(
            repo.create(&claim),
            Err(StorageError::AlreadyExists(_))
        ));

        let mut loaded = repo.get("c-1").unwrap();
        assert_eq!(loaded.status, ClaimStatus::Open);
        loaded.status = ClaimStatus::PendingDeposit;
        repo.update(&mut loaded).unwrap();
        assert_eq!(repo.get("c-1").unwrap().status, ClaimStatus::PendingDeposit);
    }

    #[test]
    fn list_needing_attestation_filters() {
        let (_temp, store) = setup();
        let repo = ClaimRepository::new(&store);

        let mut paid = sample_claim("paid");
        paid.status = ClaimStatus::Success;
        let mut attested = sample_claim("attested");
        attested.status = ClaimStatus::Success;
        attested.attestation_tx_hash = Some("0xabc".to_string());
        let open = sample_claim("open");

        for claim in [&paid, &attested, &open] {
            repo.create(claim).unwrap();
        }

        let pending = repo.list_needing_attestation().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "paid");
        assert_eq!(repo.list_by_status(ClaimStatus::Open).unwrap().len(), 1);
    }
}
