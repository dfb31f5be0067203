// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Attestation Ledger
//!
//! Append-only record of paid claims and payout-run receipts. Only hashes
//! and opaque references are stored: the claim amount, token and recipient
//! never leave this service.
//!
//! Ledger rules:
//! - one payment record per claim id; a second `record_payment` is rejected
//! - commitments are exactly 32 bytes
//! - receipts are idempotent by run id; `(authorizer_id, nonce)` is single-use
//! - an optional allowed caller restricts who may write

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use alloy::{
    primitives::{Address, Bytes, B256, U256},
    sol,
    sol_types::SolCall,
};
use async_trait::async_trait;
use serde::Serialize;
use utoipa::ToSchema;

use crate::blockchain::{ChainClient, ChainConfig, ChainError, EphemeralKey, TxBuilder};
use crate::error::SettlementError;

sol! {
    #[sol(rpc)]
    interface IPaymentAttestation {
        function recordPayment(string claimId, string executionRef, bytes32 commitment) external;
        function getPayment(string claimId) external view returns (bool exists, string executionRef, bytes32 commitment, uint64 timestamp);
        function recordReceipt(string runId, bytes32 batchHash, string authorizerId, uint64 nonce, string executorId, string status, bytes32 txRefsHash) external;
        function getReceipt(string runId) external view returns (bool exists, bytes32 batchHash, string authorizerId, uint64 nonce, string executorId, string status, bytes32 txRefsHash, uint64 timestamp);
        function isNonceUsed(string authorizerId, uint64 nonce) external view returns (bool);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("attestation for claim {0} already exists")]
    AlreadyRecorded(String),

    #[error("nonce {nonce} already used for authorizer {authorizer_id}")]
    NonceUsed { authorizer_id: String, nonce: u64 },

    #[error("caller {0} may not write to the ledger")]
    Unauthorized(String),

    #[error("commitment must be 32 bytes, got {0}")]
    InvalidCommitment(usize),

    #[error("ledger submission failed: {0}")]
    Submission(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<LedgerError> for SettlementError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(msg) => SettlementError::Transient(msg),
            other => SettlementError::ExecutionFailed(other.to_string()),
        }
    }
}

impl From<ChainError> for LedgerError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Rpc(msg) => LedgerError::Unavailable(msg),
            other => LedgerError::Submission(other.to_string()),
        }
    }
}

/// On-chain payment attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub claim_id: String,
    pub execution_ref: String,
    #[schema(value_type = String)]
    pub commitment: B256,
    /// Block timestamp, seconds.
    pub timestamp: u64,
}

/// Hash-only receipt for a payout run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    pub run_id: String,
    #[schema(value_type = String)]
    pub batch_hash: B256,
    pub authorizer_id: String,
    pub nonce: u64,
    pub executor_id: String,
    pub status: String,
    #[schema(value_type = String)]
    pub tx_refs_hash: B256,
    pub timestamp: u64,
}

#[async_trait]
pub trait AttestationLedger: Send + Sync {
    /// Record a payment commitment. Returns the transaction reference.
    async fn record_payment(
        &self,
        claim_id: &str,
        execution_ref: &str,
        commitment: &[u8],
    ) -> Result<String, LedgerError>;

    async fn get_payment(&self, claim_id: &str) -> Result<Option<PaymentRecord>, LedgerError>;

    /// Record a run receipt. Returns the transaction reference; a repeated
    /// run id is a no-op.
    async fn record_receipt(&self, receipt: &ReceiptRecord) -> Result<String, LedgerError>;

    async fn get_receipt(&self, run_id: &str) -> Result<Option<ReceiptRecord>, LedgerError>;

    async fn is_nonce_used(&self, authorizer_id: &str, nonce: u64) -> Result<bool, LedgerError>;
}

// =============================================================================
// In-memory ledger
// =============================================================================

#[derive(Default)]
struct LedgerState {
    payments: HashMap<String, PaymentRecord>,
    receipts: HashMap<String, ReceiptRecord>,
    used_nonces: HashSet<(String, u64)>,
    sequence: u64,
}

/// Process-local ledger with the same rules as the contract.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    allowed_caller: Option<String>,
    caller: Option<String>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that only accepts writes from `allowed`, written to as `caller`.
    pub fn restricted(allowed: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            state: Mutex::default(),
            allowed_caller: Some(allowed.into()),
            caller: Some(caller.into()),
        }
    }

    fn check_caller(&self) -> Result<(), LedgerError> {
        match (&self.allowed_caller, &self.caller) {
            (Some(allowed), Some(caller)) if allowed == caller => Ok(()),
            (Some(_), caller) => Err(LedgerError::Unauthorized(
                caller.clone().unwrap_or_default(),
            )),
            (None, _) => Ok(()),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger state poisoned".to_string()))
    }

    /// Number of payment records, for assertions in tests and tools.
    pub fn payment_count(&self) -> usize {
        self.state().map(|s| s.payments.len()).unwrap_or(0)
    }
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

#[async_trait]
impl AttestationLedger for InMemoryLedger {
    async fn record_payment(
        &self,
        claim_id: &str,
        execution_ref: &str,
        commitment: &[u8],
    ) -> Result<String, LedgerError> {
        self.check_caller()?;
        if commitment.len() != 32 {
            return Err(LedgerError::InvalidCommitment(commitment.len()));
        }
        let mut state = self.state()?;
        if state.payments.contains_key(claim_id) {
            return Err(LedgerError::AlreadyRecorded(claim_id.to_string()));
        }
        state.sequence += 1;
        let tx_ref = format!("mem-{}", state.sequence);
        state.payments.insert(
            claim_id.to_string(),
            PaymentRecord {
                claim_id: claim_id.to_string(),
                execution_ref: execution_ref.to_string(),
                commitment: B256::from_slice(commitment),
                timestamp: now_secs(),
            },
        );
        Ok(tx_ref)
    }

    async fn get_payment(&self, claim_id: &str) -> Result<Option<PaymentRecord>, LedgerError> {
        Ok(self.state()?.payments.get(claim_id).cloned())
    }

    async fn record_receipt(&self, receipt: &ReceiptRecord) -> Result<String, LedgerError> {
        self.check_caller()?;
        let mut state = self.state()?;
        if state.receipts.contains_key(&receipt.run_id) {
            return Ok(format!("mem-receipt-{}", receipt.run_id));
        }
        let nonce_key = (receipt.authorizer_id.clone(), receipt.nonce);
        if state.used_nonces.contains(&nonce_key) {
            return Err(LedgerError::NonceUsed {
                authorizer_id: receipt.authorizer_id.clone(),
                nonce: receipt.nonce,
            });
        }
        state.used_nonces.insert(nonce_key);
        let mut stored = receipt.clone();
        stored.timestamp = now_secs();
        state.receipts.insert(receipt.run_id.clone(), stored);
        Ok(format!("mem-receipt-{}", receipt.run_id))
    }

    async fn get_receipt(&self, run_id: &str) -> Result<Option<ReceiptRecord>, LedgerError> {
        Ok(self.state()?.receipts.get(run_id).cloned())
    }

    async fn is_nonce_used(&self, authorizer_id: &str, nonce: u64) -> Result<bool, LedgerError> {
        Ok(self
            .state()?
            .used_nonces
            .contains(&(authorizer_id.to_string(), nonce)))
    }
}

// =============================================================================
// EVM contract ledger
// =============================================================================

/// Attestation contract on an EVM chain, written by a service key.
pub struct EvmAttestationLedger {
    chain: &'static ChainConfig,
    rpc_url: String,
    contract: Address,
    signer: EphemeralKey,
}

impl EvmAttestationLedger {
    pub fn new(
        chain: &'static ChainConfig,
        rpc_url: String,
        contract: &str,
        signer: EphemeralKey,
    ) -> Result<Self, ChainError> {
        let contract = contract
            .trim()
            .parse()
            .map_err(|e| ChainError::InvalidAddress(format!("{contract}: {e}")))?;
        Ok(Self {
            chain,
            rpc_url,
            contract,
            signer,
        })
    }

    fn reader(&self) -> Result<ChainClient, ChainError> {
        ChainClient::new(self.chain, &self.rpc_url)
    }

    async fn submit(&self, calldata: Vec<u8>) -> Result<String, LedgerError> {
        let builder = TxBuilder::new(self.chain, &self.rpc_url, self.signer.wallet())?;
        let result = builder
            .send_call(
                &self.contract.to_string(),
                Bytes::from(calldata),
                U256::ZERO,
                None,
            )
            .await?;
        Ok(result.tx_hash)
    }
}

#[async_trait]
impl AttestationLedger for EvmAttestationLedger {
    async fn record_payment(
        &self,
        claim_id: &str,
        execution_ref: &str,
        commitment: &[u8],
    ) -> Result<String, LedgerError> {
        if commitment.len() != 32 {
            return Err(LedgerError::InvalidCommitment(commitment.len()));
        }
        if self.get_payment(claim_id).await?.is_some() {
            return Err(LedgerError::AlreadyRecorded(claim_id.to_string()));
        }
        let call = IPaymentAttestation::recordPaymentCall {
            claimId: claim_id.to_string(),
            executionRef: execution_ref.to_string(),
            commitment: B256::from_slice(commitment),
        };
        self.submit(call.abi_encode()).await
    }

    async fn get_payment(&self, claim_id: &str) -> Result<Option<PaymentRecord>, LedgerError> {
        let client = self.reader()?;
        let contract = IPaymentAttestation::new(self.contract, client.provider().clone());
        let record = contract
            .getPayment(claim_id.to_string())
            .call()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(record.exists.then(|| PaymentRecord {
            claim_id: claim_id.to_string(),
            execution_ref: record.executionRef,
            commitment: record.commitment,
            timestamp: record.timestamp,
        }))
    }

    async fn record_receipt(&self, receipt: &ReceiptRecord) -> Result<String, LedgerError> {
        if self
            .is_nonce_used(&receipt.authorizer_id, receipt.nonce)
            .await?
            && self.get_receipt(&receipt.run_id).await?.is_none()
        {
            return Err(LedgerError::NonceUsed {
                authorizer_id: receipt.authorizer_id.clone(),
                nonce: receipt.nonce,
            });
        }
        let call = IPaymentAttestation::recordReceiptCall {
            runId: receipt.run_id.clone(),
            batchHash: receipt.batch_hash,
            authorizerId: receipt.authorizer_id.clone(),
            nonce: receipt.nonce,
            executorId: receipt.executor_id.clone(),
            status: receipt.status.clone(),
            txRefsHash: receipt.tx_refs_hash,
        };
        self.submit(call.abi_encode()).await
    }

    async fn get_receipt(&self, run_id: &str) -> Result<Option<ReceiptRecord>, LedgerError> {
        let client = self.reader()?;
        let contract = IPaymentAttestation::new(self.contract, client.provider().clone());
        let record = contract
            .getReceipt(run_id.to_string())
            .call()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(record.exists.then(|| ReceiptRecord {
            run_id: run_id.to_string(),
            batch_hash: record.batchHash,
            authorizer_id: record.authorizerId,
            nonce: record.nonce,
            executor_id: record.executorId,
            status: record.status,
            tx_refs_hash: record.txRefsHash,
            timestamp: record.timestamp,
        }))
    }

    async fn is_nonce_used(&self, authorizer_id: &str, nonce: u64) -> Result<bool, LedgerError> {
        let client = self.reader()?;
        let contract = IPaymentAttestation::new(self.contract, client.provider().clone());
        contract
            .isNonceUsed(authorizer_id.to_string(), nonce)
            .call()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }
}
