// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Claim State Machine
//!
//! ```text
//! OPEN -> PENDING_DEPOSIT -> IN_FLIGHT -> SUCCESS
//!                                      -> PRIVATE_TRANSFER_PENDING -> SUCCESS
//! PENDING_DEPOSIT | IN_FLIGHT -> REFUNDED
//! any non-terminal            -> EXPIRED | CANCELLED
//! ```
//!
//! Every mutation of a claim happens under the `claim:<id>` lock. Expiry is
//! checked before the provider is polled, and intent status is written only
//! when it changes. Entering `SUCCESS` hands the claim to the attestation
//! recorder in a background task, started once the claim lock is released.
//!
//! A claim settles either through a provider intent or through a companion
//! session. Sessions report their terminal outcome through
//! [`ClaimMachine::apply_session_outcome`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::attestation::AttestationRecorder;
use crate::audit_log;
use crate::blockchain::{chain_by_name, resolve_token, to_base_units};
use crate::error::{ErrorKind, SettlementError, SettlementResult};
use crate::lock::{claim_lock_key, DistributedLock, LockOutcome};
use crate::providers::{NormalizedStatus, PriceBook, QuoteRequest, QuoteSwapProvider, StatusAdapter};
use crate::storage::{
    AuditEvent, AuditEventType, ClaimRepository, ClaimStatus, FileStore, IntentExpiry,
    IntentRepository, StoredClaim, StoredIntent, StoredSession, WorkDatabase, WorkItem,
};

/// Quote validity asked from the provider when the caller gives none.
const DEFAULT_QUOTE_WINDOW: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewClaim {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// USD amount as a decimal string.
    #[schema(example = "100")]
    pub amount: String,
    #[schema(example = "USDC")]
    pub token_symbol: String,
    #[schema(example = "base")]
    pub token_chain: String,
    pub recipient_address: String,
    #[serde(default)]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    /// Chain the payer deposits on.
    pub source_chain: String,
    /// Asset the payer deposits (symbol or contract).
    pub source_asset: String,
    #[serde(default)]
    pub refund_to: Option<String>,
    /// Requested quote validity; the provider's deadline is authoritative.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

/// Terminal result of a companion session bound to a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Funds reached the recipient in `tx_hash`.
    Settled { tx_hash: String },
    /// Deposit returned to the payer in `tx_hash`.
    Refunded { tx_hash: String },
    /// Session gave up; the claim stays open for another route.
    Failed { reason: String },
}

/// What one `process_intent` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentAction {
    /// Lock held elsewhere.
    Busy,
    /// Claim already terminal or intent superseded; removed from the index.
    Retired,
    /// No new information from the provider.
    Unchanged,
    /// Claim moved to `IN_FLIGHT`.
    InFlight,
    /// Claim reached `SUCCESS` or `PRIVATE_TRANSFER_PENDING`.
    Settled(ClaimStatus),
    Refunded,
    /// Deadline passed (`Expired`) or maximum age exceeded (`TooOld`).
    Expired(ErrorKind),
}

impl IntentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentAction::Busy => "busy",
            IntentAction::Retired => "retired",
            IntentAction::Unchanged => "unchanged",
            IntentAction::InFlight => "in_flight",
            IntentAction::Settled(ClaimStatus::PrivateTransferPending) => {
                "private_transfer_pending"
            }
            IntentAction::Settled(_) => "success",
            IntentAction::Refunded => "refunded",
            IntentAction::Expired(ErrorKind::TooOld) => "too_old",
            IntentAction::Expired(_) => "expired",
        }
    }
}

pub struct ClaimMachine {
    storage: Arc<FileStore>,
    work_db: Arc<WorkDatabase>,
    lock: DistributedLock,
    quotes: Arc<dyn QuoteSwapProvider>,
    status: StatusAdapter,
    prices: Arc<PriceBook>,
    recorder: AttestationRecorder,
    intent_max_age: chrono::Duration,
}

impl ClaimMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<FileStore>,
        work_db: Arc<WorkDatabase>,
        lock: DistributedLock,
        quotes: Arc<dyn QuoteSwapProvider>,
        prices: Arc<PriceBook>,
        recorder: AttestationRecorder,
        intent_max_age: chrono::Duration,
    ) -> Self {
        Self {
            storage,
            work_db,
            lock,
            status: StatusAdapter::new(quotes.clone()),
            quotes,
            prices,
            recorder,
            intent_max_age,
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Register an open claim.
    pub fn create_claim(&self, request: &NewClaim) -> SettlementResult<StoredClaim> {
        let amount: Decimal = request
            .amount
            .trim()
            .parse()
            .map_err(|_| SettlementError::Validation("amount is not a decimal".to_string()))?;
        if amount <= Decimal::ZERO {
            return Err(SettlementError::Validation("amount must be positive".to_string()));
        }
        let chain = chain_by_name(&request.token_chain).ok_or_else(|| {
            SettlementError::Validation(format!("unsupported chain {}", request.token_chain))
        })?;
        if resolve_token(chain, &request.token_symbol).is_none() {
            return Err(SettlementError::Validation(format!(
                "unsupported token {} on {}",
                request.token_symbol, chain.name
            )));
        }
        request
            .recipient_address
            .trim()
            .parse::<alloy::primitives::Address>()
            .map_err(|_| SettlementError::Validation("recipientAddress is invalid".to_string()))?;

        let id = request
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut claim = StoredClaim::new_open(
            id,
            request.amount.trim().to_string(),
            request.token_symbol.to_uppercase(),
            chain.name.to_string(),
            request.recipient_address.trim().to_string(),
            request.is_private,
        );
        claim.creator_id = request.creator_id.clone();
        claim.description = request.description.clone();

        let claims = ClaimRepository::new(&self.storage);
        if claims.exists(&claim.id) {
            return Err(SettlementError::Validation(format!(
                "claim {} already exists",
                claim.id
            )));
        }
        claims.create(&claim)?;

        info!(claim_id = %claim.id, chain = %claim.token_chain, "Claim created");
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::ClaimCreated)
                .with_actor(claim.creator_id.clone().unwrap_or_else(|| "operator".into()))
                .with_resource("claim", claim.id.clone())
        );
        Ok(claim)
    }

    pub fn get_claim(&self, claim_id: &str) -> SettlementResult<StoredClaim> {
        Ok(ClaimRepository::new(&self.storage).get(claim_id)?)
    }

    pub fn intents_for(&self, claim_id: &str) -> SettlementResult<Vec<StoredIntent>> {
        Ok(IntentRepository::new(&self.storage).list_for_claim(claim_id)?)
    }

    /// Quote a settlement for an open claim and issue a deposit address.
    ///
    /// A claim already waiting for a deposit is re-quoted: the outstanding
    /// intent is superseded and leaves the pending-work index.
    pub async fn create_intent(
        &self,
        claim_id: &str,
        request: &CreateIntentRequest,
    ) -> SettlementResult<StoredIntent> {
        let outcome = self
            .lock
            .with_lock(&claim_lock_key(claim_id), self.lock.default_ttl(), || {
                self.create_intent_locked(claim_id, request)
            })
            .await?;
        outcome
            .acquired()
            .unwrap_or_else(|| Err(SettlementError::Busy(format!("claim {claim_id}"))))
    }

    async fn create_intent_locked(
        &self,
        claim_id: &str,
        request: &CreateIntentRequest,
    ) -> SettlementResult<StoredIntent> {
        let claims = ClaimRepository::new(&self.storage);
        let intents = IntentRepository::new(&self.storage);
        let mut claim = claims.get(claim_id)?;
        if !matches!(claim.status, ClaimStatus::Open | ClaimStatus::PendingDeposit) {
            return Err(SettlementError::InvalidTransition {
                from: claim.status.to_string(),
                to: ClaimStatus::PendingDeposit.to_string(),
            });
        }

        let chain = chain_by_name(&claim.token_chain).ok_or_else(|| {
            SettlementError::Validation(format!("unsupported chain {}", claim.token_chain))
        })?;
        let token = resolve_token(chain, &claim.token_symbol).ok_or_else(|| {
            SettlementError::Validation(format!("unsupported token {}", claim.token_symbol))
        })?;
        let amount_usd: Decimal = claim
            .amount
            .parse()
            .map_err(|_| SettlementError::Validation("claim amount is not a decimal".into()))?;
        let price = self.prices.usd_price(&token.symbol).await?;
        let amount_tokens = amount_usd
            .checked_div(price)
            .ok_or_else(|| SettlementError::PriceUnavailable(token.symbol.clone()))?;
        let amount_out = to_base_units(amount_tokens, token.decimals)
            .map_err(|e| SettlementError::Validation(e.to_string()))?;

        let window = request
            .deadline_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_QUOTE_WINDOW);
        let requested_deadline = Utc::now()
            + chrono::Duration::from_std(window)
                .map_err(|_| SettlementError::Validation("deadlineSecs too large".into()))?;

        let quote = self
            .quotes
            .request_quote(&QuoteRequest {
                reference: claim.id.clone(),
                origin_chain: request.source_chain.clone(),
                origin_asset: request.source_asset.clone(),
                destination_chain: chain.name.to_string(),
                destination_asset: token.address.clone().unwrap_or(token.symbol.clone()),
                amount_out: amount_out.to_string(),
                recipient: claim.recipient_address.clone(),
                refund_to: request.refund_to.clone(),
                deadline: requested_deadline,
            })
            .await?;

        self.supersede_active_intent(claim_id)?;

        let now = Utc::now();
        let intent = StoredIntent {
            id: uuid::Uuid::new_v4().to_string(),
            claim_id: claim.id.clone(),
            quote_id: quote.quote_id,
            deposit_address: quote.deposit_address,
            deposit_memo: quote.deposit_memo,
            deadline: quote.deadline,
            estimated_duration_secs: quote.estimated_duration_secs,
            status: NormalizedStatus::Pending.as_str().to_string(),
            source_chain: request.source_chain.clone(),
            destination_chain: chain.name.to_string(),
            paid_amount: None,
            last_status_payload: None,
            superseded: false,
            settlement_tx_hash: None,
            created_at: now,
            updated_at: now,
        };
        intents.create(&intent)?;
        self.work_db
            .add_pending(&WorkItem::Intent(intent.id.clone()))?;

        if claim.status == ClaimStatus::Open {
            self.transition(&mut claim, ClaimStatus::PendingDeposit)?;
            claims.update(&mut claim)?;
        }

        info!(
            claim_id = %claim.id,
            intent_id = %intent.id,
            deadline = %intent.deadline,
            "Settlement intent created"
        );
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::IntentCreated)
                .with_actor("engine")
                .with_resource("intent", intent.id.clone())
                .with_details(json!({ "claimId": claim.id, "quoteId": intent.quote_id }))
        );
        Ok(intent)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Advance the claim owning `intent_id` by one step.
    pub async fn process_intent(&self, intent_id: &str) -> SettlementResult<IntentAction> {
        let claim_id = IntentRepository::new(&self.storage).get(intent_id)?.claim_id;
        let outcome = self
            .lock
            .with_lock(&claim_lock_key(&claim_id), self.lock.default_ttl(), || {
                self.process_locked(intent_id)
            })
            .await?;
        let action = match outcome {
            LockOutcome::Acquired(result) => result?,
            LockOutcome::NotAcquired => return Ok(IntentAction::Busy),
        };
        if action == IntentAction::Settled(ClaimStatus::Success) {
            self.spawn_attestation(&claim_id);
        }
        Ok(action)
    }

    async fn process_locked(&self, intent_id: &str) -> SettlementResult<IntentAction> {
        let claims = ClaimRepository::new(&self.storage);
        let intents = IntentRepository::new(&self.storage);
        let mut intent = intents.get(intent_id)?;
        let mut claim = claims.get(&intent.claim_id)?;

        if intent.superseded || claim.status.is_terminal() {
            self.retire(&intent)?;
            return Ok(IntentAction::Retired);
        }

        let now = Utc::now();
        if let Some(expiry) = intent.expiry_at(now, self.intent_max_age) {
            let reason = match expiry {
                IntentExpiry::Deadline => SettlementError::Expired(intent.id.clone()),
                IntentExpiry::MaxAge => SettlementError::TooOld(intent.id.clone()),
            };
            return self.expire(&mut claim, &mut intent, reason);
        }

        let snapshot = self
            .status
            .poll(&intent.deposit_address, intent.deposit_memo.as_deref())
            .await?;

        let status_str = snapshot.status.as_str();
        if intent.status != status_str || intent.paid_amount != snapshot.deposited_amount {
            intent.status = status_str.to_string();
            intent.paid_amount = snapshot.deposited_amount.clone();
            intent.settlement_tx_hash = snapshot
                .settlement_tx_hash
                .clone()
                .or(intent.settlement_tx_hash.take());
            intent.last_status_payload = Some(snapshot.payload.clone());
            intents.update(&mut intent)?;
        }

        match snapshot.status {
            NormalizedStatus::Pending => Ok(IntentAction::Unchanged),
            NormalizedStatus::Processing => {
                if claim.status == ClaimStatus::InFlight {
                    return Ok(IntentAction::Unchanged);
                }
                let previous = claim.status;
                self.transition(&mut claim, ClaimStatus::InFlight)?;
                claims.update(&mut claim)?;
                self.audit_transition(&claim, previous);
                Ok(IntentAction::InFlight)
            }
            NormalizedStatus::Complete => {
                let previous = claim.status;
                if claim.status == ClaimStatus::PendingDeposit {
                    self.transition(&mut claim, ClaimStatus::InFlight)?;
                }
                let next = if claim.is_private {
                    ClaimStatus::PrivateTransferPending
                } else {
                    ClaimStatus::Success
                };
                self.transition(&mut claim, next)?;
                claim.paid_at = Some(now);
                claim.execution_ref = Some(
                    intent
                        .settlement_tx_hash
                        .clone()
                        .unwrap_or_else(|| intent.quote_id.clone()),
                );
                claims.update(&mut claim)?;
                self.retire(&intent)?;
                self.audit_transition(&claim, previous);
                Ok(IntentAction::Settled(next))
            }
            NormalizedStatus::Failed => {
                let previous = claim.status;
                self.transition(&mut claim, ClaimStatus::Refunded)?;
                claims.update(&mut claim)?;
                self.retire(&intent)?;
                self.audit_transition(&claim, previous);
                Ok(IntentAction::Refunded)
            }
        }
    }

    fn expire(
        &self,
        claim: &mut StoredClaim,
        intent: &mut StoredIntent,
        reason: SettlementError,
    ) -> SettlementResult<IntentAction> {
        let kind = reason.kind();
        let previous = claim.status;
        self.transition(claim, ClaimStatus::Expired)?;
        ClaimRepository::new(&self.storage).update(claim)?;

        intent.status = "EXPIRED".to_string();
        IntentRepository::new(&self.storage).update(intent)?;
        self.retire(intent)?;

        info!(claim_id = %claim.id, intent_id = %intent.id, reason = %reason, "Claim expired");
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::IntentExpired)
                .with_actor("engine")
                .with_resource("intent", intent.id.clone())
                .with_details(json!({ "reason": kind }))
        );
        self.audit_transition(claim, previous);
        Ok(IntentAction::Expired(kind))
    }

    // =========================================================================
    // Operator triggers
    // =========================================================================

    /// Cancel a non-terminal claim.
    pub async fn cancel(&self, claim_id: &str, actor: &str) -> SettlementResult<StoredClaim> {
        let outcome = self
            .lock
            .with_lock(&claim_lock_key(claim_id), self.lock.default_ttl(), || {
                self.cancel_locked(claim_id, actor)
            })
            .await?;
        outcome
            .acquired()
            .unwrap_or_else(|| Err(SettlementError::Busy(format!("claim {claim_id}"))))
    }

    async fn cancel_locked(&self, claim_id: &str, actor: &str) -> SettlementResult<StoredClaim> {
        let claims = ClaimRepository::new(&self.storage);
        let intents = IntentRepository::new(&self.storage);
        let mut claim = claims.get(claim_id)?;
        let previous = claim.status;
        self.transition(&mut claim, ClaimStatus::Cancelled)?;
        claims.update(&mut claim)?;

        if let Some(mut intent) = intents.active_for_claim(claim_id)? {
            intent.status = "CANCELLED".to_string();
            intents.update(&mut intent)?;
            self.retire(&intent)?;
        }

        info!(claim_id = %claim_id, actor = %actor, "Claim cancelled");
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::OperatorTrigger)
                .with_actor(actor.to_string())
                .with_resource("claim", claim_id.to_string())
                .with_details(json!({ "action": "cancel" }))
        );
        self.audit_transition(&claim, previous);
        Ok(claim)
    }

    /// Mark the out-of-band private transfer of a claim as done.
    pub async fn complete_private_transfer(
        &self,
        claim_id: &str,
        execution_ref: &str,
        actor: &str,
    ) -> SettlementResult<StoredClaim> {
        let execution_ref = execution_ref.trim();
        if execution_ref.is_empty() {
            return Err(SettlementError::Validation("executionRef is required".into()));
        }
        let outcome = self
            .lock
            .with_lock(&claim_lock_key(claim_id), self.lock.default_ttl(), || {
                self.complete_private_locked(claim_id, execution_ref, actor)
            })
            .await?;
        let claim = outcome
            .acquired()
            .unwrap_or_else(|| Err(SettlementError::Busy(format!("claim {claim_id}"))))?;
        self.spawn_attestation(&claim.id);
        Ok(claim)
    }

    async fn complete_private_locked(
        &self,
        claim_id: &str,
        execution_ref: &str,
        actor: &str,
    ) -> SettlementResult<StoredClaim> {
        let claims = ClaimRepository::new(&self.storage);
        let mut claim = claims.get(claim_id)?;
        let previous = claim.status;
        if previous != ClaimStatus::PrivateTransferPending {
            return Err(SettlementError::InvalidTransition {
                from: previous.to_string(),
                to: ClaimStatus::Success.to_string(),
            });
        }
        self.transition(&mut claim, ClaimStatus::Success)?;
        claim.execution_ref = Some(execution_ref.to_string());
        claims.update(&mut claim)?;

        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::OperatorTrigger)
                .with_actor(actor.to_string())
                .with_resource("claim", claim_id.to_string())
                .with_details(json!({ "action": "complete_private_transfer" }))
        );
        self.audit_transition(&claim, previous);
        Ok(claim)
    }

    // =========================================================================
    // Companion sessions
    // =========================================================================

    /// Bind a companion session to a claim before the session is persisted.
    ///
    /// The session must deliver the claim's token on the claim's chain to the
    /// claim's recipient. An open claim moves to `PENDING_DEPOSIT`.
    pub async fn attach_session(
        &self,
        claim_id: &str,
        session: &StoredSession,
    ) -> SettlementResult<()> {
        let outcome = self
            .lock
            .with_lock(&claim_lock_key(claim_id), self.lock.default_ttl(), || {
                self.attach_session_locked(claim_id, session)
            })
            .await?;
        outcome
            .acquired()
            .unwrap_or_else(|| Err(SettlementError::Busy(format!("claim {claim_id}"))))
    }

    async fn attach_session_locked(
        &self,
        claim_id: &str,
        session: &StoredSession,
    ) -> SettlementResult<()> {
        let claims = ClaimRepository::new(&self.storage);
        let mut claim = claims.get(claim_id)?;
        if !matches!(claim.status, ClaimStatus::Open | ClaimStatus::PendingDeposit) {
            return Err(SettlementError::InvalidTransition {
                from: claim.status.to_string(),
                to: ClaimStatus::PendingDeposit.to_string(),
            });
        }
        let claim_chain = chain_by_name(&claim.token_chain).map(|chain| chain.chain_id);
        if claim_chain != Some(session.chain_id)
            || !claim.token_symbol.eq_ignore_ascii_case(&session.to_token.symbol)
        {
            return Err(SettlementError::Validation(format!(
                "session must deliver {} on {}",
                claim.token_symbol, claim.token_chain
            )));
        }
        if !claim
            .recipient_address
            .trim()
            .eq_ignore_ascii_case(session.recipient.trim())
        {
            return Err(SettlementError::Validation(
                "session recipient differs from the claim recipient".to_string(),
            ));
        }

        if claim.status == ClaimStatus::Open {
            let previous = claim.status;
            self.transition(&mut claim, ClaimStatus::PendingDeposit)?;
            claims.update(&mut claim)?;
            self.audit_transition(&claim, previous);
        }
        info!(claim_id = %claim_id, session_key = %session.session_key, "Companion session attached");
        Ok(())
    }

    /// Apply the terminal outcome of a companion session to its claim.
    ///
    /// Returns the claim status afterwards. A claim that already left the
    /// deposit stage through another route is left untouched.
    pub async fn apply_session_outcome(
        &self,
        claim_id: &str,
        session_key: &str,
        outcome: &SessionOutcome,
    ) -> SettlementResult<ClaimStatus> {
        let locked = self
            .lock
            .with_lock(&claim_lock_key(claim_id), self.lock.default_ttl(), || {
                self.apply_session_outcome_locked(claim_id, session_key, outcome)
            })
            .await?;
        let status = locked
            .acquired()
            .unwrap_or_else(|| Err(SettlementError::Busy(format!("claim {claim_id}"))))?;
        if status == ClaimStatus::Success && matches!(outcome, SessionOutcome::Settled { .. }) {
            self.spawn_attestation(claim_id);
        }
        Ok(status)
    }

    async fn apply_session_outcome_locked(
        &self,
        claim_id: &str,
        session_key: &str,
        outcome: &SessionOutcome,
    ) -> SettlementResult<ClaimStatus> {
        let claims = ClaimRepository::new(&self.storage);
        let mut claim = claims.get(claim_id)?;
        let previous = claim.status;

        if let SessionOutcome::Failed { reason } = outcome {
            warn!(claim_id = %claim_id, session_key = %session_key, "Companion session failed, claim stays open");
            audit_log!(
                &self.storage,
                AuditEvent::new(AuditEventType::SessionFailed)
                    .with_actor("engine")
                    .with_resource("claim", claim_id.to_string())
                    .with_details(json!({ "sessionKey": session_key }))
                    .failed(reason.clone())
            );
            return Ok(previous);
        }

        if !matches!(previous, ClaimStatus::PendingDeposit | ClaimStatus::InFlight) {
            warn!(
                claim_id = %claim_id,
                session_key = %session_key,
                status = %previous,
                "Session outcome not applied, claim already moved on"
            );
            return Ok(previous);
        }

        match outcome {
            SessionOutcome::Settled { tx_hash } => {
                if previous == ClaimStatus::PendingDeposit {
                    self.transition(&mut claim, ClaimStatus::InFlight)?;
                }
                let next = if claim.is_private {
                    ClaimStatus::PrivateTransferPending
                } else {
                    ClaimStatus::Success
                };
                self.transition(&mut claim, next)?;
                claim.paid_at = Some(Utc::now());
                claim.execution_ref = Some(tx_hash.clone());
            }
            SessionOutcome::Refunded { .. } => {
                self.transition(&mut claim, ClaimStatus::Refunded)?;
            }
            SessionOutcome::Failed { .. } => return Ok(previous),
        }
        claims.update(&mut claim)?;
        self.supersede_active_intent(claim_id)?;

        info!(
            claim_id = %claim_id,
            session_key = %session_key,
            status = %claim.status,
            "Claim settled by companion session"
        );
        self.audit_transition(&claim, previous);
        Ok(claim.status)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn transition(&self, claim: &mut StoredClaim, next: ClaimStatus) -> SettlementResult<()> {
        if !claim.status.can_transition_to(next) {
            return Err(SettlementError::InvalidTransition {
                from: claim.status.to_string(),
                to: next.to_string(),
            });
        }
        claim.status = next;
        Ok(())
    }

    /// Flag the claim's outstanding intent as superseded and stop polling it.
    fn supersede_active_intent(&self, claim_id: &str) -> SettlementResult<()> {
        let intents = IntentRepository::new(&self.storage);
        if let Some(mut previous) = intents.active_for_claim(claim_id)? {
            previous.superseded = true;
            intents.update(&mut previous)?;
            self.retire(&previous)?;
            debug!(claim_id = %claim_id, intent_id = %previous.id, "Intent superseded");
        }
        Ok(())
    }

    fn retire(&self, intent: &StoredIntent) -> SettlementResult<()> {
        self.work_db
            .remove_pending(&WorkItem::Intent(intent.id.clone()))?;
        Ok(())
    }

    fn audit_transition(&self, claim: &StoredClaim, from: ClaimStatus) {
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::ClaimTransitioned)
                .with_actor("engine")
                .with_resource("claim", claim.id.clone())
                .with_details(json!({ "from": from, "to": claim.status }))
        );
    }

    /// Attest in the background; the sweep picks up anything that fails here.
    fn spawn_attestation(&self, claim_id: &str) {
        let recorder = self.recorder.clone();
        let claim_id = claim_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = recorder.attest(&claim_id).await {
                warn!(claim_id = %claim_id, %error, "Attestation deferred to sweep");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::InMemoryLedger;
    use crate::lock::{MemoryLockStore, DEFAULT_LOCK_TTL};
    use crate::providers::{
        PreparedSwap, ProviderError, Quote, RawStatusResponse, StaticPrices, SwapRequest,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedProvider {
        status: Mutex<Result<String, String>>,
        deadline_offset: chrono::Duration,
        polls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                status: Mutex::new(Ok("PENDING_DEPOSIT".to_string())),
                deadline_offset: chrono::Duration::minutes(30),
                polls: AtomicUsize::new(0),
            }
        }

        fn set(&self, status: &str) {
            *self.status.lock().unwrap() = Ok(status.to_string());
        }

        fn fail_network(&self) {
            *self.status.lock().unwrap() = Err("timeout".to_string());
        }
    }

    #[async_trait]
    impl QuoteSwapProvider for ScriptedProvider {
        async fn request_quote(&self, request: &QuoteRequest) -> Result<Quote, ProviderError> {
            Ok(Quote {
                quote_id: format!("q-{}", request.reference),
                deposit_address: format!("0xdeposit-{}", uuid::Uuid::new_v4()),
                deposit_memo: None,
                deadline: Utc::now() + self.deadline_offset,
                estimated_duration_secs: Some(60),
                amount_in: None,
            })
        }

        async fn fetch_status(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<RawStatusResponse, ProviderError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            match self.status.lock().unwrap().clone() {
                Ok(status) => Ok(RawStatusResponse {
                    payload: json!({ "status": status }),
                    status,
                    deposited_amount: None,
                    expected_amount: None,
                    settlement_tx_hash: Some("0xsettled".to_string()),
                }),
                Err(msg) => Err(ProviderError::Request(msg)),
            }
        }

        async fn prepare_swap(&self, _: &SwapRequest) -> Result<PreparedSwap, ProviderError> {
            Err(ProviderError::MissingConfig("unused".into()))
        }
    }

    struct Harness {
        _temp: TempDir,
        storage: Arc<FileStore>,
        work_db: Arc<WorkDatabase>,
        provider: Arc<ScriptedProvider>,
        machine: ClaimMachine,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(FileStore::open(temp.path()).unwrap());
        let work_db = Arc::new(WorkDatabase::open(&temp.path().join("work.redb")).unwrap());
        let lock = DistributedLock::new(Arc::new(MemoryLockStore::new()), DEFAULT_LOCK_TTL);
        let provider = Arc::new(ScriptedProvider::new());
        let recorder = AttestationRecorder::new(
            storage.clone(),
            lock.clone(),
            Some(Arc::new(InMemoryLedger::new())),
        );
        let machine = ClaimMachine::new(
            storage.clone(),
            work_db.clone(),
            lock,
            provider.clone(),
            Arc::new(PriceBook::new(StaticPrices::new(HashMap::new()), None)),
            recorder,
            chrono::Duration::days(30),
        );
        Harness {
            _temp: temp,
            storage,
            work_db,
            provider,
            machine,
        }
    }

    fn new_claim(is_private: bool) -> NewClaim {
        NewClaim {
            id: None,
            amount: "100".into(),
            token_symbol: "usdc".into(),
            token_chain: "base".into(),
            recipient_address: "0x1111111111111111111111111111111111111111".into(),
            creator_id: None,
            description: None,
            is_private,
        }
    }

    fn intent_request() -> CreateIntentRequest {
        CreateIntentRequest {
            source_chain: "ethereum".into(),
            source_asset: "ETH".into(),
            refund_to: None,
            deadline_secs: None,
        }
    }

    #[tokio::test]
    async fn create_claim_validates_input() {
        let h = harness();
        let mut request = new_claim(false);
        request.amount = "-5".into();
        assert_eq!(
            h.machine.create_claim(&request).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut request = new_claim(false);
        request.token_chain = "solana".into();
        assert_eq!(
            h.machine.create_claim(&request).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        assert_eq!(claim.status, ClaimStatus::Open);
        assert_eq!(claim.token_symbol, "USDC");
    }

    #[tokio::test]
    async fn intent_moves_claim_to_pending_deposit() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        assert_eq!(h.machine.get_claim(&claim.id).unwrap().status, ClaimStatus::PendingDeposit);
        assert!(h.work_db.is_pending(&WorkItem::Intent(intent.id)).unwrap());
    }

    #[tokio::test]
    async fn requote_supersedes_previous_intent() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let first = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();
        let second = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        let intents = h.machine.intents_for(&claim.id).unwrap();
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().any(|i| i.id == first.id && i.superseded));
        assert!(!h.work_db.is_pending(&WorkItem::Intent(first.id)).unwrap());
        assert!(h.work_db.is_pending(&WorkItem::Intent(second.id)).unwrap());
    }

    #[tokio::test]
    async fn processing_then_completion_reaches_success() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        h.provider.set("KNOWN_DEPOSIT_TX");
        assert_eq!(h.machine.process_intent(&intent.id).await.unwrap(), IntentAction::InFlight);
        h.provider.set("PROCESSING");
        assert_eq!(h.machine.process_intent(&intent.id).await.unwrap(), IntentAction::Unchanged);

        h.provider.set("SUCCESS");
        assert_eq!(
            h.machine.process_intent(&intent.id).await.unwrap(),
            IntentAction::Settled(ClaimStatus::Success)
        );
        let claim = h.machine.get_claim(&claim.id).unwrap();
        assert_eq!(claim.status, ClaimStatus::Success);
        assert_eq!(claim.execution_ref.as_deref(), Some("0xsettled"));
        assert!(claim.paid_at.is_some());
        assert!(h.work_db.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_is_written_only_on_change() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        h.machine.process_intent(&intent.id).await.unwrap();
        let first = IntentRepository::new(&h.storage).get(&intent.id).unwrap();
        h.machine.process_intent(&intent.id).await.unwrap();
        let second = IntentRepository::new(&h.storage).get(&intent.id).unwrap();
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn private_claim_waits_for_private_transfer() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(true)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        h.provider.set("SUCCESS");
        assert_eq!(
            h.machine.process_intent(&intent.id).await.unwrap(),
            IntentAction::Settled(ClaimStatus::PrivateTransferPending)
        );

        let claim = h
            .machine
            .complete_private_transfer(&claim.id, "0xprivate", "ops")
            .await
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Success);
        assert_eq!(claim.execution_ref.as_deref(), Some("0xprivate"));
    }

    #[tokio::test]
    async fn failed_settlement_refunds_claim() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        h.provider.set("REFUNDED");
        assert_eq!(h.machine.process_intent(&intent.id).await.unwrap(), IntentAction::Refunded);
        assert_eq!(h.machine.get_claim(&claim.id).unwrap().status, ClaimStatus::Refunded);
    }

    #[tokio::test]
    async fn transient_error_keeps_state() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        h.provider.fail_network();
        let err = h.machine.process_intent(&intent.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(h.machine.get_claim(&claim.id).unwrap().status, ClaimStatus::PendingDeposit);
        assert!(h.work_db.is_pending(&WorkItem::Intent(intent.id)).unwrap());
    }

    #[tokio::test]
    async fn passed_deadline_expires_without_polling() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let mut intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();
        intent.deadline = Utc::now() - chrono::Duration::minutes(7);
        IntentRepository::new(&h.storage).update(&mut intent).unwrap();

        assert_eq!(
            h.machine.process_intent(&intent.id).await.unwrap(),
            IntentAction::Expired(ErrorKind::Expired)
        );
        assert_eq!(h.provider.polls.load(Ordering::SeqCst), 0);
        assert_eq!(h.machine.get_claim(&claim.id).unwrap().status, ClaimStatus::Expired);
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_guarded() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        let cancelled = h.machine.cancel(&claim.id, "ops").await.unwrap();
        assert_eq!(cancelled.status, ClaimStatus::Cancelled);
        assert!(!h.work_db.is_pending(&WorkItem::Intent(intent.id.clone())).unwrap());

        let err = h.machine.cancel(&claim.id, "ops").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(h.machine.process_intent(&intent.id).await.unwrap(), IntentAction::Retired);
        assert_eq!(h.provider.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn session_settlement_supersedes_open_intent() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(true)).unwrap();
        let intent = h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        let outcome = SessionOutcome::Settled {
            tx_hash: "0xcompanion".to_string(),
        };
        let status = h
            .machine
            .apply_session_outcome(&claim.id, "session-1", &outcome)
            .await
            .unwrap();
        assert_eq!(status, ClaimStatus::PrivateTransferPending);

        let claim = h.machine.get_claim(&claim.id).unwrap();
        assert_eq!(claim.execution_ref.as_deref(), Some("0xcompanion"));
        assert!(!h.work_db.is_pending(&WorkItem::Intent(intent.id.clone())).unwrap());
        assert_eq!(h.machine.process_intent(&intent.id).await.unwrap(), IntentAction::Retired);
    }

    #[tokio::test]
    async fn session_outcome_leaves_moved_on_claim_alone() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        h.machine.cancel(&claim.id, "ops").await.unwrap();

        let outcome = SessionOutcome::Refunded {
            tx_hash: "0xrefund".to_string(),
        };
        let status = h
            .machine
            .apply_session_outcome(&claim.id, "session-1", &outcome)
            .await
            .unwrap();
        assert_eq!(status, ClaimStatus::Cancelled);
    }

    #[tokio::test]
    async fn failed_session_keeps_claim_status() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        h.machine.create_intent(&claim.id, &intent_request()).await.unwrap();

        let outcome = SessionOutcome::Failed {
            reason: "reverted".to_string(),
        };
        let status = h
            .machine
            .apply_session_outcome(&claim.id, "session-1", &outcome)
            .await
            .unwrap();
        assert_eq!(status, ClaimStatus::PendingDeposit);
        assert_eq!(h.machine.get_claim(&claim.id).unwrap().status, ClaimStatus::PendingDeposit);
    }

    #[tokio::test]
    async fn session_outcome_while_locked_is_busy() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        assert!(h
            .machine
            .lock
            .acquire(&claim_lock_key(&claim.id), DEFAULT_LOCK_TTL)
            .await
            .unwrap());
        let outcome = SessionOutcome::Refunded {
            tx_hash: "0xrefund".to_string(),
        };
        let err = h
            .machine
            .apply_session_outcome(&claim.id, "session-1", &outcome)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[tokio::test]
    async fn cancel_while_locked_is_busy() {
        let h = harness();
        let claim = h.machine.create_claim(&new_claim(false)).unwrap();
        assert!(h
            .machine
            .lock
            .acquire(&claim_lock_key(&claim.id), DEFAULT_LOCK_TTL)
            .await
            .unwrap());
        let err = h.machine.cancel(&claim.id, "ops").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }
}
