// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Companion Wallet Manager
//!
//! A companion session is a one-off secp256k1 wallet that receives the
//! payer's deposit, converts it on the same chain and forwards the result to
//! the recipient. The manager is the only component that ever loads the
//! session key.
//!
//! ## Amounts
//!
//! For a target of `T` destination tokens:
//!
//! ```text
//! swap_input = T * price(to) / price(from)            (source units, rounded up)
//! fee        = swap_input * fee_bps / 10_000          (0 without a treasury)
//! buffer     = swap_input * deposit_buffer_bps / 10_000
//! required   = swap_input + fee + buffer + gas_reserve
//! ```
//!
//! The payer is asked for `required`; execution needs
//! `swap_input + fee + gas_reserve`. The gas reserve applies to native
//! source tokens only. An ERC-20 deposit carries no gas of its own, so those
//! sessions need a gas sponsor: before the first chain transaction the
//! sponsor sends `gas_reserve_wei` of the native token to the session
//! address. Without a sponsor, ERC-20 sources are rejected at creation.
//!
//! ## Processing
//!
//! - below the dust threshold: still waiting for a deposit
//! - funded but short: refund `balance - gas_reserve`, or fail when that is
//!   not positive
//! - sufficient: swap (or transfer directly when both legs are the same
//!   asset)
//!
//! Once the swap or refund lands, the session winds down in resumable steps,
//! each recorded on the session document:
//!
//! 1. pay the treasury fee (completed sessions only, best effort)
//! 2. report the outcome to the bound claim, if any
//! 3. sweep whatever the address still holds: source tokens to the refund
//!    address, sponsored gas back to the sponsor
//! 4. mark the session terminal and leave the pending-work index
//!
//! The key is burned only when step 3 emptied the address. Execution and
//! sweep errors are retried up to `max_attempts` ticks; a sweep that keeps
//! failing ends the session with its key kept for manual recovery.

use std::sync::Arc;

use alloy::primitives::U256;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::machine::{ClaimMachine, SessionOutcome};
use crate::audit_log;
use crate::blockchain::{
    chain_by_id, format_amount, to_base_units, ChainRail, EphemeralKey, Swept,
};
use crate::config::CompanionConfig;
use crate::error::{ErrorKind, SettlementError, SettlementResult};
use crate::lock::{DistributedLock, LockOutcome};
use crate::providers::{PriceBook, QuoteSwapProvider, SwapRequest};
use crate::storage::{
    AuditEvent, AuditEventType, FileStore, SessionRepository, SessionStatus, StoredSession,
    TokenRef, WorkDatabase, WorkItem,
};

const BPS_DENOMINATOR: u64 = 10_000;
/// Dust threshold as a fraction of the deposit ask (0.1%).
const DUST_DIVISOR: u64 = 1_000;
const NATIVE_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Owning claim or organization.
    pub owner_ref: String,
    /// Claim settled by this session. It must be open or waiting for a
    /// deposit, and the session must deliver its token to its recipient.
    #[serde(default)]
    pub claim_id: Option<String>,
    pub chain_id: u64,
    pub from_token: TokenRef,
    pub to_token: TokenRef,
    /// Amount of `to_token` the recipient must receive, in whole tokens.
    #[schema(value_type = String, example = "50")]
    pub target_amount: Decimal,
    pub recipient: String,
    /// Refund destination; defaults to the recipient.
    #[serde(default)]
    pub refund_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_key: String,
    pub deposit_address: String,
    pub chain_id: u64,
    pub token_symbol: String,
    /// Amount to deposit, in whole tokens.
    pub required_deposit: String,
    pub required_deposit_raw: String,
}

/// What one `process_session` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Session already terminal; nothing was touched.
    NoOp,
    /// Session or claim lock held elsewhere.
    Busy,
    AwaitingDeposit,
    Refunded { tx_hash: String },
    Completed { tx_hash: String },
    /// A step failed and will be retried next tick.
    Retrying { attempts: u32, error: String },
    Failed { reason: String },
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionAction::NoOp => "noop",
            SessionAction::Busy => "busy",
            SessionAction::AwaitingDeposit => "awaiting_deposit",
            SessionAction::Refunded { .. } => "refunded",
            SessionAction::Completed { .. } => "completed",
            SessionAction::Retrying { .. } => "retrying",
            SessionAction::Failed { .. } => "failed",
        }
    }
}

/// Chain transaction that moved the deposit out of the session address.
#[derive(Debug, Clone)]
enum Landed {
    Settled(String),
    Refunded(String),
}

impl Landed {
    fn tx_hash(&self) -> &str {
        match self {
            Landed::Settled(tx_hash) | Landed::Refunded(tx_hash) => tx_hash,
        }
    }

    fn into_action(self) -> SessionAction {
        match self {
            Landed::Settled(tx_hash) => SessionAction::Completed { tx_hash },
            Landed::Refunded(tx_hash) => SessionAction::Refunded { tx_hash },
        }
    }

    fn outcome(&self) -> SessionOutcome {
        match self {
            Landed::Settled(tx_hash) => SessionOutcome::Settled {
                tx_hash: tx_hash.clone(),
            },
            Landed::Refunded(tx_hash) => SessionOutcome::Refunded {
                tx_hash: tx_hash.clone(),
            },
        }
    }
}

/// Parsed session amounts, in source-token smallest units.
struct Amounts {
    swap_input: U256,
    fee: U256,
    gas_reserve: U256,
    dust: U256,
    target: U256,
}

impl Amounts {
    fn of(session: &StoredSession) -> SettlementResult<Self> {
        Ok(Self {
            swap_input: parse_raw(&session.swap_input_raw)?,
            fee: parse_raw(&session.fee_raw)?,
            gas_reserve: parse_raw(&session.gas_reserve_raw)?,
            dust: parse_raw(&session.dust_threshold_raw)?,
            target: parse_raw(&session.target_amount_raw)?,
        })
    }

    /// Balance needed to execute.
    fn execution_minimum(&self) -> U256 {
        self.swap_input
            .saturating_add(self.fee)
            .saturating_add(self.gas_reserve)
    }
}

fn parse_raw(value: &str) -> SettlementResult<U256> {
    value
        .parse()
        .map_err(|_| SettlementError::Validation(format!("invalid raw amount {value}")))
}

fn bps(amount: U256, bps: u32) -> U256 {
    amount * U256::from(bps) / U256::from(BPS_DENOMINATOR)
}

fn session_key(owner_ref: &str) -> String {
    let seed = format!("{owner_ref}:{}", Utc::now().timestamp_millis());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

fn validate_address(label: &str, address: &str) -> SettlementResult<()> {
    address
        .trim()
        .parse::<alloy::primitives::Address>()
        .map(|_| ())
        .map_err(|_| SettlementError::Validation(format!("{label} is not a valid address")))
}

fn native_token(chain_id: u64) -> SettlementResult<TokenRef> {
    let chain = chain_by_id(chain_id)
        .ok_or_else(|| SettlementError::Validation(format!("unsupported chain {chain_id}")))?;
    Ok(TokenRef {
        symbol: chain.native_symbol.to_string(),
        address: None,
        decimals: NATIVE_DECIMALS,
    })
}

pub struct CompanionManager {
    storage: Arc<FileStore>,
    work_db: Arc<WorkDatabase>,
    lock: DistributedLock,
    claims: Arc<ClaimMachine>,
    rail: Arc<dyn ChainRail>,
    swaps: Arc<dyn QuoteSwapProvider>,
    prices: Arc<PriceBook>,
    policy: CompanionConfig,
    gas_sponsor: Option<EphemeralKey>,
}

pub(crate) fn lock_key(session_key: &str) -> String {
    format!("session:{session_key}")
}

impl CompanionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<FileStore>,
        work_db: Arc<WorkDatabase>,
        lock: DistributedLock,
        claims: Arc<ClaimMachine>,
        rail: Arc<dyn ChainRail>,
        swaps: Arc<dyn QuoteSwapProvider>,
        prices: Arc<PriceBook>,
        policy: CompanionConfig,
    ) -> Self {
        Self {
            storage,
            work_db,
            lock,
            claims,
            rail,
            swaps,
            prices,
            policy,
            gas_sponsor: None,
        }
    }

    /// Fund native gas of ERC-20 source sessions from `sponsor`.
    pub fn with_gas_sponsor(mut self, sponsor: EphemeralKey) -> Self {
        self.gas_sponsor = Some(sponsor);
        self
    }

    /// Generate a key, persist the session and index it for processing.
    ///
    /// Route support is the caller's responsibility.
    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> SettlementResult<SessionCreated> {
        if request.owner_ref.trim().is_empty() {
            return Err(SettlementError::Validation("ownerRef is required".to_string()));
        }
        if chain_by_id(request.chain_id).is_none() {
            return Err(SettlementError::Validation(format!(
                "unsupported chain {}",
                request.chain_id
            )));
        }
        if request.target_amount <= Decimal::ZERO {
            return Err(SettlementError::Validation(
                "targetAmount must be positive".to_string(),
            ));
        }
        if !request.from_token.is_native() && self.gas_sponsor.is_none() {
            return Err(SettlementError::Validation(format!(
                "{} deposits need a gas sponsor; deposit the native token instead",
                request.from_token.symbol
            )));
        }
        validate_address("recipient", &request.recipient)?;
        let refund_address = request
            .refund_address
            .clone()
            .unwrap_or_else(|| request.recipient.clone());
        validate_address("refundAddress", &refund_address)?;

        let from_price = self.prices.usd_price(&request.from_token.symbol).await?;
        let to_price = self.prices.usd_price(&request.to_token.symbol).await?;

        let target_usd = request.target_amount * to_price;
        let swap_input_tokens = if request.from_token.same_asset(&request.to_token) {
            request.target_amount
        } else {
            target_usd
                .checked_div(from_price)
                .ok_or_else(|| SettlementError::PriceUnavailable(request.from_token.symbol.clone()))?
        };

        let to_raw = |amount: Decimal, decimals: u8| {
            to_base_units(amount, decimals)
                .map_err(|e| SettlementError::Validation(e.to_string()))
        };
        let target = to_raw(request.target_amount, request.to_token.decimals)?;
        let swap_input = to_raw(swap_input_tokens, request.from_token.decimals)?;

        let (fee, fee_recipient) = match &self.policy.treasury_address {
            Some(treasury) => (bps(swap_input, self.policy.fee_bps), treasury.clone()),
            None => (U256::ZERO, String::new()),
        };
        let buffer = bps(swap_input, self.policy.deposit_buffer_bps);
        let gas_reserve = if request.from_token.is_native() {
            U256::from(self.policy.gas_reserve_wei)
        } else {
            U256::ZERO
        };
        let required = swap_input + fee + buffer + gas_reserve;
        let dust = (required / U256::from(DUST_DIVISOR)).max(U256::from(1u8));

        let key = EphemeralKey::generate();
        let pem = key.to_pem()?;
        let now = Utc::now();
        let session = StoredSession {
            session_key: session_key(&request.owner_ref),
            owner_ref: request.owner_ref.clone(),
            claim_id: request.claim_id.clone(),
            address: key.address_string(),
            chain_id: request.chain_id,
            from_token: request.from_token.clone(),
            to_token: request.to_token.clone(),
            target_amount_raw: target.to_string(),
            swap_input_raw: swap_input.to_string(),
            fee_raw: fee.to_string(),
            required_deposit_raw: required.to_string(),
            gas_reserve_raw: gas_reserve.to_string(),
            dust_threshold_raw: dust.to_string(),
            recipient: request.recipient.clone(),
            refund_address,
            fee_recipient,
            status: SessionStatus::PendingDeposit,
            attempts: 0,
            last_error: None,
            settlement_tx_hash: None,
            refund_tx_hash: None,
            gas_topup_tx_hash: None,
            fee_tx_hash: None,
            residual_tx_hash: None,
            residual_swept: false,
            claim_notified: false,
            created_at: now,
            updated_at: now,
        };

        if let Some(claim_id) = &session.claim_id {
            self.claims.attach_session(claim_id, &session).await?;
        }

        SessionRepository::new(&self.storage).create(&session, pem.as_bytes())?;
        self.work_db
            .add_pending(&WorkItem::Session(session.session_key.clone()))?;

        info!(
            session_key = %session.session_key,
            chain_id = session.chain_id,
            address = %session.address,
            required_deposit = %session.required_deposit_raw,
            claim_id = ?session.claim_id,
            "Companion session created"
        );
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::SessionCreated)
                .with_actor(request.owner_ref.clone())
                .with_resource("session", session.session_key.clone())
                .with_details(json!({
                    "chainId": session.chain_id,
                    "from": session.from_token.symbol,
                    "to": session.to_token.symbol,
                    "claimId": session.claim_id,
                }))
        );

        Ok(SessionCreated {
            session_key: session.session_key,
            deposit_address: session.address,
            chain_id: session.chain_id,
            token_symbol: session.from_token.symbol,
            required_deposit: format_amount(required, request.from_token.decimals),
            required_deposit_raw: required.to_string(),
        })
    }

    pub fn get_session(&self, session_key: &str) -> SettlementResult<StoredSession> {
        Ok(SessionRepository::new(&self.storage).get(session_key)?)
    }

    /// Advance one session under its lock.
    pub async fn process_session(&self, session_key: &str) -> SettlementResult<SessionAction> {
        let key = lock_key(session_key);
        let outcome = self
            .lock
            .with_lock(&key, self.lock.default_ttl(), || {
                self.process_locked(session_key)
            })
            .await?;
        match outcome {
            LockOutcome::Acquired(result) => result,
            LockOutcome::NotAcquired => Ok(SessionAction::Busy),
        }
    }

    async fn process_locked(&self, session_key: &str) -> SettlementResult<SessionAction> {
        let mut session = SessionRepository::new(&self.storage).get(session_key)?;
        if session.status.is_terminal() {
            self.work_db
                .remove_pending(&WorkItem::Session(session_key.to_string()))?;
            return Ok(SessionAction::NoOp);
        }

        // The deposit already left on an earlier attempt; only the wind-down is left.
        if let Some(tx_hash) = session.settlement_tx_hash.clone() {
            return self.wind_down(&mut session, Landed::Settled(tx_hash)).await;
        }
        if let Some(tx_hash) = session.refund_tx_hash.clone() {
            return self.wind_down(&mut session, Landed::Refunded(tx_hash)).await;
        }

        let amounts = Amounts::of(&session)?;
        let balance = self
            .rail
            .balance(session.chain_id, &session.from_token, &session.address)
            .await?;

        if balance < amounts.dust {
            debug!(session_key = %session_key, %balance, "Awaiting deposit");
            return Ok(SessionAction::AwaitingDeposit);
        }

        let minimum = amounts.execution_minimum();
        if balance < minimum {
            let shortfall = SettlementError::InsufficientFunds(format!(
                "balance {balance} below required {minimum}"
            ));
            return self.refund(&mut session, balance, &amounts, shortfall).await;
        }

        self.execute(&mut session, &amounts).await
    }

    async fn refund(
        &self,
        session: &mut StoredSession,
        balance: U256,
        amounts: &Amounts,
        reason: SettlementError,
    ) -> SettlementResult<SessionAction> {
        if balance <= amounts.gas_reserve {
            let reason = "balance too low for refund".to_string();
            session.last_error = Some(reason.clone());
            return self.fail(session, reason).await;
        }
        let refund_amount = balance - amounts.gas_reserve;
        session.last_error = Some(reason.to_string());

        let token = session.from_token.clone();
        let to = session.refund_address.clone();
        let result = self.transfer_out(session, &token, &to, refund_amount).await;
        let tx_hash = match result {
            Ok(tx_hash) => tx_hash,
            Err(error) if error.aborts_tick() => return Err(error),
            Err(error) => return self.record_failure(session, error).await,
        };

        session.refund_tx_hash = Some(tx_hash.clone());
        session.attempts = 0;
        SessionRepository::new(&self.storage).update(session)?;
        info!(
            session_key = %session.session_key,
            refund_amount = %refund_amount,
            tx_hash = %tx_hash,
            "Deposit refunded"
        );
        self.wind_down(session, Landed::Refunded(tx_hash)).await
    }

    async fn execute(
        &self,
        session: &mut StoredSession,
        amounts: &Amounts,
    ) -> SettlementResult<SessionAction> {
        if session.status == SessionStatus::PendingDeposit {
            self.set_status(session, SessionStatus::Processing)?;
            SessionRepository::new(&self.storage).update(session)?;
        }

        let result = if session.from_token.same_asset(&session.to_token) {
            let token = session.to_token.clone();
            let to = session.recipient.clone();
            self.transfer_out(session, &token, &to, amounts.target).await
        } else {
            self.swap_out(session, amounts).await
        };

        match result {
            Ok(tx_hash) => {
                session.settlement_tx_hash = Some(tx_hash.clone());
                // From here on attempts count wind-down retries.
                session.attempts = 0;
                SessionRepository::new(&self.storage).update(session)?;
                self.wind_down(session, Landed::Settled(tx_hash)).await
            }
            Err(error) if error.aborts_tick() => Err(error),
            Err(error) => self.record_failure(session, error).await,
        }
    }

    /// Transfer out of the session address, topping up gas first if needed.
    async fn transfer_out(
        &self,
        session: &mut StoredSession,
        token: &TokenRef,
        to: &str,
        amount: U256,
    ) -> SettlementResult<String> {
        self.ensure_gas(session).await?;
        let key = self.load_key(&session.session_key)?;
        Ok(self
            .rail
            .transfer(session.chain_id, &key, token, to, amount)
            .await?)
    }

    async fn swap_out(
        &self,
        session: &mut StoredSession,
        amounts: &Amounts,
    ) -> SettlementResult<String> {
        self.ensure_gas(session).await?;
        let key = self.load_key(&session.session_key)?;
        self.swap(session, &key, amounts).await
    }

    async fn swap(
        &self,
        session: &StoredSession,
        key: &EphemeralKey,
        amounts: &Amounts,
    ) -> SettlementResult<String> {
        let request = SwapRequest {
            chain_id: session.chain_id,
            from_token: session.from_token.clone(),
            to_token: session.to_token.clone(),
            amount_in: amounts.swap_input.to_string(),
            min_amount_out: amounts.target.to_string(),
            sender: session.address.clone(),
            recipient: session.recipient.clone(),
        };
        let prepared = self.swaps.prepare_swap(&request).await?;
        if let Some(approval) = &prepared.approval {
            self.rail
                .send_prepared(session.chain_id, key, approval)
                .await?;
        }
        Ok(self
            .rail
            .send_prepared(session.chain_id, key, &prepared.swap)
            .await?)
    }

    /// Send sponsored gas to an ERC-20 source address, once per session.
    async fn ensure_gas(&self, session: &mut StoredSession) -> SettlementResult<()> {
        if session.from_token.is_native() || session.gas_topup_tx_hash.is_some() {
            return Ok(());
        }
        let sponsor = self.gas_sponsor.as_ref().ok_or_else(|| {
            SettlementError::Validation("no gas sponsor configured".to_string())
        })?;
        let native = native_token(session.chain_id)?;
        let amount = U256::from(self.policy.gas_reserve_wei);
        let tx_hash = self
            .rail
            .transfer(session.chain_id, sponsor, &native, &session.address, amount)
            .await?;

        info!(
            session_key = %session.session_key,
            amount = %amount,
            tx_hash = %tx_hash,
            "Gas topped up by sponsor"
        );
        session.gas_topup_tx_hash = Some(tx_hash);
        SessionRepository::new(&self.storage).update(session)?;
        Ok(())
    }

    /// Finish a session whose deposit has left the address.
    ///
    /// Every step records its progress, so a retry picks up where the last
    /// attempt stopped.
    async fn wind_down(
        &self,
        session: &mut StoredSession,
        landed: Landed,
    ) -> SettlementResult<SessionAction> {
        if matches!(landed, Landed::Settled(_)) && session.fee_tx_hash.is_none() {
            self.pay_fee(session).await?;
        }

        if !session.claim_notified {
            if let Some(claim_id) = session.claim_id.clone() {
                let outcome = landed.outcome();
                match self
                    .claims
                    .apply_session_outcome(&claim_id, &session.session_key, &outcome)
                    .await
                {
                    Ok(status) => {
                        debug!(session_key = %session.session_key, claim_id = %claim_id, %status, "Claim updated");
                    }
                    Err(error) if error.kind() == ErrorKind::Busy => {
                        debug!(session_key = %session.session_key, claim_id = %claim_id, "Claim busy, retrying next tick");
                        return Ok(SessionAction::Busy);
                    }
                    Err(error) if error.aborts_tick() => return Err(error),
                    Err(error) => {
                        warn!(session_key = %session.session_key, claim_id = %claim_id, %error, "Claim not updated by session outcome");
                    }
                }
            }
            session.claim_notified = true;
            SessionRepository::new(&self.storage).update(session)?;
        }

        if !session.residual_swept {
            match self.sweep_residual(session).await {
                Ok(()) => {}
                Err(error) if error.aborts_tick() => return Err(error),
                Err(error) => {
                    session.attempts += 1;
                    session.last_error = Some(error.to_string());
                    if session.attempts < self.policy.max_attempts {
                        SessionRepository::new(&self.storage).update(session)?;
                        warn!(
                            session_key = %session.session_key,
                            attempts = session.attempts,
                            %error,
                            "Residual sweep failed"
                        );
                        return Ok(SessionAction::Retrying {
                            attempts: session.attempts,
                            error: error.public_message(),
                        });
                    }
                    warn!(
                        session_key = %session.session_key,
                        attempts = session.attempts,
                        %error,
                        "Residual sweep abandoned, key kept for recovery"
                    );
                }
            }
        }

        self.finish(session, landed)
    }

    /// Pay the treasury fee. A failed transfer is logged and the amount is
    /// swept back to the payer with the rest of the residue.
    async fn pay_fee(&self, session: &mut StoredSession) -> SettlementResult<()> {
        let fee = parse_raw(&session.fee_raw)?;
        if fee.is_zero() || session.fee_recipient.is_empty() {
            return Ok(());
        }
        let key = match self.load_key(&session.session_key) {
            Ok(key) => key,
            Err(error) => {
                warn!(session_key = %session.session_key, %error, "Fee skipped, key unavailable");
                return Ok(());
            }
        };
        match self
            .rail
            .transfer(
                session.chain_id,
                &key,
                &session.from_token,
                &session.fee_recipient,
                fee,
            )
            .await
        {
            Ok(tx_hash) => {
                session.fee_tx_hash = Some(tx_hash);
                SessionRepository::new(&self.storage).update(session)?;
            }
            Err(error) => {
                warn!(session_key = %session.session_key, %error, "Fee transfer failed");
            }
        }
        Ok(())
    }

    /// Return what the address still holds: source tokens to the refund
    /// address, sponsored gas to the sponsor.
    async fn sweep_residual(&self, session: &mut StoredSession) -> SettlementResult<()> {
        let key = self.load_key(&session.session_key)?;
        let swept = self
            .rail
            .sweep(
                session.chain_id,
                &key,
                &session.from_token,
                &session.refund_address,
            )
            .await?;
        if let Swept::Sent { tx_hash, amount } = swept {
            info!(
                session_key = %session.session_key,
                amount = %amount,
                tx_hash = %tx_hash,
                "Residual returned to refund address"
            );
            session.residual_tx_hash = Some(tx_hash);
            SessionRepository::new(&self.storage).update(session)?;
        }

        if session.gas_topup_tx_hash.is_some() {
            if let Some(sponsor) = &self.gas_sponsor {
                let native = native_token(session.chain_id)?;
                self.rail
                    .sweep(session.chain_id, &key, &native, &sponsor.address_string())
                    .await?;
            }
        }

        session.residual_swept = true;
        SessionRepository::new(&self.storage).update(session)?;
        Ok(())
    }

    fn finish(&self, session: &mut StoredSession, landed: Landed) -> SettlementResult<SessionAction> {
        let (status, event) = match landed {
            Landed::Settled(_) => (SessionStatus::Completed, AuditEventType::SessionCompleted),
            Landed::Refunded(_) => (SessionStatus::Refunded, AuditEventType::SessionRefunded),
        };
        self.set_status(session, status)?;
        if session.residual_swept && status == SessionStatus::Completed {
            session.last_error = None;
        }
        SessionRepository::new(&self.storage).update(session)?;
        self.retire(session, session.residual_swept)?;

        info!(
            session_key = %session.session_key,
            status = ?status,
            tx_hash = %landed.tx_hash(),
            residual_tx_hash = ?session.residual_tx_hash,
            key_burned = session.residual_swept,
            "Companion session closed"
        );
        audit_log!(
            &self.storage,
            AuditEvent::new(event)
                .with_actor("engine")
                .with_resource("session", session.session_key.clone())
                .with_details(json!({
                    "txHash": landed.tx_hash(),
                    "feeTxHash": session.fee_tx_hash,
                    "residualTxHash": session.residual_tx_hash,
                    "keyBurned": session.residual_swept,
                }))
        );
        Ok(landed.into_action())
    }

    /// Count a failed attempt; fail the session once the cap is reached.
    async fn record_failure(
        &self,
        session: &mut StoredSession,
        error: SettlementError,
    ) -> SettlementResult<SessionAction> {
        session.attempts += 1;
        session.last_error = Some(error.to_string());
        warn!(
            session_key = %session.session_key,
            attempts = session.attempts,
            %error,
            "Companion session attempt failed"
        );

        if session.attempts >= self.policy.max_attempts {
            let reason = error.to_string();
            return self.fail(session, reason).await;
        }

        if session.status == SessionStatus::PendingDeposit {
            self.set_status(session, SessionStatus::Processing)?;
        }
        SessionRepository::new(&self.storage).update(session)?;
        Ok(SessionAction::Retrying {
            attempts: session.attempts,
            error: error.public_message(),
        })
    }

    /// Absorbing failure. The key is kept for manual recovery of any funds
    /// left, and a bound claim stays open for another route.
    async fn fail(
        &self,
        session: &mut StoredSession,
        reason: String,
    ) -> SettlementResult<SessionAction> {
        if let Some(claim_id) = session.claim_id.clone() {
            let outcome = SessionOutcome::Failed {
                reason: reason.clone(),
            };
            match self
                .claims
                .apply_session_outcome(&claim_id, &session.session_key, &outcome)
                .await
            {
                Ok(_) => session.claim_notified = true,
                Err(error) => {
                    warn!(session_key = %session.session_key, claim_id = %claim_id, %error, "Claim not told about failed session");
                }
            }
        }

        self.set_status(session, SessionStatus::Failed)?;
        SessionRepository::new(&self.storage).update(session)?;
        self.retire(session, false)?;

        warn!(session_key = %session.session_key, reason = %reason, "Companion session failed");
        audit_log!(
            &self.storage,
            AuditEvent::new(AuditEventType::SessionFailed)
                .with_actor("engine")
                .with_resource("session", session.session_key.clone())
                .failed(reason.clone())
        );
        Ok(SessionAction::Failed { reason })
    }

    fn set_status(&self, session: &mut StoredSession, next: SessionStatus) -> SettlementResult<()> {
        if !session.status.can_transition_to(next) {
            return Err(SettlementError::InvalidTransition {
                from: format!("{:?}", session.status),
                to: format!("{next:?}"),
            });
        }
        session.status = next;
        Ok(())
    }

    /// Leave the pending-work index, optionally burning the key.
    fn retire(&self, session: &StoredSession, burn_key: bool) -> SettlementResult<()> {
        self.work_db
            .remove_pending(&WorkItem::Session(session.session_key.clone()))?;
        if burn_key {
            SessionRepository::new(&self.storage).burn_key(&session.session_key)?;
        }
        Ok(())
    }

    fn load_key(&self, session_key: &str) -> SettlementResult<EphemeralKey> {
        let pem = SessionRepository::new(&self.storage).read_private_key(session_key)?;
        Ok(EphemeralKey::from_pem(&pem)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationRecorder;
    use crate::blockchain::{ChainError, PreparedTransaction};
    use crate::engine::NewClaim;
    use crate::error::ErrorKind;
    use crate::lock::{claim_lock_key, MemoryLockStore, DEFAULT_LOCK_TTL};
    use crate::providers::{
        PreparedSwap, ProviderError, Quote, QuoteRequest, RawStatusResponse, StaticPrices,
    };
    use crate::storage::ClaimStatus;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";
    const REFUND: &str = "0x2222222222222222222222222222222222222222";
    const TREASURY: &str = "0x3333333333333333333333333333333333333333";
    /// Gas kept back by a native sweep: 21k gas at 2 gwei.
    const SWEEP_FEE: u128 = 42_000_000_000_000;

    fn slot(owner: &str, symbol: &str) -> (String, String) {
        (owner.to_lowercase(), symbol.to_uppercase())
    }

    /// Ledger of balances per (address, symbol). Transfers and swaps move
    /// funds; a native sweep burns `SWEEP_FEE` as gas.
    #[derive(Default)]
    struct FakeRail {
        balances: Mutex<HashMap<(String, String), U256>>,
        failing_destination: Mutex<Option<String>>,
        fail_sweeps: Mutex<bool>,
        transfers: Mutex<Vec<(String, String, U256)>>,
        sweeps: Mutex<Vec<(String, String, U256)>>,
        prepared: Mutex<Vec<String>>,
    }

    impl FakeRail {
        fn fund(&self, owner: &str, symbol: &str, amount: U256) {
            *self
                .balances
                .lock()
                .unwrap()
                .entry(slot(owner, symbol))
                .or_default() += amount;
        }

        fn balance_of(&self, owner: &str, symbol: &str) -> U256 {
            self.balances
                .lock()
                .unwrap()
                .get(&slot(owner, symbol))
                .copied()
                .unwrap_or_default()
        }

        fn debit(&self, owner: &str, symbol: &str, amount: U256) -> Result<(), ChainError> {
            let mut balances = self.balances.lock().unwrap();
            let balance = balances.entry(slot(owner, symbol)).or_default();
            if *balance < amount {
                return Err(ChainError::TransactionFailed("insufficient funds".to_string()));
            }
            *balance -= amount;
            Ok(())
        }
    }

    #[async_trait]
    impl ChainRail for FakeRail {
        async fn balance(&self, _: u64, token: &TokenRef, owner: &str) -> Result<U256, ChainError> {
            Ok(self.balance_of(owner, &token.symbol))
        }

        async fn transfer(
            &self,
            _: u64,
            key: &EphemeralKey,
            token: &TokenRef,
            to: &str,
            amount: U256,
        ) -> Result<String, ChainError> {
            if self.failing_destination.lock().unwrap().as_deref() == Some(to) {
                return Err(ChainError::TransactionFailed("reverted".to_string()));
            }
            self.debit(&key.address_string(), &token.symbol, amount)?;
            self.fund(to, &token.symbol, amount);
            let mut transfers = self.transfers.lock().unwrap();
            transfers.push((token.symbol.clone(), to.to_string(), amount));
            Ok(format!("0xtransfer{}", transfers.len()))
        }

        async fn send_prepared(
            &self,
            _: u64,
            key: &EphemeralKey,
            tx: &PreparedTransaction,
        ) -> Result<String, ChainError> {
            let value: U256 = tx.value.parse().unwrap();
            self.debit(&key.address_string(), "ETH", value)?;
            self.prepared.lock().unwrap().push(tx.to.clone());
            Ok(format!("0xprepared-{}", tx.to))
        }

        async fn sweep(
            &self,
            _: u64,
            key: &EphemeralKey,
            token: &TokenRef,
            to: &str,
        ) -> Result<Swept, ChainError> {
            if *self.fail_sweeps.lock().unwrap() {
                return Err(ChainError::Rpc("connection reset".to_string()));
            }
            let owner = key.address_string();
            let balance = self.balance_of(&owner, &token.symbol);
            let fee = if token.is_native() {
                U256::from(SWEEP_FEE)
            } else {
                U256::ZERO
            };
            if balance <= fee {
                return Ok(Swept::Empty);
            }
            let amount = balance - fee;
            self.debit(&owner, &token.symbol, balance)?;
            self.fund(to, &token.symbol, amount);
            let mut sweeps = self.sweeps.lock().unwrap();
            sweeps.push((token.symbol.clone(), to.to_string(), amount));
            Ok(Swept::Sent {
                tx_hash: format!("0xsweep{}", sweeps.len()),
                amount,
            })
        }
    }

    struct FakeSwaps;

    #[async_trait]
    impl QuoteSwapProvider for FakeSwaps {
        async fn request_quote(&self, _: &QuoteRequest) -> Result<Quote, ProviderError> {
            Err(ProviderError::MissingConfig("unused".into()))
        }

        async fn fetch_status(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<RawStatusResponse, ProviderError> {
            Err(ProviderError::MissingConfig("unused".into()))
        }

        async fn prepare_swap(&self, request: &SwapRequest) -> Result<PreparedSwap, ProviderError> {
            let value = if request.from_token.is_native() {
                request.amount_in.clone()
            } else {
                "0".to_string()
            };
            Ok(PreparedSwap {
                approval: None,
                swap: PreparedTransaction {
                    to: "router".to_string(),
                    data: "0x".to_string(),
                    value,
                    gas_limit: None,
                },
            })
        }
    }

    struct Harness {
        _temp: TempDir,
        storage: Arc<FileStore>,
        work_db: Arc<WorkDatabase>,
        rail: Arc<FakeRail>,
        claims: Arc<ClaimMachine>,
        manager: CompanionManager,
        sponsor_address: String,
    }

    fn harness_with(treasury: bool, sponsor: bool) -> Harness {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(FileStore::open(temp.path()).unwrap());
        let work_db = Arc::new(WorkDatabase::open(&temp.path().join("work.redb")).unwrap());
        let lock = DistributedLock::new(Arc::new(MemoryLockStore::new()), DEFAULT_LOCK_TTL);
        let rail = Arc::new(FakeRail::default());
        let swaps: Arc<dyn QuoteSwapProvider> = Arc::new(FakeSwaps);
        let prices = Arc::new(PriceBook::new(
            StaticPrices::new(HashMap::from([("ETH".to_string(), Decimal::from(2500))])),
            None,
        ));
        let claims = Arc::new(ClaimMachine::new(
            storage.clone(),
            work_db.clone(),
            lock.clone(),
            swaps.clone(),
            prices.clone(),
            AttestationRecorder::new(storage.clone(), lock.clone(), None),
            chrono::Duration::days(30),
        ));
        let policy = CompanionConfig {
            treasury_address: treasury.then(|| TREASURY.to_string()),
            ..CompanionConfig::default()
        };
        let mut manager = CompanionManager::new(
            storage.clone(),
            work_db.clone(),
            lock,
            claims.clone(),
            rail.clone(),
            swaps,
            prices,
            policy,
        );
        let mut sponsor_address = String::new();
        if sponsor {
            let key = EphemeralKey::generate();
            sponsor_address = key.address_string();
            rail.fund(&sponsor_address, "ETH", wei(1_000_000_000_000_000_000));
            manager = manager.with_gas_sponsor(key);
        }
        Harness {
            _temp: temp,
            storage,
            work_db,
            rail,
            claims,
            manager,
            sponsor_address,
        }
    }

    fn harness(treasury: bool) -> Harness {
        harness_with(treasury, false)
    }

    fn eth() -> TokenRef {
        TokenRef {
            symbol: "ETH".into(),
            address: None,
            decimals: 18,
        }
    }

    fn usdc() -> TokenRef {
        TokenRef {
            symbol: "USDC".into(),
            address: Some("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".into()),
            decimals: 6,
        }
    }

    fn eth_to_usdc() -> CreateSessionRequest {
        CreateSessionRequest {
            owner_ref: "org-1".into(),
            claim_id: None,
            chain_id: 8453,
            from_token: eth(),
            to_token: usdc(),
            target_amount: Decimal::from(50),
            recipient: RECIPIENT.into(),
            refund_address: Some(REFUND.into()),
        }
    }

    fn usdc_claim(id: &str) -> NewClaim {
        NewClaim {
            id: Some(id.into()),
            amount: "50".into(),
            token_symbol: "USDC".into(),
            token_chain: "base".into(),
            recipient_address: RECIPIENT.into(),
            creator_id: None,
            description: None,
            is_private: false,
        }
    }

    fn wei(value: u128) -> U256 {
        U256::from(value)
    }

    fn has_key(h: &Harness, session_key: &str) -> bool {
        SessionRepository::new(&h.storage).has_private_key(session_key)
    }

    #[tokio::test]
    async fn create_session_computes_deposit_ask() {
        let h = harness(true);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();

        let session = h.manager.get_session(&created.session_key).unwrap();
        // 50 USDC at 2500 USD/ETH = 0.02 ETH
        assert_eq!(session.swap_input_raw, "20000000000000000");
        assert_eq!(session.fee_raw, "200000000000000");
        assert_eq!(session.gas_reserve_raw, "500000000000000");
        // 0.02 + 1% fee + 3% buffer + 0.0005 reserve
        assert_eq!(created.required_deposit_raw, "21300000000000000");
        assert_eq!(created.required_deposit, "0.0213");
        assert_eq!(session.status, SessionStatus::PendingDeposit);
        assert!(h
            .work_db
            .is_pending(&WorkItem::Session(created.session_key.clone()))
            .unwrap());
        assert!(has_key(&h, &created.session_key));
    }

    #[tokio::test]
    async fn missing_price_rejects_creation() {
        let h = harness(false);
        let mut request = eth_to_usdc();
        request.from_token.symbol = "WBTC".into();
        let err = h.manager.create_session(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PriceUnavailable);
        assert!(h.work_db.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_recipient_is_validation_error() {
        let h = harness(false);
        let mut request = eth_to_usdc();
        request.recipient = "nope".into();
        let err = h.manager.create_session(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn erc20_source_without_sponsor_is_rejected() {
        let h = harness(false);
        let mut request = eth_to_usdc();
        request.from_token = usdc();
        let err = h.manager.create_session(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.work_db.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unfunded_session_waits() {
        let h = harness(false);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert_eq!(action, SessionAction::AwaitingDeposit);
        assert!(h.rail.transfers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn underfunded_session_refunds_then_sweeps_reserve() {
        let h = harness(false);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(10_000_000_000_000_000)); // 0.01 ETH

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Refunded { .. }));

        let transfers = h.rail.transfers.lock().unwrap().clone();
        assert_eq!(
            transfers,
            vec![("ETH".to_string(), REFUND.to_string(), wei(9_500_000_000_000_000))]
        );
        // Unused gas reserve follows the refund.
        let sweeps = h.rail.sweeps.lock().unwrap().clone();
        assert_eq!(
            sweeps,
            vec![("ETH".to_string(), REFUND.to_string(), wei(500_000_000_000_000 - SWEEP_FEE))]
        );
        let session = h.manager.get_session(&created.session_key).unwrap();
        assert_eq!(session.status, SessionStatus::Refunded);
        assert!(session.residual_swept);
        assert!(!has_key(&h, &created.session_key));
        assert!(h.work_db.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn balance_within_gas_reserve_fails_without_chain_tx() {
        let h = harness(false);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(400_000_000_000_000)); // 0.0004 ETH

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert_eq!(
            action,
            SessionAction::Failed {
                reason: "balance too low for refund".into()
            }
        );
        assert!(h.rail.transfers.lock().unwrap().is_empty());
        assert!(h.work_db.list_pending().unwrap().is_empty());
        assert!(has_key(&h, &created.session_key));
    }

    #[tokio::test]
    async fn funded_session_swaps_pays_fee_and_sweeps() {
        let h = harness(true);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(21_300_000_000_000_000));

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert_eq!(
            action,
            SessionAction::Completed {
                tx_hash: "0xprepared-router".into()
            }
        );
        assert_eq!(h.rail.prepared.lock().unwrap().len(), 1);
        let transfers = h.rail.transfers.lock().unwrap().clone();
        assert_eq!(
            transfers,
            vec![("ETH".to_string(), TREASURY.to_string(), wei(200_000_000_000_000))]
        );
        // 0.0213 - 0.02 swap - 0.0002 fee
        let sweeps = h.rail.sweeps.lock().unwrap().clone();
        assert_eq!(
            sweeps,
            vec![("ETH".to_string(), REFUND.to_string(), wei(1_100_000_000_000_000 - SWEEP_FEE))]
        );

        let session = h.manager.get_session(&created.session_key).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.settlement_tx_hash.as_deref(), Some("0xprepared-router"));
        assert_eq!(session.fee_tx_hash.as_deref(), Some("0xtransfer1"));
        assert!(!has_key(&h, &created.session_key));
    }

    #[tokio::test]
    async fn overpaid_session_returns_residual_before_burning() {
        let h = harness(true);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        assert_eq!(created.required_deposit, "0.0213");
        h.rail
            .fund(&created.deposit_address, "ETH", wei(1_000_000_000_000_000_000)); // 1 ETH

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Completed { .. }));

        // 1 - 0.02 swap - 0.0002 fee
        let returned = wei(979_800_000_000_000_000 - SWEEP_FEE);
        let sweeps = h.rail.sweeps.lock().unwrap().clone();
        assert_eq!(sweeps, vec![("ETH".to_string(), REFUND.to_string(), returned)]);
        assert_eq!(h.rail.balance_of(REFUND, "ETH"), returned);
        assert!(h.rail.balance_of(&created.deposit_address, "ETH").is_zero());

        let session = h.manager.get_session(&created.session_key).unwrap();
        assert_eq!(session.residual_tx_hash.as_deref(), Some("0xsweep1"));
        assert!(session.residual_swept);
        assert!(!has_key(&h, &created.session_key));
    }

    #[tokio::test]
    async fn failed_sweep_retries_without_repeating_the_swap() {
        let h = harness(true);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(100_000_000_000_000_000)); // 0.1 ETH
        *h.rail.fail_sweeps.lock().unwrap() = true;

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Retrying { attempts: 1, .. }));
        let session = h.manager.get_session(&created.session_key).unwrap();
        assert_eq!(session.status, SessionStatus::Processing);
        assert!(session.settlement_tx_hash.is_some());
        assert!(!session.residual_swept);
        assert!(has_key(&h, &created.session_key));

        *h.rail.fail_sweeps.lock().unwrap() = false;
        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Completed { .. }));
        assert_eq!(h.rail.prepared.lock().unwrap().len(), 1);
        // Fee paid once across both attempts.
        assert_eq!(h.rail.transfers.lock().unwrap().len(), 1);
        assert_eq!(h.rail.sweeps.lock().unwrap().len(), 1);
        assert!(!has_key(&h, &created.session_key));
    }

    #[tokio::test]
    async fn abandoned_sweep_closes_session_but_keeps_key() {
        let h = harness(false);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(100_000_000_000_000_000));
        *h.rail.fail_sweeps.lock().unwrap() = true;

        for attempt in 1..3 {
            let action = h.manager.process_session(&created.session_key).await.unwrap();
            assert!(matches!(action, SessionAction::Retrying { attempts, .. } if attempts == attempt));
        }
        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Completed { .. }));

        let session = h.manager.get_session(&created.session_key).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(!session.residual_swept);
        assert!(session.last_error.is_some());
        assert!(has_key(&h, &created.session_key));
        assert!(h.work_db.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_asset_transfers_directly_with_sponsored_gas() {
        let h = harness_with(false, true);
        let mut request = eth_to_usdc();
        request.from_token = usdc();
        let created = h.manager.create_session(&request).await.unwrap();
        assert_eq!(created.required_deposit_raw, "51500000");
        h.rail.fund(&created.deposit_address, "USDC", wei(51_500_000));

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Completed { .. }));
        assert!(h.rail.prepared.lock().unwrap().is_empty());
        let transfers = h.rail.transfers.lock().unwrap().clone();
        assert_eq!(
            transfers,
            vec![
                (
                    "ETH".to_string(),
                    created.deposit_address.clone(),
                    wei(500_000_000_000_000)
                ),
                ("USDC".to_string(), RECIPIENT.to_string(), wei(50_000_000)),
            ]
        );
        // Buffer back to the payer, unused gas back to the sponsor.
        let sweeps = h.rail.sweeps.lock().unwrap().clone();
        assert_eq!(
            sweeps,
            vec![
                ("USDC".to_string(), REFUND.to_string(), wei(1_500_000)),
                (
                    "ETH".to_string(),
                    h.sponsor_address.clone(),
                    wei(500_000_000_000_000 - SWEEP_FEE)
                ),
            ]
        );
        let session = h.manager.get_session(&created.session_key).unwrap();
        assert!(session.gas_topup_tx_hash.is_some());
        assert!(!has_key(&h, &created.session_key));
    }

    #[tokio::test]
    async fn failed_execution_retries_then_fails() {
        let h = harness_with(false, true);
        let mut request = eth_to_usdc();
        request.from_token = usdc();
        let created = h.manager.create_session(&request).await.unwrap();
        h.rail.fund(&created.deposit_address, "USDC", wei(60_000_000));
        *h.rail.failing_destination.lock().unwrap() = Some(RECIPIENT.to_string());

        for attempt in 1..3 {
            let action = h.manager.process_session(&created.session_key).await.unwrap();
            assert!(matches!(action, SessionAction::Retrying { attempts, .. } if attempts == attempt));
            let session = h.manager.get_session(&created.session_key).unwrap();
            assert_eq!(session.status, SessionStatus::Processing);
        }

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Failed { .. }));
        let session = h.manager.get_session(&created.session_key).unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.attempts, 3);
        assert!(h.work_db.list_pending().unwrap().is_empty());

        // Gas was topped up once across all attempts.
        let topups = h
            .rail
            .transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, to, _)| *to == created.deposit_address)
            .count();
        assert_eq!(topups, 1);
    }

    #[tokio::test]
    async fn bound_session_needs_an_attachable_claim() {
        let h = harness(false);
        let mut request = eth_to_usdc();
        request.claim_id = Some("missing".into());
        let err = h.manager.create_session(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        h.claims.create_claim(&usdc_claim("claim-cancelled")).unwrap();
        h.claims.cancel("claim-cancelled", "ops").await.unwrap();
        request.claim_id = Some("claim-cancelled".into());
        let err = h.manager.create_session(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        h.claims.create_claim(&usdc_claim("claim-other")).unwrap();
        request.claim_id = Some("claim-other".into());
        request.recipient = REFUND.into();
        let err = h.manager.create_session(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            h.claims.get_claim("claim-other").unwrap().status,
            ClaimStatus::Open
        );

        assert!(h.work_db.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bound_session_refund_refunds_claim() {
        let h = harness(false);
        h.claims.create_claim(&usdc_claim("claim-1")).unwrap();
        let mut request = eth_to_usdc();
        request.claim_id = Some("claim-1".into());
        let created = h.manager.create_session(&request).await.unwrap();
        assert_eq!(
            h.claims.get_claim("claim-1").unwrap().status,
            ClaimStatus::PendingDeposit
        );

        h.rail
            .fund(&created.deposit_address, "ETH", wei(10_000_000_000_000_000));
        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Refunded { .. }));
        assert_eq!(
            h.claims.get_claim("claim-1").unwrap().status,
            ClaimStatus::Refunded
        );
        assert!(h.manager.get_session(&created.session_key).unwrap().claim_notified);
    }

    #[tokio::test]
    async fn failed_bound_session_leaves_claim_open() {
        let h = harness(false);
        h.claims.create_claim(&usdc_claim("claim-1")).unwrap();
        let mut request = eth_to_usdc();
        request.claim_id = Some("claim-1".into());
        let created = h.manager.create_session(&request).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(400_000_000_000_000));

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Failed { .. }));
        assert_eq!(
            h.claims.get_claim("claim-1").unwrap().status,
            ClaimStatus::PendingDeposit
        );
    }

    #[tokio::test]
    async fn busy_claim_defers_completion() {
        let h = harness(false);
        h.claims.create_claim(&usdc_claim("claim-1")).unwrap();
        let mut request = eth_to_usdc();
        request.claim_id = Some("claim-1".into());
        let created = h.manager.create_session(&request).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(21_300_000_000_000_000));

        let claim_key = claim_lock_key("claim-1");
        assert!(h.manager.lock.acquire(&claim_key, DEFAULT_LOCK_TTL).await.unwrap());
        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert_eq!(action, SessionAction::Busy);
        let session = h.manager.get_session(&created.session_key).unwrap();
        assert!(session.settlement_tx_hash.is_some());
        assert!(!session.status.is_terminal());
        assert!(has_key(&h, &created.session_key));

        h.manager.lock.release(&claim_key).await;
        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert!(matches!(action, SessionAction::Completed { .. }));
        assert_eq!(h.rail.prepared.lock().unwrap().len(), 1);

        let claim = h.claims.get_claim("claim-1").unwrap();
        assert_eq!(claim.status, ClaimStatus::Success);
        assert_eq!(claim.execution_ref.as_deref(), Some("0xprepared-router"));
        assert!(claim.paid_at.is_some());
    }

    #[tokio::test]
    async fn terminal_session_is_a_noop() {
        let h = harness(false);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        h.rail
            .fund(&created.deposit_address, "ETH", wei(10_000_000_000_000_000));
        h.manager.process_session(&created.session_key).await.unwrap();
        let transfers_before = h.rail.transfers.lock().unwrap().len();

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert_eq!(action, SessionAction::NoOp);
        assert_eq!(h.rail.transfers.lock().unwrap().len(), transfers_before);
    }

    #[tokio::test]
    async fn held_lock_skips_session() {
        let h = harness(false);
        let created = h.manager.create_session(&eth_to_usdc()).await.unwrap();
        assert!(h
            .manager
            .lock
            .acquire(&lock_key(&created.session_key), DEFAULT_LOCK_TTL)
            .await
            .unwrap());

        let action = h.manager.process_session(&created.session_key).await.unwrap();
        assert_eq!(action, SessionAction::Busy);
    }
}
