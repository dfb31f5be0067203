// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Companion wallet session repository.
//!
//! Session metadata lives in `sessions/<key>/meta.json`; the ephemeral key
//! sits next to it as `key.pem` until the session is burned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::super::{FileStore, StorageError, StorageResult};

/// Companion session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for the payer to fund the ephemeral address.
    PendingDeposit,
    /// Funded; swap/transfer in progress or being retried.
    Processing,
    Completed,
    Refunded,
    /// Absorbing failure state.
    Failed,
}

impl SessionStatus {
    /// Completed, refunded and failed sessions are never touched again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Refunded | SessionStatus::Failed
        )
    }

    /// Position in the forward-only lifecycle.
    fn rank(self) -> u8 {
        match self {
            SessionStatus::PendingDeposit => 0,
            SessionStatus::Processing => 1,
            SessionStatus::Completed | SessionStatus::Refunded | SessionStatus::Failed => 2,
        }
    }

    /// Status only moves forward; terminal states never change.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// Token leg of a companion session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenRef {
    pub symbol: String,
    /// ERC-20 contract, `None` for the chain's native token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub decimals: u8,
}

impl TokenRef {
    pub fn is_native(&self) -> bool {
        self.address.is_none()
    }

    /// Same asset on the same chain (symbol and contract match).
    pub fn same_asset(&self, other: &TokenRef) -> bool {
        self.symbol.eq_ignore_ascii_case(&other.symbol)
            && match (&self.address, &other.address) {
                (None, None) => true,
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => false,
            }
    }
}

/// Persisted companion wallet session. Amounts are base-10 integers in the
/// token's smallest unit.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StoredSession {
    pub session_key: String,
    /// Owning claim or organization reference.
    pub owner_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    /// Ephemeral deposit address.
    pub address: String,
    pub chain_id: u64,
    pub from_token: TokenRef,
    pub to_token: TokenRef,
    /// Destination amount the recipient must receive.
    pub target_amount_raw: String,
    /// Source amount that converts into the target.
    pub swap_input_raw: String,
    /// Treasury fee, in source units.
    pub fee_raw: String,
    /// Amount the payer is asked to deposit.
    pub required_deposit_raw: String,
    pub gas_reserve_raw: String,
    pub dust_threshold_raw: String,
    pub recipient: String,
    /// Where refunds go.
    pub refund_address: String,
    pub fee_recipient: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_tx_hash: Option<String>,
    /// Native gas sent by the sponsor to an ERC-20 source address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_topup_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_tx_hash: Option<String>,
    /// Leftover balance returned after completion or refund.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residual_tx_hash: Option<String>,
    /// Set once nothing worth moving is left at the address. The key is only
    /// burned after this.
    #[serde(default)]
    pub residual_swept: bool,
    /// The bound claim has been told about the terminal outcome.
    #[serde(default)]
    pub claim_notified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for session metadata and ephemeral key files.
pub struct SessionRepository<'a> {
    storage: &'a FileStore,
}

impl<'a> SessionRepository<'a> {
    pub fn new(storage: &'a FileStore) -> Self {
        Self { storage }
    }

    pub fn exists(&self, session_key: &str) -> bool {
        self.storage
            .exists(self.storage.paths().session_meta(session_key))
    }

    pub fn get(&self, session_key: &str) -> StorageResult<StoredSession> {
        let path = self.storage.paths().session_meta(session_key);
        if !self.storage.exists(&path) {
            return Err(StorageError::NotFound(format!("Session {session_key}")));
        }
        self.storage.read_json(path)
    }

    /// Persist a new session together with its key (PKCS#8 PEM).
    pub fn create(&self, session: &StoredSession, private_key_pem: &[u8]) -> StorageResult<()> {
        if self.exists(&session.session_key) {
            return Err(StorageError::AlreadyExists(format!(
                "Session {}",
                session.session_key
            )));
        }
        self.storage.write_raw(
            self.storage.paths().session_key(&session.session_key),
            private_key_pem,
        )?;
        self.storage.write_json(
            self.storage.paths().session_meta(&session.session_key),
            session,
        )
    }

    pub fn update(&self, session: &mut StoredSession) -> StorageResult<()> {
        if !self.exists(&session.session_key) {
            return Err(StorageError::NotFound(format!(
                "Session {}",
                session.session_key
            )));
        }
        session.updated_at = Utc::now();
        self.storage.write_json(
            self.storage.paths().session_meta(&session.session_key),
            session,
        )
    }

    /// Read the ephemeral key. Fails once the session has been burned.
    pub fn read_private_key(&self, session_key: &str) -> StorageResult<Vec<u8>> {
        let path = self.storage.paths().session_key(session_key);
        if !self.storage.exists(&path) {
            return Err(StorageError::NotFound(format!(
                "Session {session_key} private key"
            )));
        }
        self.storage.read_raw(path)
    }

    pub fn has_private_key(&self, session_key: &str) -> bool {
        self.storage
            .exists(self.storage.paths().session_key(session_key))
    }

    /// Delete the ephemeral key file.
    pub fn burn_key(&self, session_key: &str) -> StorageResult<()> {
        self.storage
            .delete(self.storage.paths().session_key(session_key))
    }

    pub fn list(&self) -> StorageResult<Vec<StoredSession>> {
        let keys = self.storage.list_dirs(self.storage.paths().sessions_dir())?;
        let mut sessions = Vec::new();
        for key in keys {
            match self.get(&key) {
                Ok(session) => sessions.push(session),
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}
