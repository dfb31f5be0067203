// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Settlement intent repository.
//!
//! An intent is one attempt to pay a claim through the external rail. A
//! re-quote supersedes the previous intent instead of deleting it, so the
//! history of deposit addresses handed out for a claim stays on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::super::{FileStore, StorageError, StorageResult};

/// Persisted settlement intent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StoredIntent {
    pub id: String,
    /// Owning claim.
    pub claim_id: String,
    /// Provider quote identifier.
    pub quote_id: String,
    /// Where the payer sends funds.
    pub deposit_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_memo: Option<String>,
    pub deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    /// Last normalized provider status (`PENDING`, `PROCESSING`, ...).
    pub status: String,
    pub source_chain: String,
    pub destination_chain: String,
    /// Amount the provider reported as deposited, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_amount: Option<String>,
    /// Raw body of the last status response.
    #[schema(value_type = Option<Object>)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_payload: Option<serde_json::Value>,
    /// Replaced by a newer intent for the same claim.
    #[serde(default)]
    pub superseded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why an intent stopped being payable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentExpiry {
    /// Provider deadline passed.
    Deadline,
    /// Older than the configured maximum age.
    MaxAge,
}

impl StoredIntent {
    /// Expiry at `now`; the deadline is checked first.
    pub fn expiry_at(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> Option<IntentExpiry> {
        if now > self.deadline {
            Some(IntentExpiry::Deadline)
        } else if now - self.created_at > max_age {
            Some(IntentExpiry::MaxAge)
        } else {
            None
        }
    }
}

/// Repository for intent documents.
pub struct IntentRepository<'a> {
    storage: &'a FileStore,
}

impl<'a> IntentRepository<'a> {
    pub fn new(storage: &'a FileStore) -> Self {
        Self { storage }
    }

    pub fn exists(&self, intent_id: &str) -> bool {
        self.storage.exists(self.storage.paths().intent(intent_id))
    }

    pub fn get(&self, intent_id: &str) -> StorageResult<StoredIntent> {
        let path = self.storage.paths().intent(intent_id);
        if !self.storage.exists(&path) {
            return Err(StorageError::NotFound(format!("Intent {intent_id}")));
        }
        self.storage.read_json(path)
    }

    pub fn create(&self, intent: &StoredIntent) -> StorageResult<()> {
        if self.exists(&intent.id) {
            return Err(StorageError::AlreadyExists(format!("Intent {}", intent.id)));
        }
        self.storage
            .write_json(self.storage.paths().intent(&intent.id), intent)
    }

    pub fn update(&self, intent: &mut StoredIntent) -> StorageResult<()> {
        if !self.exists(&intent.id) {
            return Err(StorageError::NotFound(format!("Intent {}", intent.id)));
        }
        intent.updated_at = Utc::now();
        self.storage
            .write_json(self.storage.paths().intent(&intent.id), intent)
    }

    /// All intents of a claim, newest first.
    pub fn list_for_claim(&self, claim_id: &str) -> StorageResult<Vec<StoredIntent>> {
        let ids = self
            .storage
            .list_files(self.storage.paths().intents_dir(), "json")?;

        let mut intents = Vec::new();
        for id in ids {
            let intent = self.get(&id)?;
            if intent.claim_id == claim_id {
                intents.push(intent);
            }
        }
        intents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(intents)
    }

    /// The newest non-superseded intent of a claim.
    pub fn active_for_claim(&self, claim_id: &str) -> StorageResult<Option<StoredIntent>> {
        Ok(self
            .list_for_claim(claim_id)?
            .into_iter()
            .find(|intent| !intent.superseded))
    }
}
