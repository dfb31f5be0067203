// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Distributed Lock
//!
//! TTL-bounded mutual exclusion keyed by claim, session or attestation id.
//!
//! A lock record is only written when absent or expired, so a crashed worker
//! never blocks an item for longer than the TTL. `release` is best-effort: if
//! it fails, the record simply expires.
//!
//! Two stores are provided:
//! - [`RedbLockStore`]: the lock table in the shared work database. Every
//!   process opening the same data directory sees the same locks.
//! - [`MemoryLockStore`]: process-local, used by tests and single-node tools.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SettlementError;
use crate::storage::WorkDatabase;

/// Default lock expiry.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Lock guarding every mutation of one claim.
pub fn claim_lock_key(claim_id: &str) -> String {
    format!("claim:{claim_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

impl From<LockError> for SettlementError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable(msg) => SettlementError::LockUnavailable(msg),
        }
    }
}

/// Key-value store supporting atomic set-if-absent-with-expiry and delete.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` if absent or expired. `Ok(false)` when another holder has it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` unconditionally.
    async fn release(&self, key: &str) -> Result<(), LockError>;
}

// =============================================================================
// Stores
// =============================================================================

/// Lock table inside the redb work database.
pub struct RedbLockStore {
    db: Arc<WorkDatabase>,
}

impl RedbLockStore {
    pub fn new(db: Arc<WorkDatabase>) -> Self {
        Self { db }
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[async_trait]
impl LockStore for RedbLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.db
            .try_lock(key, now_millis(), ttl_ms)
            .map_err(|e| LockError::Unavailable(e.to_string()))
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.db
            .unlock(key)
            .map_err(|e| LockError::Unavailable(e.to_string()))
    }
}

/// Process-local lock store.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LockError::Unavailable("lock table poisoned".to_string()))?;
        let now = Instant::now();
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LockError::Unavailable("lock table poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

// =============================================================================
// DistributedLock
// =============================================================================

/// Result of a scoped acquisition.
#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was taken and the closure ran.
    Acquired(T),
    /// Another holder has the key; the closure was not invoked.
    NotAcquired,
}

impl<T> LockOutcome<T> {
    pub fn acquired(self) -> Option<T> {
        match self {
            LockOutcome::Acquired(value) => Some(value),
            LockOutcome::NotAcquired => None,
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    default_ttl: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        self.store.try_acquire(key, ttl).await
    }

    /// Best-effort delete; failures are logged and the record expires on its own.
    pub async fn release(&self, key: &str) {
        if let Err(error) = self.store.release(key).await {
            warn!(lock_key = %key, %error, "Failed to release lock");
        }
    }

    /// Run `f` while holding `key`.
    ///
    /// The lock is released on every exit path, including when the returned
    /// future is dropped before completion. Returns
    /// [`LockOutcome::NotAcquired`] without invoking `f` when the key is held.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<LockOutcome<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(key, ttl).await? {
            debug!(lock_key = %key, "Lock held elsewhere, skipping");
            return Ok(LockOutcome::NotAcquired);
        }

        let mut guard = ReleaseGuard {
            store: Some(self.store.clone()),
            key: key.to_string(),
        };
        let value = f().await;
        guard.disarm();
        self.release(key).await;
        Ok(LockOutcome::Acquired(value))
    }
}

/// Releases the lock from `Drop` if the scoped future was cancelled or panicked.
struct ReleaseGuard {
    store: Option<Arc<dyn LockStore>>,
    key: String,
}

impl ReleaseGuard {
    fn disarm(&mut self) {
        self.store = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = store.release(&key).await {
                    warn!(lock_key = %key, %error, "Failed to release abandoned lock");
                }
            });
        }
    }
}
