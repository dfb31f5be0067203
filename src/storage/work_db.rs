// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded work database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `pending_work`: work key (`intent:<id>` / `session:<key>`) → JSON entry
//! - `locks`: lock key → expiry (unix millis)
//! - `counters`: counter name → u64 (receipt nonces)
//!
//! redb serializes write transactions, so the read-check-insert performed in
//! [`WorkDatabase::try_lock`] is atomic with respect to every other writer of
//! the same database file.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

// =============================================================================
// Table Definitions
// =============================================================================

/// Pending-work index: work key → serialized [`WorkEntry`].
const PENDING_WORK: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_work");

/// Lock table: lock key → expiry as unix milliseconds.
const LOCKS: TableDefinition<&str, u64> = TableDefinition::new("locks");

/// Monotonic counters: name → last issued value.
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkDbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid work key: {0}")]
    InvalidKey(String),
}

pub type WorkDbResult<T> = Result<T, WorkDbError>;

// =============================================================================
// Work Items
// =============================================================================

/// A unit of in-flight work discovered by the orchestration loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum WorkItem {
    /// A settlement intent awaiting provider completion.
    Intent(String),
    /// A companion wallet session awaiting funding or execution.
    Session(String),
}

impl WorkItem {
    /// Opaque index key.
    pub fn key(&self) -> String {
        match self {
            WorkItem::Intent(id) => format!("intent:{id}"),
            WorkItem::Session(key) => format!("session:{key}"),
        }
    }

    /// Parse an index key back into a work item.
    pub fn parse(key: &str) -> WorkDbResult<Self> {
        match key.split_once(':') {
            Some(("intent", id)) if !id.is_empty() => Ok(WorkItem::Intent(id.to_string())),
            Some(("session", id)) if !id.is_empty() => Ok(WorkItem::Session(id.to_string())),
            _ => Err(WorkDbError::InvalidKey(key.to_string())),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Index entry stored per work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkEntry {
    pub item: WorkItem,
    pub added_at: DateTime<Utc>,
}

// =============================================================================
// WorkDatabase
// =============================================================================

/// Embedded ACID database for the pending-work index and lock table.
pub struct WorkDatabase {
    db: Database,
}

impl WorkDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> WorkDbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PENDING_WORK)?;
            let _ = write_txn.open_table(LOCKS)?;
            let _ = write_txn.open_table(COUNTERS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // =========================================================================
    // Pending-work index
    // =========================================================================

    /// Add a work item. Re-adding keeps the original `added_at`.
    pub fn add_pending(&self, item: &WorkItem) -> WorkDbResult<()> {
        let key = item.key();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_WORK)?;
            let present = table.get(key.as_str())?.is_some();
            if !present {
                let entry = WorkEntry {
                    item: item.clone(),
                    added_at: Utc::now(),
                };
                let json = serde_json::to_vec(&entry)?;
                table.insert(key.as_str(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a work item. Returns whether it was present.
    pub fn remove_pending(&self, item: &WorkItem) -> WorkDbResult<bool> {
        let key = item.key();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PENDING_WORK)?;
            let existed = table.remove(key.as_str())?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Whether a work item is currently indexed.
    pub fn is_pending(&self, item: &WorkItem) -> WorkDbResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_WORK)?;
        Ok(table.get(item.key().as_str())?.is_some())
    }

    /// All indexed work entries, oldest first.
    pub fn list_pending(&self) -> WorkDbResult<Vec<WorkEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_WORK)?;

        let mut entries = Vec::new();
        for row in table.iter()? {
            let (_key, value) = row?;
            let entry: WorkEntry = serde_json::from_slice(value.value())?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        Ok(entries)
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Set `key` only if absent or expired. Returns true when the caller now
    /// holds the lock.
    pub fn try_lock(&self, key: &str, now_ms: u64, ttl_ms: u64) -> WorkDbResult<bool> {
        let write_txn = self.db.begin_write()?;
        let acquired = {
            let mut table = write_txn.open_table(LOCKS)?;
            let held = table
                .get(key)?
                .map(|expiry| expiry.value())
                .is_some_and(|expires_at| expires_at > now_ms);
            if held {
                false
            } else {
                table.insert(key, now_ms.saturating_add(ttl_ms))?;
                true
            }
        };
        write_txn.commit()?;
        Ok(acquired)
    }

    /// Delete a lock record unconditionally.
    pub fn unlock(&self, key: &str) -> WorkDbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOCKS)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Increment and return a named counter (first value is 1).
    pub fn next_counter(&self, name: &str) -> WorkDbResult<u64> {
        let write_txn = self.db.begin_write()?;
        let next = {
            let mut table = write_txn.open_table(COUNTERS)?;
            let current = table.get(name)?.map(|v| v.value()).unwrap_or(0);
            let next = current + 1;
            table.insert(name, next)?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }
}
