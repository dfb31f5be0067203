// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Persistent state of the settlement engine.
//!
//! ## Storage Layout
//!
//! ```text
//! $DATA_DIR/
//!   claims/{claim_id}.json
//!   intents/{intent_id}.json
//!   sessions/{session_key}/
//!     meta.json       # Session metadata (address, amounts, status)
//!     key.pem         # Ephemeral key (removed once the session is burned)
//!   work.redb         # Pending-work index, lock table, counters
//!   audit/
//!     {date}/events.jsonl  # Daily audit logs
//! ```
//!
//! Documents are plain JSON written with an atomic rename. The redb file
//! holds everything that needs transactional updates across processes.

pub mod audit;
pub mod file_store;
pub mod paths;
pub mod price_cache;
pub mod repository;
pub mod work_db;

pub use audit::{AuditEvent, AuditEventType, AuditRepository};
pub use file_store::{FileStore, StorageError, StorageResult};
pub use paths::StoragePaths;
pub use price_cache::PriceCache;
pub use repository::{
    ClaimRepository, ClaimStatus, IntentExpiry, IntentRepository, SessionRepository,
    SessionStatus, StoredClaim, StoredIntent, StoredSession, TokenRef,
};
pub use work_db::{WorkDatabase, WorkDbError, WorkDbResult, WorkEntry, WorkItem};
