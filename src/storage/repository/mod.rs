// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Repository layer providing typed access to the file store.
//!
//! Each repository provides CRUD operations for one entity type, using the
//! `FileStore` for all file operations.

pub mod claims;
pub mod intents;
pub mod sessions;

pub use claims::{ClaimRepository, ClaimStatus, StoredClaim};
pub use intents::{IntentExpiry, IntentRepository, StoredIntent};
pub use sessions::{SessionRepository, SessionStatus, StoredSession, TokenRef};
