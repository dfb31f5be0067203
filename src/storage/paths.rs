// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path constants and utilities for the settlement data directory.

use std::path::{Path, PathBuf};

/// Default base directory for all persistent settlement data.
pub const DATA_ROOT: &str = "/data";

/// Storage path utilities for the settlement data directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========== Claim Paths ==========

    /// Directory containing all claims.
    pub fn claims_dir(&self) -> PathBuf {
        self.root.join("claims")
    }

    /// Path to a specific claim document.
    pub fn claim(&self, claim_id: &str) -> PathBuf {
        self.claims_dir().join(format!("{claim_id}.json"))
    }

    // ========== Settlement Intent Paths ==========

    /// Directory containing all settlement intents.
    pub fn intents_dir(&self) -> PathBuf {
        self.root.join("intents")
    }

    /// Path to a specific settlement intent document.
    pub fn intent(&self, intent_id: &str) -> PathBuf {
        self.intents_dir().join(format!("{intent_id}.json"))
    }

    // ========== Companion Session Paths ==========

    /// Directory containing all companion wallet sessions.
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Directory for a specific session.
    pub fn session_dir(&self, session_key: &str) -> PathBuf {
        self.sessions_dir().join(session_key)
    }

    /// Path to session metadata.
    pub fn session_meta(&self, session_key: &str) -> PathBuf {
        self.session_dir(session_key).join("meta.json")
    }

    /// Path to the ephemeral private key of a session (PKCS#8 PEM).
    pub fn session_key(&self, session_key: &str) -> PathBuf {
        self.session_dir(session_key).join("key.pem")
    }

    // ========== Work Database ==========

    /// Path to the embedded work database (pending-work index, locks).
    pub fn work_db(&self) -> PathBuf {
        self.root.join("work.redb")
    }

    // ========== Audit Log Paths ==========

    /// Directory containing audit logs.
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    /// Directory for a specific date's audit logs.
    pub fn audit_date_dir(&self, date: &str) -> PathBuf {
        self.audit_dir().join(date)
    }

    /// Path to a daily audit events file (JSONL format).
    pub fn audit_events_file(&self, date: &str) -> PathBuf {
        self.audit_date_dir(date).join("events.jsonl")
    }
}
