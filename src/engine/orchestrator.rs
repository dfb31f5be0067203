// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Orchestration Loop
//!
//! One tick walks the pending-work index oldest first and hands each item to
//! the claim machine or the companion manager. Items run sequentially; a
//! failing item is recorded in the report and the tick moves on. Only lock
//! store or persistence failures end a tick early.
//!
//! Overlapping ticks within the process are refused through an atomic flag,
//! cross-process overlap is handled by the per-item locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::companion::CompanionManager;
use super::machine::ClaimMachine;
use crate::attestation::{AttestationRecorder, SweepReport};
use crate::error::{ErrorKind, SettlementError, SettlementResult};
use crate::storage::{WorkDatabase, WorkItem};

/// Outcome of a single work item within a tick.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    /// Index key, `intent:<id>` or `session:<key>`.
    pub key: String,
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    pub processed: usize,
    pub results: Vec<ItemResult>,
}

impl ProcessReport {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

/// Clears the processing flag on every exit path.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    work_db: Arc<WorkDatabase>,
    machine: Arc<ClaimMachine>,
    companion: Arc<CompanionManager>,
    recorder: AttestationRecorder,
    processing: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        work_db: Arc<WorkDatabase>,
        machine: Arc<ClaimMachine>,
        companion: Arc<CompanionManager>,
        recorder: AttestationRecorder,
    ) -> Self {
        Self {
            work_db,
            machine,
            companion,
            recorder,
            processing: AtomicBool::new(false),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Run one tick over the pending-work index.
    ///
    /// Returns `Busy` when a tick is already running in this process.
    pub async fn process_pending(&self) -> SettlementResult<ProcessReport> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SettlementError::Busy("a tick is already running".to_string()));
        }
        let _guard = ProcessingGuard(&self.processing);

        let entries = self.work_db.list_pending()?;
        let mut report = ProcessReport::default();

        for entry in entries {
            let key = entry.item.key();
            let result = match &entry.item {
                WorkItem::Intent(id) => self
                    .machine
                    .process_intent(id)
                    .await
                    .map(|action| action.as_str().to_string()),
                WorkItem::Session(session_key) => self
                    .companion
                    .process_session(session_key)
                    .await
                    .map(|action| action.as_str().to_string()),
            };

            let item = match result {
                Ok(action) => ItemResult {
                    key,
                    action,
                    success: true,
                    error: None,
                },
                Err(error) if error.aborts_tick() => {
                    warn!(item = %key, %error, "Tick aborted");
                    return Err(error);
                }
                Err(error) => {
                    if error.kind() == ErrorKind::NotFound {
                        // Index entry without a document behind it.
                        self.work_db.remove_pending(&entry.item)?;
                    }
                    warn!(item = %key, kind = ?error.kind(), %error, "Work item failed");
                    ItemResult {
                        key,
                        action: "error".to_string(),
                        success: false,
                        error: Some(error.public_message()),
                    }
                }
            };
            report.results.push(item);
        }

        report.processed = report.results.len();
        if report.processed > 0 {
            info!(
                processed = report.processed,
                failed = report.failures(),
                "Settlement tick finished"
            );
        }
        Ok(report)
    }

    /// Attest every successful claim still lacking an attestation.
    pub async fn sweep_attestations(&self) -> SettlementResult<SweepReport> {
        self.recorder.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_clears_flag_on_drop() {
        let flag = AtomicBool::new(true);
        {
            let _guard = ProcessingGuard(&flag);
            assert!(flag.load(Ordering::Acquire));
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn report_counts_failures_and_serializes_camel_case() {
        let report = ProcessReport {
            processed: 2,
            results: vec![
                ItemResult {
                    key: "intent:a".into(),
                    action: "unchanged".into(),
                    success: true,
                    error: None,
                },
                ItemResult {
                    key: "session:b".into(),
                    action: "error".into(),
                    success: false,
                    error: Some("execution failed".into()),
                },
            ],
        };
        assert_eq!(report.failures(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["processed"], 2);
        assert!(json["results"][0].get("error").is_none());
        assert_eq!(json["results"][1]["error"], "execution failed");
    }
}
