// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit trail for settlement state changes.
//!
//! Terminal claim transitions, companion session outcomes, attestation
//! records and operator triggers are appended to a daily JSONL file so an
//! operator can reconstruct what the engine did without the process logs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{FileStore, StorageError, StorageResult};

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Claim events
    ClaimCreated,
    ClaimTransitioned,

    // Intent events
    IntentCreated,
    IntentExpired,

    // Companion session events
    SessionCreated,
    SessionCompleted,
    SessionRefunded,
    SessionFailed,

    // Attestation events
    AttestationRecorded,
    AttestationFailed,
    ReceiptRecorded,

    // Operator events
    OperatorTrigger,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of event.
    pub event_type: AuditEventType,
    /// Who triggered the event (`engine`, `operator`, ...).
    pub actor: Option<String>,
    /// Resource affected (claim id, session key, ...).
    pub resource_id: Option<String>,
    /// Resource type (claim, intent, session, receipt).
    pub resource_type: Option<String>,
    /// Additional details as JSON.
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message if operation failed.
    pub error: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            actor: None,
            resource_id: None,
            resource_type: None,
            details: None,
            success: true,
            error: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark as failed with error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Repository for audit events.
pub struct AuditRepository<'a> {
    storage: &'a FileStore,
}

impl<'a> AuditRepository<'a> {
    pub fn new(storage: &'a FileStore) -> Self {
        Self { storage }
    }

    /// Append an event to its day's JSONL file.
    pub fn log(&self, event: &AuditEvent) -> StorageResult<()> {
        let date = event.timestamp.format("%Y-%m-%d").to_string();
        let path = self.storage.paths().audit_events_file(&date);

        let mut content = match self.storage.read_raw(&path) {
            Ok(content) => content,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let event_json = serde_json::to_string(event).map_err(|e| {
            StorageError::SerializationError(format!("Failed to serialize audit event: {e}"))
        })?;

        if !content.is_empty() && !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        content.extend_from_slice(event_json.as_bytes());
        content.push(b'\n');

        self.storage.write_raw(&path, &content)
    }

    /// Read audit events for a specific date.
    pub fn read_events(&self, date: &str) -> StorageResult<Vec<AuditEvent>> {
        let path = self.storage.paths().audit_events_file(date);
        let content = self.storage.read_raw(&path)?;

        let content_str = String::from_utf8(content).map_err(|e| {
            StorageError::SerializationError(format!("Invalid UTF-8 in audit log: {e}"))
        })?;

        content_str
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    StorageError::SerializationError(format!(
                        "Failed to deserialize audit event: {e}"
                    ))
                })
            })
            .collect()
    }

    /// Read events for an inclusive date range. Days without a log are skipped.
    pub fn read_events_range(
        &self,
        start_date: &str,
        end_date: &str,
    ) -> StorageResult<Vec<AuditEvent>> {
        let start = NaiveDate::parse_from_str(start_date, "%Y-%m-%d")
            .map_err(|e| StorageError::SerializationError(format!("Invalid start date: {e}")))?;
        let end = NaiveDate::parse_from_str(end_date, "%Y-%m-%d")
            .map_err(|e| StorageError::SerializationError(format!("Invalid end date: {e}")))?;

        let mut all_events = Vec::new();
        let mut current = start;
        while current <= end {
            match self.read_events(&current.format("%Y-%m-%d").to_string()) {
                Ok(events) => all_events.extend(events),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            current = current
                .succ_opt()
                .ok_or_else(|| StorageError::SerializationError("Date overflow".to_string()))?;
        }

        Ok(all_events)
    }

    /// Events touching one resource on a given day.
    pub fn search_by_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        date: &str,
    ) -> StorageResult<Vec<AuditEvent>> {
        let events = self.read_events(date)?;
        Ok(events
            .into_iter()
            .filter(|e| {
                e.resource_type.as_deref() == Some(resource_type)
                    && e.resource_id.as_deref() == Some(resource_id)
            })
            .collect())
    }
}

/// Best-effort audit append; failures are logged and swallowed.
#[macro_export]
macro_rules! audit_log {
    ($storage:expr, $event:expr) => {{
        let repo = $crate::storage::AuditRepository::new($storage);
        if let Err(error) = repo.log(&$event) {
            tracing::warn!(%error, "Failed to append audit event");
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileStore) {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).unwrap();
        (temp, store)
    }

    #[test]
    fn builder_sets_fields() {
        let event = AuditEvent::new(AuditEventType::SessionRefunded)
            .with_actor("engine")
            .with_resource("session", "s-1")
            .failed("balance too low for refund");

        assert_eq!(event.event_type, AuditEventType::SessionRefunded);
        assert_eq!(event.actor.as_deref(), Some("engine"));
        assert_eq!(event.resource_id.as_deref(), Some("s-1"));
        assert!(!event.success);
    }

    #[test]
    fn log_appends_in_order() {
        let (_temp, store) = setup();
        let repo = AuditRepository::new(&store);

        repo.log(&AuditEvent::new(AuditEventType::ClaimCreated).with_resource("claim", "c1"))
            .unwrap();
        repo.log(
            &AuditEvent::new(AuditEventType::ClaimTransitioned)
                .with_resource("claim", "c1")
                .with_details(serde_json::json!({"from": "IN_FLIGHT", "to": "SUCCESS"})),
        )
        .unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let events = repo.read_events(&today).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::ClaimCreated);
        assert_eq!(events[1].event_type, AuditEventType::ClaimTransitioned);
    }

    #[test]
    fn search_by_resource_filters() {
        let (_temp, store) = setup();
        let repo = AuditRepository::new(&store);
        repo.log(&AuditEvent::new(AuditEventType::ClaimCreated).with_resource("claim", "a"))
            .unwrap();
        repo.log(&AuditEvent::new(AuditEventType::ClaimCreated).with_resource("claim", "b"))
            .unwrap();
        repo.log(&AuditEvent::new(AuditEventType::SessionCreated).with_resource("session", "a"))
            .unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let events = repo.search_by_resource("claim", "a", &today).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn range_skips_missing_days() {
        let (_temp, store) = setup();
        let repo = AuditRepository::new(&store);
        repo.log(&AuditEvent::new(AuditEventType::OperatorTrigger)).unwrap();

        let today = Utc::now().date_naive();
        let start = (today - chrono::Duration::days(3)).format("%Y-%m-%d").to_string();
        let end = today.format("%Y-%m-%d").to_string();
        let events = repo.read_events_range(&start, &end).unwrap();
        assert_eq!(events.len(), 1);
    }
}
