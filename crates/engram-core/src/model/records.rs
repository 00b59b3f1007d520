//! Tags, file locks, audit records, and the event vocabulary.

use super::{EntryKind, ScopeRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A global tag. Names are lowercase, trimmed, and unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Canonical tag-name form: lowercase, trimmed.
pub(crate) fn normalize_tag(name: &str) -> String {
    name.trim().to_lowercase()
}

/// An advisory lock over an absolute file path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "checkedOutBy")]
    pub checked_out_by: String,
    #[serde(rename = "checkedOutAt")]
    pub checked_out_at: DateTime<Utc>,
    #[serde(rename = "expiresAt", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl FileLock {
    /// True once the TTL has passed. Locks without a TTL never expire.
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |e| e <= at)
    }
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    #[serde(rename = "entryType", default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<String>,
    #[serde(rename = "entryId", default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(rename = "scopeType", default, skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<String>,
    #[serde(rename = "scopeId", default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Events delivered on the in-process bus after a committed write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MemoryEvent {
    EntryCreated {
        kind: EntryKind,
        id: String,
        scope: ScopeRef,
    },
    EntryUpdated {
        kind: EntryKind,
        id: String,
        scope: ScopeRef,
    },
    EntryDeleted {
        kind: EntryKind,
        id: String,
        scope: ScopeRef,
    },
    FeedbackRecorded {
        #[serde(rename = "entryId")]
        entry_id: String,
        success: bool,
    },
    LockChanged {
        #[serde(rename = "filePath")]
        file_path: String,
    },
    MaintenanceCompleted {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

impl MemoryEvent {
    /// Whether this event invalidates cached query results.
    pub fn invalidates_queries(&self) -> bool {
        !matches!(self, Self::LockChanged { .. })
    }

    /// Short action label for audit rows and logs.
    pub fn action(&self) -> &'static str {
        match self {
            Self::EntryCreated { .. } => "entry_created",
            Self::EntryUpdated { .. } => "entry_updated",
            Self::EntryDeleted { .. } => "entry_deleted",
            Self::FeedbackRecorded { .. } => "feedback_recorded",
            Self::LockChanged { .. } => "lock_changed",
            Self::MaintenanceCompleted { .. } => "maintenance_completed",
        }
    }
}
