//! Shared model types: scopes, entry kinds, and the common vocabulary used by
//! repositories, indices, and the query pipeline.

mod entry;
mod evidence;
mod graph;
pub(crate) mod records;

pub use entry::{
    Entry, EntryDraft, EntryPatch, EntryVersion, ExperienceLevel, OutcomeRecord, VersionedFields,
};
pub use evidence::{Evidence, EvidenceDraft};
pub use graph::{EdgeDraft, GraphEdge, GraphNode, GraphNodeDraft, GraphNodeVersion, TraverseDirection};
pub use records::{AuditRecord, FileLock, MemoryEvent, Tag};

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current UTC time. All persisted timestamps derive from this.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// RFC3339 wire/storage form of a timestamp.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored RFC3339 timestamp.
pub fn parse_ts(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Internal(format!("bad timestamp {s:?}: {e}")))
}

/// New opaque id (UUIDv4, hyphenated).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The four scope levels, most general first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Org,
    Project,
    Session,
}

impl ScopeType {
    /// Distance from the global root (global = 0, session = 3). Higher is
    /// more specific.
    pub fn depth(&self) -> u8 {
        match self {
            Self::Global => 0,
            Self::Org => 1,
            Self::Project => 2,
            Self::Session => 3,
        }
    }

    /// The level one step toward global, if any.
    pub fn parent(&self) -> Option<Self> {
        match self {
            Self::Global => None,
            Self::Org => Some(Self::Global),
            Self::Project => Some(Self::Org),
            Self::Session => Some(Self::Project),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Org => "org",
            Self::Project => "project",
            Self::Session => "session",
        }
    }
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScopeType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "org" => Ok(Self::Org),
            "project" => Ok(Self::Project),
            "session" => Ok(Self::Session),
            other => Err(CoreError::InvalidScopeType(other.to_string())),
        }
    }
}

/// A concrete scope reference. `scope_id` is `None` only for the (unique)
/// global scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeRef {
    #[serde(rename = "scopeType")]
    pub scope_type: ScopeType,
    #[serde(rename = "scopeId", default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

impl ScopeRef {
    pub fn global() -> Self {
        Self {
            scope_type: ScopeType::Global,
            scope_id: None,
        }
    }

    pub fn new(scope_type: ScopeType, scope_id: impl Into<String>) -> Self {
        Self {
            scope_type,
            scope_id: Some(scope_id.into()),
        }
    }

    /// Non-global scopes require an id; global forbids one.
    pub fn validate(&self) -> CoreResult<()> {
        match (self.scope_type, &self.scope_id) {
            (ScopeType::Global, None) => Ok(()),
            (ScopeType::Global, Some(_)) => Err(CoreError::InvalidParameter {
                name: "scopeId".into(),
                reason: "global scope takes no scope id".into(),
            }),
            (_, Some(id)) if !id.trim().is_empty() => Ok(()),
            _ => Err(CoreError::MissingField("scopeId".into())),
        }
    }

    /// Storage key form of the id (`""` for global).
    pub fn id_key(&self) -> &str {
        self.scope_id.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope_id {
            Some(id) => write!(f, "{}:{}", self.scope_type, id),
            None => write!(f, "{}", self.scope_type),
        }
    }
}

/// The four versioned entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Guideline,
    Knowledge,
    Tool,
    Experience,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guideline => "guideline",
            Self::Knowledge => "knowledge",
            Self::Tool => "tool",
            Self::Experience => "experience",
        }
    }

    /// Kinds whose `name` must be unique within an active scope.
    pub fn has_unique_name(&self) -> bool {
        matches!(self, Self::Guideline | Self::Tool)
    }

    pub fn all() -> [Self; 4] {
        [Self::Guideline, Self::Knowledge, Self::Tool, Self::Experience]
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guideline" | "guidelines" => Ok(Self::Guideline),
            "knowledge" => Ok(Self::Knowledge),
            "tool" | "tools" => Ok(Self::Tool),
            "experience" | "experiences" => Ok(Self::Experience),
            other => Err(CoreError::InvalidParameter {
                name: "type".into(),
                reason: format!("unknown entry kind {other:?}"),
            }),
        }
    }
}

/// Fixed relation vocabulary between entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    AppliesTo,
    DependsOn,
    ConflictsWith,
    RelatedTo,
    ParentTask,
    SubtaskOf,
    PromotedTo,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppliesTo => "applies_to",
            Self::DependsOn => "depends_on",
            Self::ConflictsWith => "conflicts_with",
            Self::RelatedTo => "related_to",
            Self::ParentTask => "parent_task",
            Self::SubtaskOf => "subtask_of",
            Self::PromotedTo => "promoted_to",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "applies_to" => Ok(Self::AppliesTo),
            "depends_on" => Ok(Self::DependsOn),
            "conflicts_with" => Ok(Self::ConflictsWith),
            "related_to" => Ok(Self::RelatedTo),
            "parent_task" => Ok(Self::ParentTask),
            "subtask_of" => Ok(Self::SubtaskOf),
            "promoted_to" => Ok(Self::PromotedTo),
            other => Err(CoreError::InvalidParameter {
                name: "relationType".into(),
                reason: format!("unknown relation type {other:?}"),
            }),
        }
    }
}

/// A relation row between two entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    #[serde(rename = "sourceType")]
    pub source_type: EntryKind,
    #[serde(rename = "sourceId")]
    pub source_id: String,
    #[serde(rename = "targetType")]
    pub target_type: EntryKind,
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "relationType")]
    pub relation_type: RelationType,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_scope_depth_ordering() {
        assert!(ScopeType::Session.depth() > ScopeType::Project.depth());
        assert!(ScopeType::Project.depth() > ScopeType::Org.depth());
        assert!(ScopeType::Org.depth() > ScopeType::Global.depth());
    }

    #[test]
    fn test_scope_parent_chain() {
        assert_eq!(ScopeType::Session.parent(), Some(ScopeType::Project));
        assert_eq!(ScopeType::Global.parent(), None);
    }

    #[test]
    fn test_scope_ref_validation() {
        assert!(ScopeRef::global().validate().is_ok());
        assert!(ScopeRef::new(ScopeType::Project, "p1").validate().is_ok());
        let missing = ScopeRef {
            scope_type: ScopeType::Project,
            scope_id: None,
        };
        assert!(missing.validate().is_err());
        let extra = ScopeRef {
            scope_type: ScopeType::Global,
            scope_id: Some("x".into()),
        };
        assert!(extra.validate().is_err());
    }

    #[test]
    fn test_entry_kind_parse_accepts_plurals() {
        assert_eq!(EntryKind::from_str("guidelines").unwrap(), EntryKind::Guideline);
        assert_eq!(EntryKind::from_str("tools").unwrap(), EntryKind::Tool);
        assert!(EntryKind::from_str("nope").is_err());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = now();
        let parsed = parse_ts(&fmt_ts(ts)).unwrap();
        assert_eq!(parsed.timestamp_micros(), ts.timestamp_micros());
    }
}
