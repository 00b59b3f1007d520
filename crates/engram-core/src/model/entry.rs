//! Versioned entry identity rows and their append-only version chains.

use super::{EntryKind, ScopeRef};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Experience maturity lattice: `case < strategy < skill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    Case,
    Strategy,
    Skill,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Case => "case",
            Self::Strategy => "strategy",
            Self::Skill => "skill",
        }
    }

    /// Next level up, if not already at `skill`.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Case => Some(Self::Strategy),
            Self::Strategy => Some(Self::Skill),
            Self::Skill => None,
        }
    }
}

impl std::fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExperienceLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "case" => Ok(Self::Case),
            "strategy" => Ok(Self::Strategy),
            "skill" => Ok(Self::Skill),
            other => Err(CoreError::InvalidParameter {
                name: "level".into(),
                reason: format!("unknown experience level {other:?}"),
            }),
        }
    }
}

/// The mutable payload captured in each version row. A new version is written
/// only when at least one of these fields changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedFields {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Free-form examples, stored as a JSON array.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Knowledge validity window start (inclusive).
    #[serde(rename = "validFrom", default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// Knowledge validity window end (exclusive).
    #[serde(rename = "validUntil", default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// One row in an entry's append-only version chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryVersion {
    #[serde(rename = "versionId")]
    pub version_id: String,
    #[serde(rename = "entryId")]
    pub entry_id: String,
    #[serde(rename = "versionNum")]
    pub version_num: i64,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "changeReason", default, skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<String>,
    #[serde(flatten)]
    pub fields: VersionedFields,
}

/// Entry identity row shared by all four kinds. Kind-specific columns are
/// optional (`name` for guideline/tool, `title` for knowledge/experience,
/// `level` for experiences).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub kind: EntryKind,
    #[serde(flatten)]
    pub scope: ScopeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<ExperienceLevel>,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "currentVersionId")]
    pub current_version_id: String,
    /// The current version's payload, joined in on reads.
    #[serde(flatten)]
    pub current: VersionedFields,
    #[serde(rename = "versionNum")]
    pub version_num: i64,
}

impl Entry {
    /// Display handle: `name` for named kinds, `title` otherwise, id as a
    /// last resort.
    pub fn handle(&self) -> &str {
        self.name
            .as_deref()
            .or(self.title.as_deref())
            .unwrap_or(&self.id)
    }

    /// Searchable text of the current version, used by fuzzy/regex matching.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(6);
        if let Some(n) = self.name.as_deref() {
            parts.push(n);
        }
        if let Some(t) = self.title.as_deref() {
            parts.push(t);
        }
        if let Some(c) = self.category.as_deref() {
            parts.push(c);
        }
        parts.push(&self.current.content);
        if let Some(r) = self.current.rationale.as_deref() {
            parts.push(r);
        }
        parts.join("\n")
    }
}

/// Input for creating an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDraft {
    pub kind: EntryKind,
    #[serde(flatten)]
    pub scope: ScopeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<ExperienceLevel>,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    #[serde(flatten)]
    pub fields: VersionedFields,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl EntryDraft {
    pub fn new(kind: EntryKind, scope: ScopeRef, created_by: impl Into<String>) -> Self {
        Self {
            kind,
            scope,
            name: None,
            title: None,
            category: None,
            priority: None,
            level: None,
            created_by: created_by.into(),
            fields: VersionedFields::default(),
            tags: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.fields.content = content.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Kind-level validation: named kinds need a name, knowledge needs a
    /// title, priorities stay within 0..=100.
    pub fn validate(&self) -> CoreResult<()> {
        self.scope.validate()?;
        if self.kind.has_unique_name() && self.name.as_deref().map_or(true, |n| n.trim().is_empty())
        {
            return Err(CoreError::MissingField("name".into()));
        }
        if self.kind == EntryKind::Knowledge
            && self.title.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return Err(CoreError::MissingField("title".into()));
        }
        if self.fields.content.trim().is_empty() {
            return Err(CoreError::MissingField("content".into()));
        }
        if let Some(p) = self.priority {
            if !(0..=100).contains(&p) {
                return Err(CoreError::InvalidParameter {
                    name: "priority".into(),
                    reason: "must be within 0..=100".into(),
                });
            }
        }
        if self.level.is_some() && self.kind != EntryKind::Experience {
            return Err(CoreError::InvalidParameter {
                name: "level".into(),
                reason: "only experiences carry a level".into(),
            });
        }
        Ok(())
    }
}

/// Partial update. `None` fields are left untouched; an update that changes
/// no versioned field is a no-op (no version row is written).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub examples: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "validFrom", default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(rename = "validUntil", default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(rename = "changeReason", default, skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<String>,
}

impl EntryPatch {
    /// Apply to a current payload, returning the would-be next payload.
    pub fn apply_to(&self, current: &VersionedFields) -> VersionedFields {
        VersionedFields {
            content: self.content.clone().unwrap_or_else(|| current.content.clone()),
            rationale: self.rationale.clone().or_else(|| current.rationale.clone()),
            examples: self.examples.clone().unwrap_or_else(|| current.examples.clone()),
            confidence: self.confidence.or(current.confidence),
            source: self.source.clone().or_else(|| current.source.clone()),
            valid_from: self.valid_from.or(current.valid_from),
            valid_until: self.valid_until.or(current.valid_until),
        }
    }

    /// True when nothing at all is being changed.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.title.is_none()
            && self.category.is_none()
            && self.priority.is_none()
            && self.content.is_none()
            && self.rationale.is_none()
            && self.examples.is_none()
            && self.confidence.is_none()
            && self.source.is_none()
            && self.valid_from.is_none()
            && self.valid_until.is_none()
    }
}

/// A recorded use of an experience (or tool) and whether it helped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub id: String,
    #[serde(rename = "entryId")]
    pub entry_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(rename = "recordedBy")]
    pub recorded_by: String,
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScopeType;

    #[test]
    fn test_level_lattice() {
        assert!(ExperienceLevel::Case < ExperienceLevel::Strategy);
        assert!(ExperienceLevel::Strategy < ExperienceLevel::Skill);
        assert_eq!(ExperienceLevel::Strategy.next(), Some(ExperienceLevel::Skill));
        assert_eq!(ExperienceLevel::Skill.next(), None);
    }

    #[test]
    fn test_draft_validation() {
        let scope = ScopeRef::new(ScopeType::Project, "p1");
        let ok = EntryDraft::new(EntryKind::Guideline, scope.clone(), "tester")
            .with_name("no-any")
            .with_content("Never use 'any'");
        assert!(ok.validate().is_ok());

        let nameless = EntryDraft::new(EntryKind::Guideline, scope.clone(), "tester")
            .with_content("text");
        assert!(nameless.validate().is_err());

        let titleless =
            EntryDraft::new(EntryKind::Knowledge, scope.clone(), "tester").with_content("text");
        assert!(titleless.validate().is_err());

        let bad_priority = EntryDraft::new(EntryKind::Guideline, scope, "tester")
            .with_name("g")
            .with_content("x")
            .with_priority(250);
        assert!(bad_priority.validate().is_err());
    }

    #[test]
    fn test_patch_noop_detection() {
        let current = VersionedFields {
            content: "PostgreSQL".into(),
            ..Default::default()
        };
        let same = EntryPatch {
            content: Some("PostgreSQL".into()),
            ..Default::default()
        };
        assert_eq!(same.apply_to(&current), current);

        let changed = EntryPatch {
            content: Some("MySQL".into()),
            ..Default::default()
        };
        assert_ne!(changed.apply_to(&current), current);
    }
}
