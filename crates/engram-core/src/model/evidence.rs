//! Evidence records: immutable captures that back entries.
//!
//! Evidence never changes after creation. The only permitted transition is
//! `is_active` true -> false.

use super::EntryKind;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable evidence record. Exactly one of `content`, `file_path`, `url`
/// is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    /// Optional link to the entry this evidence supports.
    #[serde(rename = "entryType", default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<EntryKind>,
    #[serde(rename = "entryId", default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "filePath", default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(rename = "fileSize", default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Snippet location within the source, when the evidence is an excerpt.
    #[serde(rename = "snippetStart", default, skip_serializing_if = "Option::is_none")]
    pub snippet_start: Option<i64>,
    #[serde(rename = "snippetEnd", default, skip_serializing_if = "Option::is_none")]
    pub snippet_end: Option<i64>,
    /// Benchmark fields, for measurement evidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(rename = "metricValue", default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(rename = "metricUnit", default, skip_serializing_if = "Option::is_none")]
    pub metric_unit: Option<String>,
    #[serde(rename = "metricBaseline", default, skip_serializing_if = "Option::is_none")]
    pub metric_baseline: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "capturedAt")]
    pub captured_at: DateTime<Utc>,
    #[serde(rename = "capturedBy")]
    pub captured_by: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

/// Input for `evidence.add`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceDraft {
    #[serde(rename = "entryType", default)]
    pub entry_type: Option<EntryKind>,
    #[serde(rename = "entryId", default)]
    pub entry_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "filePath", default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(rename = "fileSize", default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(rename = "snippetStart", default)]
    pub snippet_start: Option<i64>,
    #[serde(rename = "snippetEnd", default)]
    pub snippet_end: Option<i64>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(rename = "metricValue", default)]
    pub metric_value: Option<f64>,
    #[serde(rename = "metricUnit", default)]
    pub metric_unit: Option<String>,
    #[serde(rename = "metricBaseline", default)]
    pub metric_baseline: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "capturedBy")]
    pub captured_by: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EvidenceDraft {
    /// Exactly one content source must be present, and entry links must come
    /// in pairs.
    pub fn validate(&self) -> CoreResult<()> {
        let sources = [
            self.content.as_deref().map_or(false, |s| !s.trim().is_empty()),
            self.file_path.as_deref().map_or(false, |s| !s.trim().is_empty()),
            self.url.as_deref().map_or(false, |s| !s.trim().is_empty()),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if sources == 0 {
            return Err(CoreError::MissingField("content|filePath|url".into()));
        }
        if sources > 1 {
            return Err(CoreError::InvalidParameter {
                name: "content".into(),
                reason: "evidence takes exactly one of content, filePath, url".into(),
            });
        }
        if self.entry_type.is_some() != self.entry_id.is_some() {
            return Err(CoreError::InvalidParameter {
                name: "entryId".into(),
                reason: "entryType and entryId go together".into(),
            });
        }
        if self.captured_by.trim().is_empty() {
            return Err(CoreError::MissingField("capturedBy".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_source() {
        let mut draft = EvidenceDraft {
            captured_by: "agent".into(),
            ..Default::default()
        };
        assert!(draft.validate().is_err());

        draft.content = Some("observed failure".into());
        assert!(draft.validate().is_ok());

        draft.url = Some("https://example.com".into());
        assert!(draft.validate().is_err());
    }

    #[test]
    fn test_entry_link_pairing() {
        let draft = EvidenceDraft {
            captured_by: "agent".into(),
            content: Some("x".into()),
            entry_id: Some("e1".into()),
            ..Default::default()
        };
        assert!(draft.validate().is_err());
    }
}
