//! Typed property-graph types: versioned nodes and directed weighted edges.

use super::ScopeRef;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A graph node identity row. Property history lives in the version chain,
/// with the same dense-numbering rules as entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "nodeType")]
    pub node_type: String,
    #[serde(flatten)]
    pub scope: ScopeRef,
    pub name: String,
    pub properties: serde_json::Value,
    #[serde(rename = "validFrom", default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(rename = "validUntil", default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "currentVersionId")]
    pub current_version_id: String,
    #[serde(rename = "versionNum")]
    pub version_num: i64,
}

/// One row in a node's property version chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNodeVersion {
    #[serde(rename = "versionId")]
    pub version_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "versionNum")]
    pub version_num: i64,
    pub properties: serde_json::Value,
    #[serde(rename = "validFrom", default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(rename = "validUntil", default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Input for creating a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNodeDraft {
    #[serde(rename = "nodeType")]
    pub node_type: String,
    #[serde(flatten)]
    pub scope: ScopeRef,
    pub name: String,
    #[serde(default = "default_properties")]
    pub properties: serde_json::Value,
    #[serde(rename = "validFrom", default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(rename = "validUntil", default)]
    pub valid_until: Option<DateTime<Utc>>,
}

fn default_properties() -> serde_json::Value {
    serde_json::json!({})
}

impl GraphNodeDraft {
    pub fn validate(&self) -> CoreResult<()> {
        self.scope.validate()?;
        if self.node_type.trim().is_empty() {
            return Err(CoreError::MissingField("nodeType".into()));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::MissingField("name".into()));
        }
        if !self.properties.is_object() {
            return Err(CoreError::InvalidParameter {
                name: "properties".into(),
                reason: "must be a JSON object".into(),
            });
        }
        Ok(())
    }
}

/// A directed, weighted, typed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    #[serde(rename = "edgeType")]
    pub edge_type: String,
    #[serde(rename = "sourceId")]
    pub source_id: String,
    #[serde(rename = "targetId")]
    pub target_id: String,
    pub properties: serde_json::Value,
    pub weight: f64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Input for creating an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDraft {
    #[serde(rename = "edgeType")]
    pub edge_type: String,
    #[serde(rename = "sourceId")]
    pub source_id: String,
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(default = "default_properties")]
    pub properties: serde_json::Value,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl EdgeDraft {
    pub fn validate(&self) -> CoreResult<()> {
        if self.edge_type.trim().is_empty() {
            return Err(CoreError::MissingField("edgeType".into()));
        }
        if self.source_id == self.target_id {
            return Err(CoreError::InvalidParameter {
                name: "targetId".into(),
                reason: "self-loop edges are not allowed".into(),
            });
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(CoreError::InvalidParameter {
                name: "weight".into(),
                reason: "must be a non-negative finite number".into(),
            });
        }
        Ok(())
    }
}

/// Direction selector for `neighbors`/`traverse` over directed edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraverseDirection {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScopeRef, ScopeType};

    #[test]
    fn test_edge_rejects_self_loop() {
        let edge = EdgeDraft {
            edge_type: "calls".into(),
            source_id: "n1".into(),
            target_id: "n1".into(),
            properties: serde_json::json!({}),
            weight: 1.0,
        };
        assert!(edge.validate().is_err());
    }

    #[test]
    fn test_node_draft_requires_object_properties() {
        let node = GraphNodeDraft {
            node_type: "function".into(),
            scope: ScopeRef::new(ScopeType::Project, "p1"),
            name: "parse_config".into(),
            properties: serde_json::json!([1, 2]),
            valid_from: None,
            valid_until: None,
        };
        assert!(node.validate().is_err());
    }
}
