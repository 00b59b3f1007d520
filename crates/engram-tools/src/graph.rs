//! `graph_node` and `graph_edge` handlers.

use crate::{default_actor, parse_params, to_value};
use engram_core::model::{EdgeDraft, GraphNodeDraft, TraverseDirection};
use engram_core::repo::NodeFilter;
use engram_core::{CoreError, CoreResult, EngramContext, ScopeRef, ScopeType};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct IdParams {
    id: String,
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(rename = "adminKey", default)]
    admin_key: Option<String>,
}

#[derive(Deserialize)]
struct NodeListParams {
    #[serde(rename = "nodeType", default)]
    node_type: Option<String>,
    #[serde(rename = "scopeType", default)]
    scope_type: Option<ScopeType>,
    #[serde(rename = "scopeId", default)]
    scope_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "includeInactive", default)]
    include_inactive: bool,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct NodeUpdateParams {
    id: String,
    #[serde(default)]
    properties: Option<Value>,
    #[serde(rename = "validFrom", default)]
    valid_from: Option<DateTime<Utc>>,
    #[serde(rename = "validUntil", default)]
    valid_until: Option<DateTime<Utc>>,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct EdgeUpdateParams {
    id: String,
    #[serde(default)]
    properties: Option<Value>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct NeighborParams {
    id: String,
    #[serde(default)]
    direction: TraverseDirection,
    #[serde(rename = "edgeType", default)]
    edge_type: Option<String>,
    #[serde(default)]
    depth: Option<usize>,
}

#[derive(Deserialize)]
struct PathParams {
    #[serde(rename = "sourceId")]
    source_id: String,
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "maxDepth", default)]
    max_depth: Option<usize>,
    #[serde(rename = "maxPaths", default)]
    max_paths: Option<usize>,
}

#[derive(Deserialize)]
struct EdgeListParams {
    #[serde(rename = "nodeId")]
    node_id: String,
    #[serde(rename = "edgeType", default)]
    edge_type: Option<String>,
}

pub(crate) fn handle(
    ctx: &EngramContext,
    tool: &str,
    action: &str,
    payload: Value,
) -> CoreResult<Value> {
    match tool {
        "graph_node" => handle_node(ctx, action, payload),
        "graph_edge" => handle_edge(ctx, action, payload),
        other => Err(CoreError::InvalidAction(format!("unknown tool {other:?}"))),
    }
}

fn handle_node(ctx: &EngramContext, action: &str, payload: Value) -> CoreResult<Value> {
    match action {
        "add" => {
            let actor = actor_of(&payload);
            let draft: GraphNodeDraft = parse_params(payload)?;
            to_value(&ctx.graph.add_node(&draft, &actor)?)
        }
        "get" => {
            let p: IdParams = parse_params(payload)?;
            to_value(&ctx.graph.get_node(&p.id)?)
        }
        "list" => {
            let p: NodeListParams = parse_params(payload)?;
            let scope = match p.scope_type {
                Some(scope_type) => {
                    let scope = ScopeRef {
                        scope_type,
                        scope_id: p.scope_id,
                    };
                    scope.validate()?;
                    Some(scope)
                }
                None => None,
            };
            let filter = NodeFilter {
                node_type: p.node_type,
                scope,
                name: p.name,
                include_inactive: p.include_inactive,
                limit: p.limit.unwrap_or(0),
            };
            to_value(&ctx.graph.list_nodes(&filter)?)
        }
        "update" => {
            let p: NodeUpdateParams = parse_params(payload)?;
            to_value(&ctx.graph.update_node(&p.id, p.properties, p.valid_from, p.valid_until, &p.actor)?)
        }
        "history" => {
            let p: IdParams = parse_params(payload)?;
            to_value(&ctx.graph.node_history(&p.id)?)
        }
        "deactivate" => {
            let p: IdParams = parse_params(payload)?;
            ctx.graph.deactivate_node(&p.id, &p.actor)?;
            Ok(json!({ "deactivated": p.id }))
        }
        "reactivate" => {
            let p: IdParams = parse_params(payload)?;
            ctx.graph.reactivate_node(&p.id, &p.actor)?;
            Ok(json!({ "reactivated": p.id }))
        }
        "delete" => {
            let p: IdParams = parse_params(payload)?;
            let token = ctx.authorize_admin(p.admin_key.as_deref())?;
            ctx.graph.delete_node(&p.id, &p.actor, &token)?;
            Ok(json!({ "deleted": p.id }))
        }
        other => Err(CoreError::InvalidAction(format!(
            "graph_node has no action {other:?}"
        ))),
    }
}

fn handle_edge(ctx: &EngramContext, action: &str, payload: Value) -> CoreResult<Value> {
    match action {
        "add" => {
            let actor = actor_of(&payload);
            let draft: EdgeDraft = parse_params(payload)?;
            to_value(&ctx.graph.add_edge(&draft, &actor)?)
        }
        "get" => {
            let p: IdParams = parse_params(payload)?;
            to_value(&ctx.graph.get_edge(&p.id)?)
        }
        "list" => {
            let p: EdgeListParams = parse_params(payload)?;
            to_value(&ctx.graph.list_edges(&p.node_id, p.edge_type.as_deref())?)
        }
        "update" => {
            let p: EdgeUpdateParams = parse_params(payload)?;
            to_value(&ctx.graph.update_edge(&p.id, p.properties, p.weight, &p.actor)?)
        }
        "delete" => {
            let p: IdParams = parse_params(payload)?;
            Ok(json!({ "deleted": ctx.graph.delete_edge(&p.id, &p.actor)? }))
        }
        "neighbors" => {
            let p: NeighborParams = parse_params(payload)?;
            to_value(&ctx.graph.neighbors(&p.id, p.direction, p.edge_type.as_deref())?)
        }
        "traverse" => {
            let p: NeighborParams = parse_params(payload)?;
            to_value(&ctx.graph.traverse(
                &p.id,
                p.direction,
                p.edge_type.as_deref(),
                p.depth.unwrap_or(1),
            )?)
        }
        "paths" => {
            let p: PathParams = parse_params(payload)?;
            to_value(&ctx.graph.paths(
                &p.source_id,
                &p.target_id,
                p.max_depth.unwrap_or(4),
                p.max_paths.unwrap_or(8),
            )?)
        }
        other => Err(CoreError::InvalidAction(format!(
            "graph_edge has no action {other:?}"
        ))),
    }
}

fn actor_of(payload: &Value) -> String {
    payload
        .get("actor")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(default_actor)
}

#[cfg(test)]
mod tests {
    use crate::dispatch;
    use engram_core::{EngramConfig, EngramContext};
    use serde_json::json;

    async fn ctx(dir: &tempfile::TempDir) -> EngramContext {
        EngramContext::open(EngramConfig {
            database_path: dir.path().join("engram.sqlite"),
            ..Default::default()
        })
        .unwrap()
    }

    async fn add_node(ctx: &EngramContext, name: &str) -> String {
        let out = dispatch(
            ctx,
            "graph_node",
            json!({
                "action": "add",
                "nodeType": "function",
                "scopeType": "project",
                "scopeId": "P1",
                "name": name,
            }),
        )
        .await;
        out["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_node_edge_traverse_flow() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let a = add_node(&ctx, "a").await;
        let b = add_node(&ctx, "b").await;

        let edge = dispatch(
            &ctx,
            "graph_edge",
            json!({
                "action": "add",
                "edgeType": "calls",
                "sourceId": a,
                "targetId": b,
            }),
        )
        .await;
        assert!(edge.get("code").is_none(), "unexpected error: {edge}");

        let reached = dispatch(
            &ctx,
            "graph_edge",
            json!({ "action": "traverse", "id": a, "direction": "out", "depth": 2 }),
        )
        .await;
        assert_eq!(reached.as_array().unwrap().len(), 1);

        let neighbors = dispatch(
            &ctx,
            "graph_edge",
            json!({ "action": "neighbors", "id": a }),
        )
        .await;
        assert_eq!(neighbors.as_array().unwrap()[0]["name"], "b");
    }

    #[tokio::test]
    async fn test_self_loop_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let a = add_node(&ctx, "a").await;
        let out = dispatch(
            &ctx,
            "graph_edge",
            json!({ "action": "add", "edgeType": "calls", "sourceId": a, "targetId": a }),
        )
        .await;
        assert_eq!(out["code"], "E1004");
    }
}
