//! Typed property graph: versioned nodes and directed weighted edges.
//!
//! Edges are plain `(source_id, target_id, type)` rows; traversal walks them
//! through the repository with id-keyed visited sets, so cycles are safe and
//! nothing holds parent pointers.

use crate::config::AdminToken;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::model::{
    fmt_ts, new_id, now, parse_ts, EdgeDraft, GraphEdge, GraphNode, GraphNodeDraft,
    GraphNodeVersion, ScopeRef, ScopeType, TraverseDirection,
};
use crate::repo::audit;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

const NODE_SELECT: &str = "SELECT n.id, n.node_type, n.scope_type, n.scope_id, n.name,
    n.is_active, n.created_at, n.updated_at, n.current_version_id, v.version_num,
    v.properties, v.valid_from, v.valid_until
    FROM graph_nodes n JOIN graph_node_versions v ON v.version_id = n.current_version_id";

/// Node listing filter.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub node_type: Option<String>,
    pub scope: Option<ScopeRef>,
    pub name: Option<String>,
    pub include_inactive: bool,
    pub limit: usize,
}

/// A path through the graph: node ids from source to target inclusive.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GraphPath {
    pub nodes: Vec<String>,
    /// Sum of edge weights along the path.
    pub weight: f64,
}

pub struct GraphRepo {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
}

impl GraphRepo {
    pub fn new(storage: Arc<Storage>, bus: Arc<EventBus>) -> Self {
        Self { storage, bus }
    }

    // -------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------

    pub fn add_node(&self, draft: &GraphNodeDraft, actor: &str) -> CoreResult<GraphNode> {
        draft.validate()?;
        let node = self.storage.write_tx(|tx| {
            let id = new_id();
            let version_id = new_id();
            let ts = now();
            tx.execute(
                "INSERT INTO graph_nodes (id, node_type, scope_type, scope_id, name, is_active,
                    created_at, updated_at, current_version_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6, ?7)",
                params![
                    id,
                    draft.node_type,
                    draft.scope.scope_type.as_str(),
                    draft.scope.id_key(),
                    draft.name,
                    fmt_ts(ts),
                    version_id,
                ],
            )?;
            Self::insert_node_version_tx(
                tx,
                &id,
                &version_id,
                1,
                &draft.properties,
                draft.valid_from,
                draft.valid_until,
                ts,
            )?;
            audit::append_tx(tx, actor, "graph_node_added", Some(("graph_node", &id)), Some(&draft.scope), None)?;
            Self::get_node_tx(tx, &id)
        })?;
        self.bus.bump_epoch();
        Ok(node)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_node_version_tx(
        tx: &Transaction,
        node_id: &str,
        version_id: &str,
        version_num: i64,
        properties: &serde_json::Value,
        valid_from: Option<DateTime<Utc>>,
        valid_until: Option<DateTime<Utc>>,
        ts: DateTime<Utc>,
    ) -> CoreResult<()> {
        tx.execute(
            "INSERT INTO graph_node_versions (version_id, node_id, version_num, properties,
                valid_from, valid_until, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version_id,
                node_id,
                version_num,
                properties.to_string(),
                valid_from.map(fmt_ts),
                valid_until.map(fmt_ts),
                fmt_ts(ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> CoreResult<GraphNode> {
        self.storage.with_reader(|conn| Self::get_node_on(conn, id))
    }

    fn get_node_on(conn: &Connection, id: &str) -> CoreResult<GraphNode> {
        let sql = format!("{NODE_SELECT} WHERE n.id = ?1");
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.query_row(params![id], map_node_row)
            .optional()?
            .ok_or_else(|| CoreError::NotFound {
                kind: "graph_node".into(),
                id: id.to_string(),
            })
    }

    fn get_node_tx(tx: &Transaction, id: &str) -> CoreResult<GraphNode> {
        let sql = format!("{NODE_SELECT} WHERE n.id = ?1");
        let mut stmt = tx.prepare_cached(&sql)?;
        stmt.query_row(params![id], map_node_row)
            .optional()?
            .ok_or_else(|| CoreError::NotFound {
                kind: "graph_node".into(),
                id: id.to_string(),
            })
    }

    pub fn list_nodes(&self, filter: &NodeFilter) -> CoreResult<Vec<GraphNode>> {
        self.storage.with_reader(|conn| {
            let mut sql = format!("{NODE_SELECT} WHERE 1=1");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(t) = &filter.node_type {
                sql.push_str(" AND n.node_type = ?");
                args.push(Box::new(t.clone()));
            }
            if let Some(scope) = &filter.scope {
                sql.push_str(" AND n.scope_type = ? AND n.scope_id = ?");
                args.push(Box::new(scope.scope_type.as_str().to_string()));
                args.push(Box::new(scope.id_key().to_string()));
            }
            if let Some(name) = &filter.name {
                sql.push_str(" AND n.name = ?");
                args.push(Box::new(name.clone()));
            }
            if !filter.include_inactive {
                sql.push_str(" AND n.is_active = 1");
            }
            sql.push_str(" ORDER BY n.name LIMIT ?");
            let limit = if filter.limit == 0 { 100 } else { filter.limit };
            args.push(Box::new(limit as i64));

            let mut stmt = conn.prepare_cached(&sql)?;
            let refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let rows = stmt.query_map(refs.as_slice(), map_node_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Update node properties and/or validity window. A changed payload
    /// appends a version; an identical one is a no-op.
    pub fn update_node(
        &self,
        id: &str,
        properties: Option<serde_json::Value>,
        valid_from: Option<DateTime<Utc>>,
        valid_until: Option<DateTime<Utc>>,
        actor: &str,
    ) -> CoreResult<GraphNode> {
        let node = self.storage.write_tx(|tx| {
            let current = Self::get_node_tx(tx, id)?;
            let next_props = properties.clone().unwrap_or_else(|| current.properties.clone());
            if !next_props.is_object() {
                return Err(CoreError::InvalidParameter {
                    name: "properties".into(),
                    reason: "must be a JSON object".into(),
                });
            }
            let next_from = valid_from.or(current.valid_from);
            let next_until = valid_until.or(current.valid_until);
            if next_props == current.properties
                && next_from == current.valid_from
                && next_until == current.valid_until
            {
                return Ok(current);
            }

            let version_id = new_id();
            let ts = now();
            Self::insert_node_version_tx(
                tx,
                id,
                &version_id,
                current.version_num + 1,
                &next_props,
                next_from,
                next_until,
                ts,
            )?;
            tx.execute(
                "UPDATE graph_nodes SET updated_at = ?1, current_version_id = ?2 WHERE id = ?3",
                params![fmt_ts(ts), version_id, id],
            )?;
            audit::append_tx(tx, actor, "graph_node_updated", Some(("graph_node", id)), None, None)?;
            Self::get_node_tx(tx, id)
        })?;
        self.bus.bump_epoch();
        Ok(node)
    }

    /// Property history strictly by version number, newest first.
    pub fn node_history(&self, id: &str) -> CoreResult<Vec<GraphNodeVersion>> {
        self.get_node(id)?;
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT version_id, node_id, version_num, properties, valid_from, valid_until, created_at
                 FROM graph_node_versions WHERE node_id = ?1 ORDER BY version_num DESC",
            )?;
            let rows = stmt.query_map(params![id], map_node_version_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn deactivate_node(&self, id: &str, actor: &str) -> CoreResult<()> {
        self.set_node_active(id, false, actor)
    }

    pub fn reactivate_node(&self, id: &str, actor: &str) -> CoreResult<()> {
        self.set_node_active(id, true, actor)
    }

    fn set_node_active(&self, id: &str, active: bool, actor: &str) -> CoreResult<()> {
        self.storage.write_tx(|tx| {
            let changed = tx.execute(
                "UPDATE graph_nodes SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active as i64, fmt_ts(now()), id],
            )?;
            if changed == 0 {
                return Err(CoreError::NotFound {
                    kind: "graph_node".into(),
                    id: id.to_string(),
                });
            }
            let action = if active { "graph_node_reactivated" } else { "graph_node_deactivated" };
            audit::append_tx(tx, actor, action, Some(("graph_node", id)), None, None)?;
            Ok(())
        })?;
        self.bus.bump_epoch();
        Ok(())
    }

    /// Hard delete; cascades to version history and edges. Admin only.
    pub fn delete_node(&self, id: &str, actor: &str, _admin: &AdminToken) -> CoreResult<()> {
        self.storage.write_tx(|tx| {
            let removed = tx.execute("DELETE FROM graph_nodes WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(CoreError::NotFound {
                    kind: "graph_node".into(),
                    id: id.to_string(),
                });
            }
            audit::append_tx(tx, actor, "graph_node_deleted", Some(("graph_node", id)), None, None)?;
            Ok(())
        })?;
        self.bus.bump_epoch();
        Ok(())
    }

    // -------------------------------------------------------------------
    // Edges
    // -------------------------------------------------------------------

    pub fn add_edge(&self, draft: &EdgeDraft, actor: &str) -> CoreResult<GraphEdge> {
        draft.validate()?;
        let edge = self.storage.write_tx(|tx| {
            for node_id in [&draft.source_id, &draft.target_id] {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM graph_nodes WHERE id = ?1)",
                    params![node_id],
                    |r| r.get(0),
                )?;
                if !exists {
                    return Err(CoreError::NotFound {
                        kind: "graph_node".into(),
                        id: node_id.to_string(),
                    });
                }
            }
            let duplicate: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM graph_edges
                 WHERE edge_type = ?1 AND source_id = ?2 AND target_id = ?3)",
                params![draft.edge_type, draft.source_id, draft.target_id],
                |r| r.get(0),
            )?;
            if duplicate {
                return Err(CoreError::Conflict(format!(
                    "edge {} -[{}]-> {} already exists",
                    draft.source_id, draft.edge_type, draft.target_id
                )));
            }

            let id = new_id();
            let ts = now();
            tx.execute(
                "INSERT INTO graph_edges (id, edge_type, source_id, target_id, properties, weight, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    draft.edge_type,
                    draft.source_id,
                    draft.target_id,
                    draft.properties.to_string(),
                    draft.weight,
                    fmt_ts(ts),
                ],
            )?;
            audit::append_tx(tx, actor, "graph_edge_added", Some(("graph_edge", &id)), None, None)?;
            Self::get_edge_tx(tx, &id)
        })?;
        self.bus.bump_epoch();
        Ok(edge)
    }

    pub fn get_edge(&self, id: &str) -> CoreResult<GraphEdge> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, edge_type, source_id, target_id, properties, weight, created_at
                 FROM graph_edges WHERE id = ?1",
                params![id],
                map_edge_row,
            )
            .optional()?
            .ok_or_else(|| CoreError::NotFound {
                kind: "graph_edge".into(),
                id: id.to_string(),
            })
        })
    }

    fn get_edge_tx(tx: &Transaction, id: &str) -> CoreResult<GraphEdge> {
        tx.query_row(
            "SELECT id, edge_type, source_id, target_id, properties, weight, created_at
             FROM graph_edges WHERE id = ?1",
            params![id],
            map_edge_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound {
            kind: "graph_edge".into(),
            id: id.to_string(),
        })
    }

    /// Edges touching a node, in either direction.
    pub fn list_edges(&self, node_id: &str, edge_type: Option<&str>) -> CoreResult<Vec<GraphEdge>> {
        self.storage.with_reader(|conn| {
            let mut sql = String::from(
                "SELECT id, edge_type, source_id, target_id, properties, weight, created_at
                 FROM graph_edges WHERE (source_id = ?1 OR target_id = ?1)",
            );
            if edge_type.is_some() {
                sql.push_str(" AND edge_type = ?2");
            }
            sql.push_str(" ORDER BY created_at");
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = match edge_type {
                Some(t) => stmt.query_map(params![node_id, t], map_edge_row)?,
                None => stmt.query_map(params![node_id], map_edge_row)?,
            };
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Update edge properties/weight in place.
    pub fn update_edge(
        &self,
        id: &str,
        properties: Option<serde_json::Value>,
        weight: Option<f64>,
        actor: &str,
    ) -> CoreResult<GraphEdge> {
        let edge = self.storage.write_tx(|tx| {
            let current = Self::get_edge_tx(tx, id)?;
            let next_props = properties.clone().unwrap_or_else(|| current.properties.clone());
            let next_weight = weight.unwrap_or(current.weight);
            if !next_weight.is_finite() || next_weight < 0.0 {
                return Err(CoreError::InvalidParameter {
                    name: "weight".into(),
                    reason: "must be a non-negative finite number".into(),
                });
            }
            tx.execute(
                "UPDATE graph_edges SET properties = ?1, weight = ?2 WHERE id = ?3",
                params![next_props.to_string(), next_weight, id],
            )?;
            audit::append_tx(tx, actor, "graph_edge_updated", Some(("graph_edge", id)), None, None)?;
            Self::get_edge_tx(tx, id)
        })?;
        self.bus.bump_epoch();
        Ok(edge)
    }

    pub fn delete_edge(&self, id: &str, actor: &str) -> CoreResult<bool> {
        let removed = self.storage.write_tx(|tx| {
            let removed = tx.execute("DELETE FROM graph_edges WHERE id = ?1", params![id])?;
            if removed > 0 {
                audit::append_tx(tx, actor, "graph_edge_deleted", Some(("graph_edge", id)), None, None)?;
            }
            Ok(removed > 0)
        })?;
        self.bus.bump_epoch();
        Ok(removed)
    }

    // -------------------------------------------------------------------
    // Traversal
    // -------------------------------------------------------------------

    /// Directly connected active nodes.
    pub fn neighbors(
        &self,
        node_id: &str,
        direction: TraverseDirection,
        edge_type: Option<&str>,
    ) -> CoreResult<Vec<GraphNode>> {
        let ids = self.neighbor_ids(node_id, direction, edge_type)?;
        let mut out = Vec::new();
        for id in ids {
            match self.get_node(&id) {
                Ok(node) if node.is_active => out.push(node),
                Ok(_) => {}
                Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn neighbor_ids(
        &self,
        node_id: &str,
        direction: TraverseDirection,
        edge_type: Option<&str>,
    ) -> CoreResult<Vec<String>> {
        let edges = self.list_edges(node_id, edge_type)?;
        let mut ids = Vec::new();
        for edge in edges {
            match direction {
                TraverseDirection::Outgoing if edge.source_id == node_id => {
                    ids.push(edge.target_id)
                }
                TraverseDirection::Incoming if edge.target_id == node_id => {
                    ids.push(edge.source_id)
                }
                TraverseDirection::Both => {
                    ids.push(if edge.source_id == node_id {
                        edge.target_id
                    } else {
                        edge.source_id
                    });
                }
                _ => {}
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Breadth-first reachability up to `depth` hops. The start node is not
    /// included in the result.
    pub fn traverse(
        &self,
        start: &str,
        direction: TraverseDirection,
        edge_type: Option<&str>,
        depth: usize,
    ) -> CoreResult<Vec<String>> {
        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
        let mut frontier = VecDeque::from([(start.to_string(), 0usize)]);
        let mut reached = Vec::new();
        while let Some((id, dist)) = frontier.pop_front() {
            if dist >= depth {
                continue;
            }
            for next in self.neighbor_ids(&id, direction, edge_type)? {
                if visited.insert(next.clone()) {
                    reached.push(next.clone());
                    frontier.push_back((next, dist + 1));
                }
            }
        }
        Ok(reached)
    }

    /// Up to `max_paths` simple paths from `source` to `target`, shortest
    /// (fewest hops) first, bounded by `max_depth`.
    pub fn paths(
        &self,
        source: &str,
        target: &str,
        max_depth: usize,
        max_paths: usize,
    ) -> CoreResult<Vec<GraphPath>> {
        let mut out = Vec::new();
        let mut queue: VecDeque<(Vec<String>, f64)> =
            VecDeque::from([(vec![source.to_string()], 0.0)]);
        while let Some((path, weight)) = queue.pop_front() {
            if out.len() >= max_paths {
                break;
            }
            let Some(last) = path.last().cloned() else {
                continue;
            };
            if last == target && path.len() > 1 {
                out.push(GraphPath { nodes: path, weight });
                continue;
            }
            if path.len() > max_depth {
                continue;
            }
            for edge in self.list_edges(&last, None)? {
                if edge.source_id != last {
                    continue;
                }
                if path.contains(&edge.target_id) {
                    continue;
                }
                let mut next = path.clone();
                next.push(edge.target_id.clone());
                queue.push_back((next, weight + edge.weight));
            }
        }
        Ok(out)
    }
}

fn map_node_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
    let scope_type: String = r.get(2)?;
    let scope_id: String = r.get(3)?;
    let properties: String = r.get(10)?;
    let valid_from: Option<String> = r.get(11)?;
    let valid_until: Option<String> = r.get(12)?;
    Ok(GraphNode {
        id: r.get(0)?,
        node_type: r.get(1)?,
        scope: ScopeRef {
            scope_type: ScopeType::from_str(&scope_type)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            scope_id: if scope_id.is_empty() { None } else { Some(scope_id) },
        },
        name: r.get(4)?,
        properties: serde_json::from_str(&properties).unwrap_or(serde_json::json!({})),
        valid_from: parse_opt(valid_from)?,
        valid_until: parse_opt(valid_until)?,
        is_active: r.get::<_, i64>(5)? != 0,
        created_at: parse_req(r.get::<_, String>(6)?)?,
        updated_at: parse_req(r.get::<_, String>(7)?)?,
        current_version_id: r.get(8)?,
        version_num: r.get(9)?,
    })
}

fn map_node_version_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNodeVersion> {
    let properties: String = r.get(3)?;
    let valid_from: Option<String> = r.get(4)?;
    let valid_until: Option<String> = r.get(5)?;
    Ok(GraphNodeVersion {
        version_id: r.get(0)?,
        node_id: r.get(1)?,
        version_num: r.get(2)?,
        properties: serde_json::from_str(&properties).unwrap_or(serde_json::json!({})),
        valid_from: parse_opt(valid_from)?,
        valid_until: parse_opt(valid_until)?,
        created_at: parse_req(r.get::<_, String>(6)?)?,
    })
}

fn map_edge_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
    let properties: String = r.get(4)?;
    Ok(GraphEdge {
        id: r.get(0)?,
        edge_type: r.get(1)?,
        source_id: r.get(2)?,
        target_id: r.get(3)?,
        properties: serde_json::from_str(&properties).unwrap_or(serde_json::json!({})),
        weight: r.get(5)?,
        created_at: parse_req(r.get::<_, String>(6)?)?,
    })
}

fn parse_req(s: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(&s).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn parse_opt(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(parse_req).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, GraphRepo) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        (dir, GraphRepo::new(storage, Arc::new(EventBus::new())))
    }

    fn add_node(repo: &GraphRepo, name: &str) -> String {
        let draft = GraphNodeDraft {
            node_type: "function".into(),
            scope: ScopeRef::new(ScopeType::Project, "p1"),
            name: name.into(),
            properties: serde_json::json!({}),
            valid_from: None,
            valid_until: None,
        };
        repo.add_node(&draft, "tester").unwrap().id
    }

    fn connect(repo: &GraphRepo, from: &str, to: &str) {
        let draft = EdgeDraft {
            edge_type: "calls".into(),
            source_id: from.into(),
            target_id: to.into(),
            properties: serde_json::json!({}),
            weight: 1.0,
        };
        repo.add_edge(&draft, "tester").unwrap();
    }

    #[test]
    fn test_node_version_history() {
        let (_dir, repo) = setup();
        let id = add_node(&repo, "parse");
        repo.update_node(&id, Some(serde_json::json!({"lang": "rust"})), None, None, "tester")
            .unwrap();
        // Identical payload: no version.
        repo.update_node(&id, Some(serde_json::json!({"lang": "rust"})), None, None, "tester")
            .unwrap();

        let history = repo.node_history(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version_num, 2);
        assert_eq!(history[0].properties["lang"], "rust");
    }

    #[test]
    fn test_traverse_handles_cycles() {
        let (_dir, repo) = setup();
        let a = add_node(&repo, "a");
        let b = add_node(&repo, "b");
        let c = add_node(&repo, "c");
        connect(&repo, &a, &b);
        connect(&repo, &b, &c);
        connect(&repo, &c, &a);

        let reached = repo.traverse(&a, TraverseDirection::Outgoing, None, 5).unwrap();
        assert_eq!(reached.len(), 2);
        assert!(reached.contains(&b) && reached.contains(&c));
    }

    #[test]
    fn test_traverse_depth_bound() {
        let (_dir, repo) = setup();
        let a = add_node(&repo, "a");
        let b = add_node(&repo, "b");
        let c = add_node(&repo, "c");
        connect(&repo, &a, &b);
        connect(&repo, &b, &c);

        let one_hop = repo.traverse(&a, TraverseDirection::Outgoing, None, 1).unwrap();
        assert_eq!(one_hop, vec![b.clone()]);
        let two_hops = repo.traverse(&a, TraverseDirection::Outgoing, None, 2).unwrap();
        assert_eq!(two_hops.len(), 2);
    }

    #[test]
    fn test_paths_shortest_first() {
        let (_dir, repo) = setup();
        let a = add_node(&repo, "a");
        let b = add_node(&repo, "b");
        let c = add_node(&repo, "c");
        connect(&repo, &a, &c);
        connect(&repo, &a, &b);
        connect(&repo, &b, &c);

        let paths = repo.paths(&a, &c, 4, 10).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].nodes, vec![a.clone(), c.clone()]);
        assert_eq!(paths[1].nodes, vec![a, b, c]);
    }

    #[test]
    fn test_edge_duplicate_rejected() {
        let (_dir, repo) = setup();
        let a = add_node(&repo, "a");
        let b = add_node(&repo, "b");
        connect(&repo, &a, &b);
        let dup = EdgeDraft {
            edge_type: "calls".into(),
            source_id: a,
            target_id: b,
            properties: serde_json::json!({}),
            weight: 1.0,
        };
        assert!(matches!(repo.add_edge(&dup, "tester"), Err(CoreError::Conflict(_))));
    }

    #[test]
    fn test_deactivate_reactivate() {
        let (_dir, repo) = setup();
        let a = add_node(&repo, "a");
        repo.deactivate_node(&a, "tester").unwrap();
        assert!(!repo.get_node(&a).unwrap().is_active);
        repo.reactivate_node(&a, "tester").unwrap();
        assert!(repo.get_node(&a).unwrap().is_active);
    }
}
