//! Typed relations between entries.
//!
//! Relations are edges `(source, target, relation_type)` across entry kinds.
//! Self-loops and duplicate triples are rejected.

use crate::error::{CoreError, CoreResult};
use crate::model::{fmt_ts, new_id, now, parse_ts, EntryKind, Relation, RelationType};
use crate::repo::audit;
use crate::storage::Storage;
use rusqlite::params;
use std::str::FromStr;
use std::sync::Arc;

pub struct RelationRepo {
    storage: Arc<Storage>,
}

/// Insert a relation row inside an open transaction, ignoring duplicates.
/// For sibling repositories composing multi-table writes (e.g. experience
/// promotion linking the materialized tool).
pub(crate) fn insert_tx(
    tx: &rusqlite::Transaction,
    source: (EntryKind, &str),
    target: (EntryKind, &str),
    relation_type: RelationType,
) -> CoreResult<()> {
    tx.execute(
        "INSERT OR IGNORE INTO relations
            (id, source_type, source_id, target_type, target_id, relation_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new_id(),
            source.0.as_str(),
            source.1,
            target.0.as_str(),
            target.1,
            relation_type.as_str(),
            fmt_ts(now()),
        ],
    )?;
    Ok(())
}

impl RelationRepo {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn create(
        &self,
        source: (EntryKind, &str),
        target: (EntryKind, &str),
        relation_type: RelationType,
        actor: &str,
    ) -> CoreResult<Relation> {
        if source == target {
            return Err(CoreError::InvalidParameter {
                name: "target".into(),
                reason: "relations cannot point at their own source".into(),
            });
        }
        let id = new_id();
        self.storage.write_tx(|tx| {
            for (kind, entry_id) in [source, target] {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM entries WHERE id = ?1 AND kind = ?2)",
                    params![entry_id, kind.as_str()],
                    |r| r.get(0),
                )?;
                if !exists {
                    return Err(CoreError::NotFound {
                        kind: kind.to_string(),
                        id: entry_id.to_string(),
                    });
                }
            }
            let duplicate: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM relations
                 WHERE source_type = ?1 AND source_id = ?2 AND target_type = ?3
                   AND target_id = ?4 AND relation_type = ?5)",
                params![
                    source.0.as_str(),
                    source.1,
                    target.0.as_str(),
                    target.1,
                    relation_type.as_str()
                ],
                |r| r.get(0),
            )?;
            if duplicate {
                return Err(CoreError::Conflict(format!(
                    "relation {} -> {} ({}) already exists",
                    source.1, target.1, relation_type
                )));
            }
            tx.execute(
                "INSERT INTO relations (id, source_type, source_id, target_type, target_id,
                    relation_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    source.0.as_str(),
                    source.1,
                    target.0.as_str(),
                    target.1,
                    relation_type.as_str(),
                    fmt_ts(now()),
                ],
            )?;
            audit::append_tx(tx, actor, "relation_created", Some(("relation", &id)), None, None)?;
            Ok(())
        })?;
        let created = self
            .list_for(source.0, source.1)?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| CoreError::Internal("relation vanished after create".into()))?;
        Ok(created)
    }

    /// All relations where the entry appears on either end.
    pub fn list_for(&self, kind: EntryKind, entry_id: &str) -> CoreResult<Vec<Relation>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, source_type, source_id, target_type, target_id, relation_type, created_at
                 FROM relations
                 WHERE (source_type = ?1 AND source_id = ?2) OR (target_type = ?1 AND target_id = ?2)
                 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![kind.as_str(), entry_id], map_relation_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Outgoing or incoming neighbor ids for graph-style traversal in the
    /// query pipeline.
    pub fn neighbors(
        &self,
        kind: EntryKind,
        entry_id: &str,
        relation_type: Option<RelationType>,
        outgoing: bool,
    ) -> CoreResult<Vec<(EntryKind, String)>> {
        self.storage.with_reader(|conn| {
            let (from_cols, to_cols) = if outgoing {
                (("source_type", "source_id"), ("target_type", "target_id"))
            } else {
                (("target_type", "target_id"), ("source_type", "source_id"))
            };
            let mut sql = format!(
                "SELECT {}, {} FROM relations WHERE {} = ?1 AND {} = ?2",
                to_cols.0, to_cols.1, from_cols.0, from_cols.1
            );
            if relation_type.is_some() {
                sql.push_str(" AND relation_type = ?3");
            }
            let mut stmt = conn.prepare_cached(&sql)?;
            let map = |r: &rusqlite::Row<'_>| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            };
            let rows: Vec<(String, String)> = match relation_type {
                Some(rt) => stmt
                    .query_map(params![kind.as_str(), entry_id, rt.as_str()], map)?
                    .collect::<Result<_, _>>()?,
                None => stmt
                    .query_map(params![kind.as_str(), entry_id], map)?
                    .collect::<Result<_, _>>()?,
            };
            Ok(rows
                .into_iter()
                .filter_map(|(k, id)| EntryKind::from_str(&k).ok().map(|k| (k, id)))
                .collect())
        })
    }

    /// Delete a relation row; true when it existed.
    pub fn delete(&self, id: &str, actor: &str) -> CoreResult<bool> {
        self.storage.write_tx(|tx| {
            let removed = tx.execute("DELETE FROM relations WHERE id = ?1", params![id])?;
            if removed > 0 {
                audit::append_tx(tx, actor, "relation_deleted", Some(("relation", id)), None, None)?;
            }
            Ok(removed > 0)
        })
    }
}

fn map_relation_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Relation> {
    let source_type: String = r.get(1)?;
    let target_type: String = r.get(3)?;
    let relation_type: String = r.get(5)?;
    let created_at: String = r.get(6)?;
    Ok(Relation {
        id: r.get(0)?,
        source_type: EntryKind::from_str(&source_type).map_err(|_| rusqlite::Error::InvalidQuery)?,
        source_id: r.get(2)?,
        target_type: EntryKind::from_str(&target_type).map_err(|_| rusqlite::Error::InvalidQuery)?,
        target_id: r.get(4)?,
        relation_type: RelationType::from_str(&relation_type)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        created_at: parse_ts(&created_at).map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::{EntryDraft, ScopeRef, ScopeType};
    use crate::repo::entries::EntriesRepo;

    fn setup() -> (tempfile::TempDir, EntriesRepo, RelationRepo) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        let bus = Arc::new(EventBus::new());
        (
            dir,
            EntriesRepo::new(storage.clone(), bus),
            RelationRepo::new(storage),
        )
    }

    fn make_knowledge(repo: &EntriesRepo, title: &str) -> String {
        let draft = EntryDraft::new(
            EntryKind::Knowledge,
            ScopeRef::new(ScopeType::Project, "p1"),
            "tester",
        )
        .with_title(title)
        .with_content("body");
        repo.create(&draft).unwrap().id
    }

    #[test]
    fn test_create_list_delete() {
        let (_dir, entries, relations) = setup();
        let a = make_knowledge(&entries, "a");
        let b = make_knowledge(&entries, "b");

        let rel = relations
            .create(
                (EntryKind::Knowledge, &a),
                (EntryKind::Knowledge, &b),
                RelationType::DependsOn,
                "tester",
            )
            .unwrap();
        assert_eq!(rel.relation_type, RelationType::DependsOn);

        assert_eq!(relations.list_for(EntryKind::Knowledge, &a).unwrap().len(), 1);
        assert_eq!(relations.list_for(EntryKind::Knowledge, &b).unwrap().len(), 1);

        assert!(relations.delete(&rel.id, "tester").unwrap());
        assert!(!relations.delete(&rel.id, "tester").unwrap());
    }

    #[test]
    fn test_duplicate_and_self_loop_rejected() {
        let (_dir, entries, relations) = setup();
        let a = make_knowledge(&entries, "a");
        let b = make_knowledge(&entries, "b");

        relations
            .create(
                (EntryKind::Knowledge, &a),
                (EntryKind::Knowledge, &b),
                RelationType::RelatedTo,
                "tester",
            )
            .unwrap();
        assert!(matches!(
            relations.create(
                (EntryKind::Knowledge, &a),
                (EntryKind::Knowledge, &b),
                RelationType::RelatedTo,
                "tester",
            ),
            Err(CoreError::Conflict(_))
        ));
        // Same pair under a different type is fine.
        relations
            .create(
                (EntryKind::Knowledge, &a),
                (EntryKind::Knowledge, &b),
                RelationType::ConflictsWith,
                "tester",
            )
            .unwrap();

        assert!(relations
            .create(
                (EntryKind::Knowledge, &a),
                (EntryKind::Knowledge, &a),
                RelationType::RelatedTo,
                "tester",
            )
            .is_err());
    }

    #[test]
    fn test_neighbors_directionality() {
        let (_dir, entries, relations) = setup();
        let a = make_knowledge(&entries, "a");
        let b = make_knowledge(&entries, "b");
        relations
            .create(
                (EntryKind::Knowledge, &a),
                (EntryKind::Knowledge, &b),
                RelationType::DependsOn,
                "tester",
            )
            .unwrap();

        let out = relations
            .neighbors(EntryKind::Knowledge, &a, None, true)
            .unwrap();
        assert_eq!(out, vec![(EntryKind::Knowledge, b.clone())]);
        assert!(relations
            .neighbors(EntryKind::Knowledge, &a, None, false)
            .unwrap()
            .is_empty());
        let incoming = relations
            .neighbors(EntryKind::Knowledge, &b, None, false)
            .unwrap();
        assert_eq!(incoming, vec![(EntryKind::Knowledge, a)]);
    }
}
