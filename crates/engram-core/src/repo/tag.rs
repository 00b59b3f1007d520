//! Global tags and their attachments to entries.

use crate::error::{CoreError, CoreResult};
use crate::model::records::normalize_tag;
use crate::model::{fmt_ts, new_id, now, parse_ts, EntryKind, Tag};
use crate::storage::Storage;
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;

/// Tag CRUD plus attachment management.
pub struct TagRepo {
    storage: Arc<Storage>,
}

/// Get or create a tag row inside an open transaction, returning its id.
pub fn get_or_create_tx(tx: &Transaction, name: &str) -> CoreResult<String> {
    let name = normalize_tag(name);
    if name.is_empty() {
        return Err(CoreError::InvalidParameter {
            name: "tag".into(),
            reason: "tag names must be non-empty".into(),
        });
    }
    if let Some(id) = tx
        .query_row("SELECT id FROM tags WHERE name = ?1", params![name], |r| {
            r.get::<_, String>(0)
        })
        .optional()?
    {
        return Ok(id);
    }
    let id = new_id();
    tx.execute(
        "INSERT INTO tags (id, name, created_at) VALUES (?1, ?2, ?3)",
        params![id, name, fmt_ts(now())],
    )?;
    Ok(id)
}

/// Attach a tag to an entry inside an open transaction. Duplicate
/// attachments are ignored.
pub fn attach_tx(tx: &Transaction, kind: EntryKind, entry_id: &str, tag: &str) -> CoreResult<()> {
    let tag_id = get_or_create_tx(tx, tag)?;
    tx.execute(
        "INSERT OR IGNORE INTO entry_tags (entry_type, entry_id, tag_id) VALUES (?1, ?2, ?3)",
        params![kind.as_str(), entry_id, tag_id],
    )?;
    Ok(())
}

impl TagRepo {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn get_or_create(&self, name: &str) -> CoreResult<Tag> {
        let id = self.storage.write_tx(|tx| get_or_create_tx(tx, name))?;
        self.get_by_name(name)?
            .ok_or_else(|| CoreError::Internal(format!("tag {id} vanished after create")))
    }

    pub fn get_by_name(&self, name: &str) -> CoreResult<Option<Tag>> {
        let name = normalize_tag(name);
        self.storage.with_reader(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, created_at FROM tags WHERE name = ?1",
                    params![name],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((id, name, created_at)) => Ok(Some(Tag {
                    id,
                    name,
                    created_at: parse_ts(&created_at)?,
                })),
                None => Ok(None),
            }
        })
    }

    /// All tags, alphabetically.
    pub fn list(&self) -> CoreResult<Vec<Tag>> {
        self.storage.with_reader(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT id, name, created_at FROM tags ORDER BY name")?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, name, created_at) = row?;
                out.push(Tag {
                    id,
                    name,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(out)
        })
    }

    pub fn attach(&self, kind: EntryKind, entry_id: &str, tag: &str) -> CoreResult<()> {
        self.storage.write_tx(|tx| {
            attach_tx(tx, kind, entry_id, tag)?;
            crate::repo::audit::append_tx(
                tx,
                "system",
                "tag_attached",
                Some((kind.as_str(), entry_id)),
                None,
                Some(serde_json::json!({ "tag": normalize_tag(tag) })),
            )
        })
    }

    /// Detach; true when an attachment actually existed.
    pub fn detach(&self, kind: EntryKind, entry_id: &str, tag: &str) -> CoreResult<bool> {
        let name = normalize_tag(tag);
        self.storage.write_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM entry_tags
                 WHERE entry_type = ?1 AND entry_id = ?2
                   AND tag_id IN (SELECT id FROM tags WHERE name = ?3)",
                params![kind.as_str(), entry_id, name],
            )?;
            if removed > 0 {
                crate::repo::audit::append_tx(
                    tx,
                    "system",
                    "tag_detached",
                    Some((kind.as_str(), entry_id)),
                    None,
                    Some(serde_json::json!({ "tag": name.clone() })),
                )?;
            }
            Ok(removed > 0)
        })
    }

    /// Tag names attached to one entry, alphabetically.
    pub fn tags_of(&self, kind: EntryKind, entry_id: &str) -> CoreResult<Vec<String>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT t.name FROM entry_tags et
                 JOIN tags t ON t.id = et.tag_id
                 WHERE et.entry_type = ?1 AND et.entry_id = ?2
                 ORDER BY t.name",
            )?;
            let rows = stmt.query_map(params![kind.as_str(), entry_id], |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, TagRepo) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        (dir, TagRepo::new(storage))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (_dir, repo) = setup();
        let a = repo.get_or_create("Rust ").unwrap();
        let b = repo.get_or_create("rust").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "rust");
    }

    #[test]
    fn test_attach_detach_roundtrip() {
        let (_dir, repo) = setup();
        repo.attach(EntryKind::Guideline, "e1", "testing").unwrap();
        repo.attach(EntryKind::Guideline, "e1", "testing").unwrap();
        assert_eq!(repo.tags_of(EntryKind::Guideline, "e1").unwrap(), vec!["testing"]);
        assert!(repo.detach(EntryKind::Guideline, "e1", "testing").unwrap());
        assert!(!repo.detach(EntryKind::Guideline, "e1", "testing").unwrap());
        assert!(repo.tags_of(EntryKind::Guideline, "e1").unwrap().is_empty());
    }

    #[test]
    fn test_empty_tag_rejected() {
        let (_dir, repo) = setup();
        assert!(repo.get_or_create("   ").is_err());
    }
}
