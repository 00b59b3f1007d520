//! Evidence repository. Evidence is immutable: `add`, reads, and
//! `deactivate` only; there is no update path.

use crate::error::{CoreError, CoreResult};
use crate::model::{fmt_ts, new_id, now, parse_ts, EntryKind, Evidence, EvidenceDraft};
use crate::repo::audit;
use crate::storage::Storage;
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;
use std::sync::Arc;

const EVIDENCE_SELECT: &str = "SELECT id, entry_type, entry_id, content, file_path, url,
    mime_type, file_size, checksum, snippet_start, snippet_end, metric, metric_value,
    metric_unit, metric_baseline, source, captured_at, captured_by, tags, is_active
    FROM evidence";

/// Listing filter for evidence reads.
#[derive(Debug, Clone, Default)]
pub struct EvidenceFilter {
    pub entry_type: Option<EntryKind>,
    pub entry_id: Option<String>,
    pub source: Option<String>,
    pub include_inactive: bool,
    pub limit: usize,
}

pub struct EvidenceRepo {
    storage: Arc<Storage>,
}

impl EvidenceRepo {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn add(&self, draft: &EvidenceDraft) -> CoreResult<Evidence> {
        draft.validate()?;
        let id = new_id();
        let captured_at = now();
        self.storage.write_tx(|tx| {
            tx.execute(
                "INSERT INTO evidence (id, entry_type, entry_id, content, file_path, url,
                    mime_type, file_size, checksum, snippet_start, snippet_end, metric,
                    metric_value, metric_unit, metric_baseline, source, captured_at,
                    captured_by, tags, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, 1)",
                params![
                    id,
                    draft.entry_type.map(|k| k.as_str()),
                    draft.entry_id,
                    draft.content,
                    draft.file_path,
                    draft.url,
                    draft.mime_type,
                    draft.file_size,
                    draft.checksum,
                    draft.snippet_start,
                    draft.snippet_end,
                    draft.metric,
                    draft.metric_value,
                    draft.metric_unit,
                    draft.metric_baseline,
                    draft.source,
                    fmt_ts(captured_at),
                    draft.captured_by,
                    serde_json::to_string(&draft.tags)?,
                ],
            )?;
            audit::append_tx(
                tx,
                &draft.captured_by,
                "evidence_added",
                Some(("evidence", &id)),
                None,
                None,
            )?;
            Ok(())
        })?;
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> CoreResult<Evidence> {
        self.storage.with_reader(|conn| {
            let sql = format!("{EVIDENCE_SELECT} WHERE id = ?1");
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.query_row(params![id], map_evidence_row)
                .optional()?
                .ok_or_else(|| CoreError::NotFound {
                    kind: "evidence".into(),
                    id: id.to_string(),
                })
        })
    }

    /// Newest first.
    pub fn list(&self, filter: &EvidenceFilter) -> CoreResult<Vec<Evidence>> {
        self.storage.with_reader(|conn| Self::list_on(conn, filter))
    }

    fn list_on(conn: &Connection, filter: &EvidenceFilter) -> CoreResult<Vec<Evidence>> {
        let mut sql = format!("{EVIDENCE_SELECT} WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(kind) = filter.entry_type {
            sql.push_str(" AND entry_type = ?");
            args.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(entry_id) = &filter.entry_id {
            sql.push_str(" AND entry_id = ?");
            args.push(Box::new(entry_id.clone()));
        }
        if let Some(source) = &filter.source {
            sql.push_str(" AND source = ?");
            args.push(Box::new(source.clone()));
        }
        if !filter.include_inactive {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY captured_at DESC LIMIT ?");
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        args.push(Box::new(limit as i64));

        let mut stmt = conn.prepare_cached(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), map_evidence_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The only permitted mutation.
    pub fn deactivate(&self, id: &str, actor: &str) -> CoreResult<()> {
        self.storage.write_tx(|tx| {
            let changed = tx.execute(
                "UPDATE evidence SET is_active = 0 WHERE id = ?1",
                params![id],
            )?;
            if changed == 0 {
                return Err(CoreError::NotFound {
                    kind: "evidence".into(),
                    id: id.to_string(),
                });
            }
            audit::append_tx(tx, actor, "evidence_deactivated", Some(("evidence", id)), None, None)?;
            Ok(())
        })
    }
}

fn map_evidence_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Evidence> {
    let entry_type: Option<String> = r.get(1)?;
    let captured_at: String = r.get(16)?;
    let tags: String = r.get(18)?;
    Ok(Evidence {
        id: r.get(0)?,
        entry_type: entry_type.and_then(|t| EntryKind::from_str(&t).ok()),
        entry_id: r.get(2)?,
        content: r.get(3)?,
        file_path: r.get(4)?,
        url: r.get(5)?,
        mime_type: r.get(6)?,
        file_size: r.get(7)?,
        checksum: r.get(8)?,
        snippet_start: r.get(9)?,
        snippet_end: r.get(10)?,
        metric: r.get(11)?,
        metric_value: r.get(12)?,
        metric_unit: r.get(13)?,
        metric_baseline: r.get(14)?,
        source: r.get(15)?,
        captured_at: parse_ts(&captured_at).map_err(|_| rusqlite::Error::InvalidQuery)?,
        captured_by: r.get(17)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        is_active: r.get::<_, i64>(19)? != 0,
    })
}

/// Immutability guard for the tool layer: evidence has no update action.
pub fn reject_update() -> CoreError {
    CoreError::InvalidAction("evidence is immutable; add a new record instead".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, EvidenceRepo) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        (dir, EvidenceRepo::new(storage))
    }

    fn content_draft(content: &str) -> EvidenceDraft {
        EvidenceDraft {
            content: Some(content.into()),
            captured_by: "agent".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_then_get() {
        let (_dir, repo) = setup();
        let ev = repo.add(&content_draft("test run output")).unwrap();
        let got = repo.get(&ev.id).unwrap();
        assert_eq!(got.content.as_deref(), Some("test run output"));
        assert!(got.is_active);
    }

    #[test]
    fn test_deactivate_is_only_mutation() {
        let (_dir, repo) = setup();
        let ev = repo.add(&content_draft("x")).unwrap();
        repo.deactivate(&ev.id, "agent").unwrap();
        let got = repo.get(&ev.id).unwrap();
        assert!(!got.is_active);
        // Content is untouched.
        assert_eq!(got.content.as_deref(), Some("x"));
    }

    #[test]
    fn test_list_by_source() {
        let (_dir, repo) = setup();
        let mut a = content_draft("a");
        a.source = Some("ci".into());
        let mut b = content_draft("b");
        b.source = Some("manual".into());
        repo.add(&a).unwrap();
        repo.add(&b).unwrap();

        let filter = EvidenceFilter {
            source: Some("ci".into()),
            ..Default::default()
        };
        let listed = repo.list(&filter).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content.as_deref(), Some("a"));
    }

    #[test]
    fn test_benchmark_fields_roundtrip() {
        let (_dir, repo) = setup();
        let mut draft = content_draft("p95 latency");
        draft.metric = Some("latency_p95".into());
        draft.metric_value = Some(12.5);
        draft.metric_unit = Some("ms".into());
        draft.metric_baseline = Some(20.0);
        let ev = repo.add(&draft).unwrap();
        assert_eq!(ev.metric_value, Some(12.5));
        assert_eq!(ev.metric_unit.as_deref(), Some("ms"));
    }
}
