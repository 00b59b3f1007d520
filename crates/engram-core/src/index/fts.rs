//! Full-text index over the versioned text fields of every entry kind.
//!
//! Backed by an FTS5 table kept in sync by the entry repository inside each
//! write transaction, so the indexed row always carries the entry's current
//! version id. `rebuild` re-derives the whole table from the version chains.

use crate::error::CoreResult;
use crate::model::{Entry, EntryKind};
use crate::storage::Storage;
use rusqlite::{params, Connection, Transaction};
use std::str::FromStr;
use tracing::info;

/// One ranked full-text hit. `rank` is the raw BM25 value from SQLite
/// (more negative = better); the pipeline normalizes it across a batch.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub entry_id: String,
    pub kind: EntryKind,
    pub version_id: String,
    pub rank: f64,
    pub snippet: Option<String>,
}

/// Replace the indexed row for an entry with its current version.
pub fn index_entry_tx(tx: &Transaction, entry: &Entry) -> CoreResult<()> {
    remove_entry_tx(tx, &entry.id)?;
    tx.execute(
        "INSERT INTO entry_fts (entry_id, kind, version_id, name, title, category, content, rationale)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.id,
            entry.kind.as_str(),
            entry.current_version_id,
            entry.name,
            entry.title,
            entry.category,
            entry.current.content,
            entry.current.rationale,
        ],
    )?;
    Ok(())
}

/// Drop an entry from the index (deactivation or hard delete).
pub fn remove_entry_tx(tx: &Transaction, entry_id: &str) -> CoreResult<()> {
    tx.execute("DELETE FROM entry_fts WHERE entry_id = ?1", params![entry_id])?;
    Ok(())
}

/// Turn free text into an FTS5 MATCH expression: each token quoted, AND
/// semantics, trailing `*` preserved as a prefix query.
pub fn build_match_expr(query: &str) -> Option<String> {
    let mut terms = Vec::new();
    for raw in query.split_whitespace() {
        let prefix = raw.ends_with('*');
        let token: String = raw
            .trim_end_matches('*')
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '.' || *c == '/')
            .collect();
        if token.is_empty() {
            continue;
        }
        let quoted = format!("\"{}\"", token.replace('"', ""));
        terms.push(if prefix { format!("{quoted}*") } else { quoted });
    }
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

/// Indexed columns a query may restrict itself to via `fields`.
pub const SEARCHABLE_FIELDS: &[&str] = &["name", "title", "category", "content", "rationale"];

/// Ranked search restricted to the given kinds. Returns up to `limit` hits
/// best-first; `with_snippets` adds a content excerpt around the match.
/// `fields` narrows matching to a subset of [`SEARCHABLE_FIELDS`].
pub fn search(
    conn: &Connection,
    query: &str,
    kinds: &[EntryKind],
    fields: Option<&[String]>,
    limit: usize,
    with_snippets: bool,
) -> CoreResult<Vec<FtsHit>> {
    let Some(mut expr) = build_match_expr(query) else {
        return Ok(Vec::new());
    };
    if let Some(fields) = fields {
        if !fields.is_empty() {
            expr = format!("{{{}}} : ({})", fields.join(" "), expr);
        }
    }
    let kind_list = kinds
        .iter()
        .map(|k| format!("'{}'", k.as_str()))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT entry_id, kind, version_id, bm25(entry_fts),
                snippet(entry_fts, 6, '[', ']', '…', 12)
         FROM entry_fts
         WHERE entry_fts MATCH ?1 AND kind IN ({kind_list})
         ORDER BY bm25(entry_fts)
         LIMIT ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![expr, limit as i64], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, f64>(3)?,
            r.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (entry_id, kind, version_id, rank, snippet) = row?;
        let Ok(kind) = EntryKind::from_str(&kind) else {
            continue;
        };
        hits.push(FtsHit {
            entry_id,
            kind,
            version_id,
            rank,
            snippet: if with_snippets { snippet } else { None },
        });
    }
    Ok(hits)
}

/// Rebuild the index from the entries table, optionally for one kind only.
pub fn rebuild(storage: &Storage, kind: Option<EntryKind>) -> CoreResult<usize> {
    let rebuilt = storage.write_tx(|tx| {
        match kind {
            Some(k) => {
                tx.execute("DELETE FROM entry_fts WHERE kind = ?1", params![k.as_str()])?;
            }
            None => {
                tx.execute("DELETE FROM entry_fts", [])?;
            }
        }
        let sql = "INSERT INTO entry_fts (entry_id, kind, version_id, name, title, category, content, rationale)
                   SELECT e.id, e.kind, v.version_id, e.name, e.title, e.category, v.content, v.rationale
                   FROM entries e
                   JOIN entry_versions v ON v.version_id = e.current_version_id
                   WHERE e.is_active = 1";
        let count = match kind {
            Some(k) => tx.execute(&format!("{sql} AND e.kind = ?1"), params![k.as_str()])?,
            None => tx.execute(sql, [])?,
        };
        Ok(count)
    })?;
    info!(rebuilt, kind = ?kind, "full-text index rebuilt");
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_expr_quotes_and_ands() {
        assert_eq!(
            build_match_expr("postgres migration").unwrap(),
            "\"postgres\" AND \"migration\""
        );
        assert_eq!(build_match_expr("mig*").unwrap(), "\"mig\"*");
        assert!(build_match_expr("   ").is_none());
    }

    #[test]
    fn test_match_expr_strips_operators() {
        // FTS5 syntax characters in user input must not reach MATCH raw.
        let expr = build_match_expr("a OR b; DROP").unwrap();
        assert!(!expr.contains(';'));
        assert_eq!(expr, "\"a\" AND \"OR\" AND \"b\" AND \"DROP\"");
    }
}
