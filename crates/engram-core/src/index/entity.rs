//! Entity index: canonical tokens extracted from entry text, mapped back to
//! entries.
//!
//! Recognized token shapes: file paths, URLs, ticket ids, shell commands,
//! and code identifiers (snake_case, CamelCase, `mod::path`). Indexing an
//! entry replaces all of its previous entities.

use crate::error::CoreResult;
use crate::model::EntryKind;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s<>`'\)\]]+").unwrap());
static FILE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_.-]+\.[A-Za-z0-9]{1,8}\b").unwrap()
});
static TICKET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][A-Z0-9]{1,9}-\d{1,6}\b").unwrap());
static COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(?:^|`)\s*(?:\$\s+)?((?:cargo|git|npm|pnpm|yarn|make|docker|kubectl|pip|uv|go)\s+[a-z][a-z0-9:_-]*)").unwrap());
static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    // snake_case with at least one underscore, mod::path, or CamelCase.
    Regex::new(r"\b(?:[a-z][a-z0-9]*(?:_[a-z0-9]+)+|[a-z][a-z0-9_]*(?:::[a-z0-9_]+)+|[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+)\b")
        .unwrap()
});

/// Extract the canonical entity tokens from free text, deduplicated and
/// sorted.
pub fn extract_entities(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for m in URL_RE.find_iter(text) {
        out.insert(m.as_str().trim_end_matches(['.', ',']).to_string());
    }
    for m in FILE_PATH_RE.find_iter(text) {
        out.insert(m.as_str().to_string());
    }
    for m in TICKET_RE.find_iter(text) {
        out.insert(m.as_str().to_string());
    }
    for c in COMMAND_RE.captures_iter(text) {
        out.insert(c[1].trim().to_string());
    }
    for m in IDENTIFIER_RE.find_iter(text) {
        out.insert(m.as_str().to_string());
    }
    out
}

/// Replace all entities recorded for an entry with those found in `text`.
pub fn index_entry_tx(
    tx: &Transaction,
    kind: EntryKind,
    entry_id: &str,
    text: &str,
) -> CoreResult<()> {
    remove_entry_tx(tx, kind, entry_id)?;
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO entity_index (entity, entry_type, entry_id) VALUES (?1, ?2, ?3)",
    )?;
    for entity in extract_entities(text) {
        stmt.execute(params![entity, kind.as_str(), entry_id])?;
    }
    Ok(())
}

/// Clear all entities for an entry.
pub fn remove_entry_tx(tx: &Transaction, kind: EntryKind, entry_id: &str) -> CoreResult<()> {
    tx.execute(
        "DELETE FROM entity_index WHERE entry_type = ?1 AND entry_id = ?2",
        params![kind.as_str(), entry_id],
    )?;
    Ok(())
}

/// Entries mentioning a single entity value.
pub fn lookup(conn: &Connection, value: &str) -> CoreResult<Vec<(EntryKind, String)>> {
    let mut stmt =
        conn.prepare_cached("SELECT entry_type, entry_id FROM entity_index WHERE entity = ?1")?;
    let rows = stmt.query_map(params![value], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (kind, id) = row?;
        if let Ok(kind) = EntryKind::from_str(&kind) {
            out.push((kind, id));
        }
    }
    Ok(out)
}

/// Multiset lookup: how many of the requested entities each entry mentions.
pub fn lookup_multiple(
    conn: &Connection,
    values: &BTreeSet<String>,
) -> CoreResult<HashMap<(EntryKind, String), u32>> {
    let mut counts: HashMap<(EntryKind, String), u32> = HashMap::new();
    for value in values {
        for hit in lookup(conn, value)? {
            *counts.entry(hit).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_paths_urls_tickets() {
        let text = "See src/query/mod.rs and https://docs.rs/rusqlite for PROJ-142.";
        let entities = extract_entities(text);
        assert!(entities.contains("src/query/mod.rs"));
        assert!(entities.contains("https://docs.rs/rusqlite"));
        assert!(entities.contains("PROJ-142"));
    }

    #[test]
    fn test_extracts_identifiers_and_commands() {
        let text = "Run `cargo test` after touching parse_config or tokio::spawn usage in QueryEngine.";
        let entities = extract_entities(text);
        assert!(entities.contains("cargo test"));
        assert!(entities.contains("parse_config"));
        assert!(entities.contains("tokio::spawn"));
        assert!(entities.contains("QueryEngine"));
    }

    #[test]
    fn test_plain_prose_yields_nothing() {
        let entities = extract_entities("Prefer clarity over cleverness in reviews.");
        assert!(entities.is_empty());
    }
}
