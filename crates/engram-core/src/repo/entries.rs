//! Versioned CRUD for the four entry kinds.
//!
//! Every entry is an identity row plus an append-only version chain. Updates
//! write a new version row only when a versioned field actually changed;
//! `current_version_id` always points at the highest-numbered version.
//! Deletion is a soft toggle of `is_active`; hard delete requires an admin
//! token. Write transactions also refresh the FTS and entity indices and
//! append an audit record, then emit an event on the bus.

use crate::config::AdminToken;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::index::embedding::EmbedJob;
use crate::index::{entity, fts};
use crate::model::{
    fmt_ts, new_id, now, parse_ts, Entry, EntryDraft, EntryKind, EntryPatch, EntryVersion,
    ExperienceLevel, MemoryEvent, OutcomeRecord, RelationType, ScopeRef, ScopeType,
    VersionedFields,
};
use crate::repo::{audit, tag};
use crate::scope::ScopeResolver;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const ENTRY_SELECT: &str = "SELECT e.id, e.kind, e.scope_type, e.scope_id, e.name, e.title,
    e.category, e.priority, e.level, e.created_by, e.created_at, e.updated_at, e.is_active,
    e.current_version_id, v.version_num, v.content, v.rationale, v.examples, v.confidence,
    v.source, v.valid_from, v.valid_until
    FROM entries e JOIN entry_versions v ON v.version_id = e.current_version_id";

/// Listing filter. Scopes are the already-resolved chain; the repository
/// does not re-resolve inheritance.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub kinds: Vec<EntryKind>,
    pub scopes: Vec<ScopeRef>,
    pub include_inactive: bool,
    pub category: Option<String>,
    pub level: Option<ExperienceLevel>,
    pub priority_min: Option<i64>,
    pub priority_max: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Knowledge validity instant: keep entries whose current version window
    /// contains this time.
    pub at_time: Option<DateTime<Utc>>,
    /// Match any of these tags.
    pub tags_include: Vec<String>,
    /// Match all of these tags.
    pub tags_require: Vec<String>,
    /// Match none of these tags.
    pub tags_exclude: Vec<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Result of promoting an experience one level up the lattice.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PromoteResult {
    pub experience: Entry,
    /// Tool materialized when the experience reached `skill`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Entry>,
}

/// Repository for guideline/knowledge/tool/experience entries.
pub struct EntriesRepo {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    embed_tx: OnceLock<mpsc::Sender<EmbedJob>>,
}

impl EntriesRepo {
    pub fn new(storage: Arc<Storage>, bus: Arc<EventBus>) -> Self {
        Self {
            storage,
            bus,
            embed_tx: OnceLock::new(),
        }
    }

    /// Wire the embedding regeneration queue. Called once by the context;
    /// before wiring, writes simply skip embedding enqueue.
    pub fn set_embed_sender(&self, tx: mpsc::Sender<EmbedJob>) {
        let _ = self.embed_tx.set(tx);
    }

    fn enqueue_embedding(&self, entry: &Entry) {
        if let Some(tx) = self.embed_tx.get() {
            let job = EmbedJob {
                kind: entry.kind,
                entry_id: entry.id.clone(),
                text: entry.searchable_text(),
            };
            // Full queue: drop and log rather than blocking the writer.
            if let Err(e) = tx.try_send(job) {
                warn!(entry_id = %entry.id, "embedding queue full, skipping: {e}");
            }
        }
    }

    // -------------------------------------------------------------------
    // Create / update / deactivate / delete
    // -------------------------------------------------------------------

    pub fn create(&self, draft: &EntryDraft) -> CoreResult<Entry> {
        draft.validate()?;
        let entry = self.storage.write_tx(|tx| {
            ScopeResolver::register_tx(tx, &draft.scope, draft.scope.scope_type.parent(), None)?;
            Self::create_tx(tx, draft)
        })?;
        self.bus.emit(&MemoryEvent::EntryCreated {
            kind: entry.kind,
            id: entry.id.clone(),
            scope: entry.scope.clone(),
        });
        self.enqueue_embedding(&entry);
        Ok(entry)
    }

    fn create_tx(tx: &Transaction, draft: &EntryDraft) -> CoreResult<Entry> {
        if draft.kind.has_unique_name() {
            if let Some(name) = draft.name.as_deref() {
                let taken: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM entries
                     WHERE kind = ?1 AND scope_type = ?2 AND scope_id = ?3
                       AND name = ?4 AND is_active = 1)",
                    params![
                        draft.kind.as_str(),
                        draft.scope.scope_type.as_str(),
                        draft.scope.id_key(),
                        name
                    ],
                    |r| r.get(0),
                )?;
                if taken {
                    return Err(CoreError::AlreadyExists {
                        kind: draft.kind.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }

        let id = new_id();
        let version_id = new_id();
        let ts = now();
        let priority = draft.priority.unwrap_or(50);
        let level = if draft.kind == EntryKind::Experience {
            Some(draft.level.unwrap_or(ExperienceLevel::Case))
        } else {
            None
        };

        tx.execute(
            "INSERT INTO entries (id, kind, scope_type, scope_id, name, title, category,
                priority, level, created_by, created_at, updated_at, is_active, current_version_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 1, ?12)",
            params![
                id,
                draft.kind.as_str(),
                draft.scope.scope_type.as_str(),
                draft.scope.id_key(),
                draft.name,
                draft.title,
                draft.category,
                priority,
                level.map(|l| l.as_str()),
                draft.created_by,
                fmt_ts(ts),
                version_id,
            ],
        )?;
        Self::insert_version_tx(tx, &id, &version_id, 1, &draft.created_by, None, &draft.fields, ts)?;

        for t in &draft.tags {
            tag::attach_tx(tx, draft.kind, &id, t)?;
        }

        let entry = Self::get_tx(tx, draft.kind, &id)?;
        fts::index_entry_tx(tx, &entry)?;
        entity::index_entry_tx(tx, entry.kind, &entry.id, &entry.searchable_text())?;
        audit::append_tx(
            tx,
            &draft.created_by,
            "entry_created",
            Some((entry.kind.as_str(), &entry.id)),
            Some(&entry.scope),
            None,
        )?;
        Ok(entry)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_version_tx(
        tx: &Transaction,
        entry_id: &str,
        version_id: &str,
        version_num: i64,
        created_by: &str,
        change_reason: Option<&str>,
        fields: &VersionedFields,
        ts: DateTime<Utc>,
    ) -> CoreResult<()> {
        tx.execute(
            "INSERT INTO entry_versions (version_id, entry_id, version_num, created_by,
                created_at, change_reason, content, rationale, examples, confidence, source,
                valid_from, valid_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                version_id,
                entry_id,
                version_num,
                created_by,
                fmt_ts(ts),
                change_reason,
                fields.content,
                fields.rationale,
                serde_json::to_string(&fields.examples)?,
                fields.confidence,
                fields.source,
                fields.valid_from.map(fmt_ts),
                fields.valid_until.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    /// Update an entry. Identity fields (name, title, category, priority)
    /// mutate in place; a changed versioned payload appends a new version
    /// and advances the current pointer. Identical payloads are a no-op.
    pub fn update(
        &self,
        kind: EntryKind,
        id: &str,
        patch: &EntryPatch,
        updated_by: &str,
    ) -> CoreResult<Entry> {
        if patch.is_empty() {
            return self.get(kind, id);
        }
        let (entry, changed) = self.storage.write_tx(|tx| {
            let current = Self::get_tx(tx, kind, id)?;
            Self::update_tx(tx, &current, patch, updated_by)
        })?;
        if changed {
            self.bus.emit(&MemoryEvent::EntryUpdated {
                kind: entry.kind,
                id: entry.id.clone(),
                scope: entry.scope.clone(),
            });
            self.enqueue_embedding(&entry);
        }
        Ok(entry)
    }

    fn update_tx(
        tx: &Transaction,
        current: &Entry,
        patch: &EntryPatch,
        updated_by: &str,
    ) -> CoreResult<(Entry, bool)> {
        let next_fields = patch.apply_to(&current.current);
        let version_changed = next_fields != current.current;

        let next_name = patch.name.as_deref().or(current.name.as_deref());
        let next_title = patch.title.as_deref().or(current.title.as_deref());
        let next_category = patch.category.as_deref().or(current.category.as_deref());
        let next_priority = patch.priority.unwrap_or(current.priority);
        if !(0..=100).contains(&next_priority) {
            return Err(CoreError::InvalidParameter {
                name: "priority".into(),
                reason: "must be within 0..=100".into(),
            });
        }
        let identity_changed = next_name != current.name.as_deref()
            || next_title != current.title.as_deref()
            || next_category != current.category.as_deref()
            || next_priority != current.priority;

        if !version_changed && !identity_changed {
            return Ok((current.clone(), false));
        }

        if current.kind.has_unique_name() && next_name != current.name.as_deref() {
            if let Some(name) = next_name {
                let taken: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM entries
                     WHERE kind = ?1 AND scope_type = ?2 AND scope_id = ?3
                       AND name = ?4 AND is_active = 1 AND id != ?5)",
                    params![
                        current.kind.as_str(),
                        current.scope.scope_type.as_str(),
                        current.scope.id_key(),
                        name,
                        current.id
                    ],
                    |r| r.get(0),
                )?;
                if taken {
                    return Err(CoreError::AlreadyExists {
                        kind: current.kind.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }

        let ts = now();
        let mut current_version_id = current.current_version_id.clone();
        if version_changed {
            current_version_id = new_id();
            Self::insert_version_tx(
                tx,
                &current.id,
                &current_version_id,
                current.version_num + 1,
                updated_by,
                patch.change_reason.as_deref(),
                &next_fields,
                ts,
            )?;
        }

        tx.execute(
            "UPDATE entries SET name = ?1, title = ?2, category = ?3, priority = ?4,
                updated_at = ?5, current_version_id = ?6
             WHERE id = ?7",
            params![
                next_name,
                next_title,
                next_category,
                next_priority,
                fmt_ts(ts),
                current_version_id,
                current.id,
            ],
        )?;

        let entry = Self::get_tx(tx, current.kind, &current.id)?;
        fts::index_entry_tx(tx, &entry)?;
        entity::index_entry_tx(tx, entry.kind, &entry.id, &entry.searchable_text())?;
        audit::append_tx(
            tx,
            updated_by,
            "entry_updated",
            Some((entry.kind.as_str(), &entry.id)),
            Some(&entry.scope),
            patch
                .change_reason
                .as_ref()
                .map(|r| serde_json::json!({ "changeReason": r })),
        )?;
        Ok((entry, true))
    }

    /// Soft delete. The entry disappears from queries and indices but keeps
    /// its rows and version history.
    pub fn deactivate(&self, kind: EntryKind, id: &str, actor: &str) -> CoreResult<()> {
        let scope = self.storage.write_tx(|tx| {
            let entry = Self::get_tx(tx, kind, id)?;
            if !entry.is_active {
                return Ok(entry.scope);
            }
            tx.execute(
                "UPDATE entries SET is_active = 0, updated_at = ?1 WHERE id = ?2",
                params![fmt_ts(now()), id],
            )?;
            fts::remove_entry_tx(tx, id)?;
            entity::remove_entry_tx(tx, kind, id)?;
            audit::append_tx(
                tx,
                actor,
                "entry_deleted",
                Some((kind.as_str(), id)),
                Some(&entry.scope),
                Some(serde_json::json!({ "soft": true })),
            )?;
            Ok(entry.scope)
        })?;
        self.bus.emit(&MemoryEvent::EntryDeleted {
            kind,
            id: id.to_string(),
            scope,
        });
        Ok(())
    }

    /// Hard delete: removes the identity row, version chain, outcomes, tags,
    /// and index rows. Admin only.
    pub fn delete(&self, kind: EntryKind, id: &str, actor: &str, _admin: &AdminToken) -> CoreResult<()> {
        let scope = self.storage.write_tx(|tx| {
            let entry = Self::get_tx(tx, kind, id)?;
            fts::remove_entry_tx(tx, id)?;
            entity::remove_entry_tx(tx, kind, id)?;
            tx.execute(
                "DELETE FROM entry_tags WHERE entry_type = ?1 AND entry_id = ?2",
                params![kind.as_str(), id],
            )?;
            tx.execute(
                "DELETE FROM embeddings WHERE entry_type = ?1 AND entry_id = ?2",
                params![kind.as_str(), id],
            )?;
            tx.execute("DELETE FROM entries WHERE id = ?1", params![id])?;
            audit::append_tx(
                tx,
                actor,
                "entry_deleted",
                Some((kind.as_str(), id)),
                Some(&entry.scope),
                Some(serde_json::json!({ "soft": false })),
            )?;
            Ok(entry.scope)
        })?;
        self.bus.emit(&MemoryEvent::EntryDeleted {
            kind,
            id: id.to_string(),
            scope,
        });
        Ok(())
    }

    // -------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------

    pub fn get(&self, kind: EntryKind, id: &str) -> CoreResult<Entry> {
        self.storage.with_reader(|conn| Self::get_on(conn, kind, id))
    }

    fn get_on(conn: &Connection, kind: EntryKind, id: &str) -> CoreResult<Entry> {
        let sql = format!("{ENTRY_SELECT} WHERE e.id = ?1 AND e.kind = ?2");
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.query_row(params![id, kind.as_str()], map_entry_row)
            .optional()?
            .ok_or_else(|| CoreError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })
    }

    fn get_tx(tx: &Transaction, kind: EntryKind, id: &str) -> CoreResult<Entry> {
        let sql = format!("{ENTRY_SELECT} WHERE e.id = ?1 AND e.kind = ?2");
        let mut stmt = tx.prepare_cached(&sql)?;
        stmt.query_row(params![id, kind.as_str()], map_entry_row)
            .optional()?
            .ok_or_else(|| CoreError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })
    }

    /// Lookup by unique name within a single scope (active entries only).
    pub fn get_by_name(
        &self,
        kind: EntryKind,
        scope: &ScopeRef,
        name: &str,
    ) -> CoreResult<Option<Entry>> {
        self.storage.with_reader(|conn| {
            let sql = format!(
                "{ENTRY_SELECT} WHERE e.kind = ?1 AND e.scope_type = ?2 AND e.scope_id = ?3
                 AND e.name = ?4 AND e.is_active = 1"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            Ok(stmt
                .query_row(
                    params![kind.as_str(), scope.scope_type.as_str(), scope.id_key(), name],
                    map_entry_row,
                )
                .optional()?)
        })
    }

    /// Batch fetch by id, preserving only rows that exist.
    pub fn get_batch(&self, ids: &[(EntryKind, String)]) -> CoreResult<Vec<Entry>> {
        self.storage.with_reader(|conn| {
            let sql = format!("{ENTRY_SELECT} WHERE e.id = ?1 AND e.kind = ?2");
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut out = Vec::with_capacity(ids.len());
            for (kind, id) in ids {
                if let Some(entry) = stmt
                    .query_row(params![id, kind.as_str()], map_entry_row)
                    .optional()?
                {
                    out.push(entry);
                }
            }
            Ok(out)
        })
    }

    /// Filtered listing. Ordering is scope specificity (as given by the
    /// filter's scope order), then priority, then recency.
    pub fn list(&self, filter: &EntryFilter) -> CoreResult<Vec<Entry>> {
        let mut entries = self.storage.with_reader(|conn| {
            let mut out = Vec::new();
            for scope in &filter.scopes {
                out.extend(Self::list_scope_on(conn, filter, scope)?);
            }
            if filter.scopes.is_empty() {
                out.extend(Self::list_scope_on(conn, filter, &ScopeRef::global())?);
            }
            Ok(out)
        })?;

        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let offset = filter.offset.min(entries.len());
        let mut entries = entries.split_off(offset);
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn list_scope_on(
        conn: &Connection,
        filter: &EntryFilter,
        scope: &ScopeRef,
    ) -> CoreResult<Vec<Entry>> {
        let kinds = if filter.kinds.is_empty() {
            EntryKind::all().to_vec()
        } else {
            filter.kinds.clone()
        };
        let kind_list = kinds
            .iter()
            .map(|k| format!("'{}'", k.as_str()))
            .collect::<Vec<_>>()
            .join(",");

        let mut sql = format!(
            "{ENTRY_SELECT} WHERE e.kind IN ({kind_list})
             AND e.scope_type = ? AND e.scope_id = ?"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(scope.scope_type.as_str().to_string()),
            Box::new(scope.id_key().to_string()),
        ];

        if !filter.include_inactive {
            sql.push_str(" AND e.is_active = 1");
        }
        if let Some(category) = &filter.category {
            sql.push_str(" AND e.category = ?");
            args.push(Box::new(category.clone()));
        }
        if let Some(level) = filter.level {
            sql.push_str(" AND e.level = ?");
            args.push(Box::new(level.as_str().to_string()));
        }
        if let Some(min) = filter.priority_min {
            sql.push_str(" AND e.priority >= ?");
            args.push(Box::new(min));
        }
        if let Some(max) = filter.priority_max {
            sql.push_str(" AND e.priority <= ?");
            args.push(Box::new(max));
        }
        if let Some(after) = filter.created_after {
            sql.push_str(" AND e.created_at >= ?");
            args.push(Box::new(fmt_ts(after)));
        }
        if let Some(before) = filter.created_before {
            sql.push_str(" AND e.created_at < ?");
            args.push(Box::new(fmt_ts(before)));
        }
        if let Some(at) = filter.at_time {
            sql.push_str(
                " AND (v.valid_from IS NULL OR v.valid_from <= ?)
                  AND (v.valid_until IS NULL OR v.valid_until > ?)",
            );
            args.push(Box::new(fmt_ts(at)));
            args.push(Box::new(fmt_ts(at)));
        }
        if !filter.tags_include.is_empty() {
            let placeholders = vec!["?"; filter.tags_include.len()].join(",");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM entry_tags et JOIN tags t ON t.id = et.tag_id
                   WHERE et.entry_type = e.kind AND et.entry_id = e.id AND t.name IN ({placeholders}))"
            ));
            for t in &filter.tags_include {
                args.push(Box::new(t.trim().to_lowercase()));
            }
        }
        for t in &filter.tags_require {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM entry_tags et JOIN tags t ON t.id = et.tag_id
                   WHERE et.entry_type = e.kind AND et.entry_id = e.id AND t.name = ?)",
            );
            args.push(Box::new(t.trim().to_lowercase()));
        }
        for t in &filter.tags_exclude {
            sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM entry_tags et JOIN tags t ON t.id = et.tag_id
                   WHERE et.entry_type = e.kind AND et.entry_id = e.id AND t.name = ?)",
            );
            args.push(Box::new(t.trim().to_lowercase()));
        }

        let mut stmt = conn.prepare_cached(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), map_entry_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Full version chain, newest first.
    pub fn history(&self, kind: EntryKind, id: &str) -> CoreResult<Vec<EntryVersion>> {
        // Ensure the entry exists (and is of the right kind) first.
        self.get(kind, id)?;
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT version_id, entry_id, version_num, created_by, created_at, change_reason,
                        content, rationale, examples, confidence, source, valid_from, valid_until
                 FROM entry_versions WHERE entry_id = ?1 ORDER BY version_num DESC",
            )?;
            let rows = stmt.query_map(params![id], map_version_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // -------------------------------------------------------------------
    // Experience promotion and outcome feedback
    // -------------------------------------------------------------------

    /// Promote an experience one level up `case -> strategy -> skill`. When
    /// the experience reaches `skill` and `materialize_tool` is set, a tool
    /// entry is created in the same scope and linked with `promoted_to`.
    pub fn promote(
        &self,
        id: &str,
        actor: &str,
        materialize_tool: bool,
    ) -> CoreResult<PromoteResult> {
        let result = self.storage.write_tx(|tx| {
            let entry = Self::get_tx(tx, EntryKind::Experience, id)?;
            let level = entry.level.unwrap_or(ExperienceLevel::Case);
            let next = level.next().ok_or_else(|| {
                CoreError::Conflict(format!("experience {id} is already at skill level"))
            })?;

            tx.execute(
                "UPDATE entries SET level = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), fmt_ts(now()), id],
            )?;
            audit::append_tx(
                tx,
                actor,
                "experience_promoted",
                Some((EntryKind::Experience.as_str(), id)),
                Some(&entry.scope),
                Some(serde_json::json!({ "from": level.as_str(), "to": next.as_str() })),
            )?;

            let mut tool = None;
            if next == ExperienceLevel::Skill && materialize_tool {
                let tool_name = entry
                    .title
                    .as_deref()
                    .unwrap_or(&entry.id)
                    .to_lowercase()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join("-");
                let draft = EntryDraft {
                    kind: EntryKind::Tool,
                    scope: entry.scope.clone(),
                    name: Some(tool_name),
                    title: entry.title.clone(),
                    category: entry.category.clone(),
                    priority: Some(entry.priority),
                    level: None,
                    created_by: actor.to_string(),
                    fields: entry.current.clone(),
                    tags: Vec::new(),
                };
                draft.validate()?;
                let created = Self::create_tx(tx, &draft)?;
                crate::repo::relation::insert_tx(
                    tx,
                    (EntryKind::Experience, id),
                    (EntryKind::Tool, &created.id),
                    RelationType::PromotedTo,
                )?;
                tool = Some(created);
            }

            let experience = Self::get_tx(tx, EntryKind::Experience, id)?;
            Ok(PromoteResult { experience, tool })
        })?;

        self.bus.emit(&MemoryEvent::EntryUpdated {
            kind: EntryKind::Experience,
            id: id.to_string(),
            scope: result.experience.scope.clone(),
        });
        if let Some(tool) = &result.tool {
            self.bus.emit(&MemoryEvent::EntryCreated {
                kind: EntryKind::Tool,
                id: tool.id.clone(),
                scope: tool.scope.clone(),
            });
            self.enqueue_embedding(tool);
        }
        Ok(result)
    }

    /// Recreate an entry with its original id and version chain. Used by
    /// import; fails if the id is already present.
    pub fn import_entry(
        &self,
        entry: &Entry,
        versions: Option<&[EntryVersion]>,
        tags: &[String],
        actor: &str,
    ) -> CoreResult<Entry> {
        let imported = self.storage.write_tx(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM entries WHERE id = ?1)",
                params![entry.id],
                |r| r.get(0),
            )?;
            if exists {
                return Err(CoreError::AlreadyExists {
                    kind: entry.kind.to_string(),
                    name: entry.id.clone(),
                });
            }
            ScopeResolver::register_tx(tx, &entry.scope, entry.scope.scope_type.parent(), None)?;

            tx.execute(
                "INSERT INTO entries (id, kind, scope_type, scope_id, name, title, category,
                    priority, level, created_by, created_at, updated_at, is_active, current_version_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL)",
                params![
                    entry.id,
                    entry.kind.as_str(),
                    entry.scope.scope_type.as_str(),
                    entry.scope.id_key(),
                    entry.name,
                    entry.title,
                    entry.category,
                    entry.priority,
                    entry.level.map(|l| l.as_str()),
                    entry.created_by,
                    fmt_ts(entry.created_at),
                    fmt_ts(entry.updated_at),
                    entry.is_active as i64,
                ],
            )?;

            let mut current_version_id = entry.current_version_id.clone();
            match versions {
                Some(versions) if !versions.is_empty() => {
                    let mut ordered: Vec<&EntryVersion> = versions.iter().collect();
                    ordered.sort_by_key(|v| v.version_num);
                    for v in &ordered {
                        Self::insert_version_tx(
                            tx,
                            &entry.id,
                            &v.version_id,
                            v.version_num,
                            &v.created_by,
                            v.change_reason.as_deref(),
                            &v.fields,
                            v.created_at,
                        )?;
                    }
                    current_version_id = ordered
                        .last()
                        .map(|v| v.version_id.clone())
                        .unwrap_or(current_version_id);
                }
                _ => {
                    Self::insert_version_tx(
                        tx,
                        &entry.id,
                        &current_version_id,
                        entry.version_num.max(1),
                        &entry.created_by,
                        None,
                        &entry.current,
                        entry.created_at,
                    )?;
                }
            }
            tx.execute(
                "UPDATE entries SET current_version_id = ?1 WHERE id = ?2",
                params![current_version_id, entry.id],
            )?;

            for t in tags {
                tag::attach_tx(tx, entry.kind, &entry.id, t)?;
            }

            let imported = Self::get_tx(tx, entry.kind, &entry.id)?;
            if imported.is_active {
                fts::index_entry_tx(tx, &imported)?;
                entity::index_entry_tx(tx, imported.kind, &imported.id, &imported.searchable_text())?;
            }
            audit::append_tx(
                tx,
                actor,
                "entry_imported",
                Some((imported.kind.as_str(), &imported.id)),
                Some(&imported.scope),
                None,
            )?;
            Ok(imported)
        })?;
        self.bus.emit(&MemoryEvent::EntryCreated {
            kind: imported.kind,
            id: imported.id.clone(),
            scope: imported.scope.clone(),
        });
        self.enqueue_embedding(&imported);
        Ok(imported)
    }

    /// Record a use outcome for an entry; feeds the usefulness signal.
    pub fn record_outcome(
        &self,
        id: &str,
        success: bool,
        note: Option<&str>,
        actor: &str,
    ) -> CoreResult<OutcomeRecord> {
        let record = self.storage.write_tx(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM entries WHERE id = ?1)",
                params![id],
                |r| r.get(0),
            )?;
            if !exists {
                return Err(CoreError::NotFound {
                    kind: "entry".into(),
                    id: id.to_string(),
                });
            }
            let record = OutcomeRecord {
                id: new_id(),
                entry_id: id.to_string(),
                success,
                note: note.map(str::to_string),
                recorded_by: actor.to_string(),
                recorded_at: now(),
            };
            tx.execute(
                "INSERT INTO experience_outcomes (id, entry_id, success, note, recorded_by, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.entry_id,
                    record.success as i64,
                    record.note,
                    record.recorded_by,
                    fmt_ts(record.recorded_at),
                ],
            )?;
            audit::append_tx(
                tx,
                actor,
                "feedback_recorded",
                Some(("entry", id)),
                None,
                Some(serde_json::json!({ "success": success })),
            )?;
            Ok(record)
        })?;
        self.bus.emit(&MemoryEvent::FeedbackRecorded {
            entry_id: id.to_string(),
            success,
        });
        debug!(entry_id = id, success, "outcome recorded");
        Ok(record)
    }

    /// `(successes, uses)` for the usefulness signal.
    pub fn outcome_stats(&self, id: &str) -> CoreResult<(u32, u32)> {
        self.storage.with_reader(|conn| {
            let (successes, uses): (u32, u32) = conn.query_row(
                "SELECT COALESCE(SUM(success), 0), COUNT(*) FROM experience_outcomes WHERE entry_id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok((successes, uses))
        })
    }

    /// Per-kind active counts, for health reporting.
    pub fn counts(&self) -> CoreResult<Vec<(EntryKind, i64)>> {
        self.storage.with_reader(|conn| {
            let mut out = Vec::new();
            for kind in EntryKind::all() {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE kind = ?1 AND is_active = 1",
                    params![kind.as_str()],
                    |r| r.get(0),
                )?;
                out.push((kind, n));
            }
            Ok(out)
        })
    }
}

fn map_entry_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let kind: String = r.get(1)?;
    let scope_type: String = r.get(2)?;
    let scope_id: String = r.get(3)?;
    let level: Option<String> = r.get(8)?;
    let examples: String = r.get(17)?;
    Ok(Entry {
        id: r.get(0)?,
        kind: EntryKind::from_str(&kind).map_err(|_| rusqlite::Error::InvalidQuery)?,
        scope: ScopeRef {
            scope_type: ScopeType::from_str(&scope_type)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            scope_id: if scope_id.is_empty() { None } else { Some(scope_id) },
        },
        name: r.get(4)?,
        title: r.get(5)?,
        category: r.get(6)?,
        priority: r.get(7)?,
        level: level.and_then(|l| ExperienceLevel::from_str(&l).ok()),
        created_by: r.get(9)?,
        created_at: parse_ts_sql(r.get::<_, String>(10)?)?,
        updated_at: parse_ts_sql(r.get::<_, String>(11)?)?,
        is_active: r.get::<_, i64>(12)? != 0,
        current_version_id: r.get(13)?,
        version_num: r.get(14)?,
        current: VersionedFields {
            content: r.get(15)?,
            rationale: r.get(16)?,
            examples: serde_json::from_str(&examples).unwrap_or_default(),
            confidence: r.get(18)?,
            source: r.get(19)?,
            valid_from: opt_ts_sql(r.get::<_, Option<String>>(20)?)?,
            valid_until: opt_ts_sql(r.get::<_, Option<String>>(21)?)?,
        },
    })
}

fn map_version_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<EntryVersion> {
    let examples: String = r.get(8)?;
    Ok(EntryVersion {
        version_id: r.get(0)?,
        entry_id: r.get(1)?,
        version_num: r.get(2)?,
        created_by: r.get(3)?,
        created_at: parse_ts_sql(r.get::<_, String>(4)?)?,
        change_reason: r.get(5)?,
        fields: VersionedFields {
            content: r.get(6)?,
            rationale: r.get(7)?,
            examples: serde_json::from_str(&examples).unwrap_or_default(),
            confidence: r.get(9)?,
            source: r.get(10)?,
            valid_from: opt_ts_sql(r.get::<_, Option<String>>(11)?)?,
            valid_until: opt_ts_sql(r.get::<_, Option<String>>(12)?)?,
        },
    })
}

fn parse_ts_sql(s: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(&s).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn opt_ts_sql(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(parse_ts_sql).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, EntriesRepo) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 2).unwrap());
        let bus = Arc::new(EventBus::new());
        (dir, EntriesRepo::new(storage, bus))
    }

    fn knowledge_draft(title: &str, content: &str) -> EntryDraft {
        EntryDraft::new(
            EntryKind::Knowledge,
            ScopeRef::new(ScopeType::Project, "p1"),
            "tester",
        )
        .with_title(title)
        .with_content(content)
    }

    #[test]
    fn test_create_starts_version_chain_at_one() {
        let (_dir, repo) = setup();
        let entry = repo.create(&knowledge_draft("DB choice", "PostgreSQL")).unwrap();
        assert_eq!(entry.version_num, 1);
        assert!(entry.is_active);
        assert_eq!(entry.current.content, "PostgreSQL");
    }

    #[test]
    fn test_update_appends_version_and_advances_pointer() {
        let (_dir, repo) = setup();
        let entry = repo.create(&knowledge_draft("DB choice", "PostgreSQL")).unwrap();
        let patch = EntryPatch {
            content: Some("MySQL".into()),
            change_reason: Some("switched".into()),
            ..Default::default()
        };
        let updated = repo.update(EntryKind::Knowledge, &entry.id, &patch, "tester").unwrap();
        assert_eq!(updated.version_num, 2);
        assert_eq!(updated.current.content, "MySQL");

        let history = repo.history(EntryKind::Knowledge, &entry.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version_num, 2);
        assert_eq!(history[1].version_num, 1);
        assert_eq!(history[0].change_reason.as_deref(), Some("switched"));
    }

    #[test]
    fn test_identical_update_is_noop() {
        let (_dir, repo) = setup();
        let entry = repo.create(&knowledge_draft("DB choice", "PostgreSQL")).unwrap();
        let patch = EntryPatch {
            content: Some("PostgreSQL".into()),
            ..Default::default()
        };
        let updated = repo.update(EntryKind::Knowledge, &entry.id, &patch, "tester").unwrap();
        assert_eq!(updated.version_num, 1);
        assert_eq!(repo.history(EntryKind::Knowledge, &entry.id).unwrap().len(), 1);
    }

    #[test]
    fn test_name_unique_per_scope_while_active() {
        let (_dir, repo) = setup();
        let scope = ScopeRef::new(ScopeType::Project, "p1");
        let draft = EntryDraft::new(EntryKind::Guideline, scope.clone(), "tester")
            .with_name("no-any")
            .with_content("Never use 'any'");
        let first = repo.create(&draft).unwrap();
        assert!(matches!(
            repo.create(&draft),
            Err(CoreError::AlreadyExists { .. })
        ));

        // Same name in another scope is fine.
        let other = EntryDraft::new(
            EntryKind::Guideline,
            ScopeRef::new(ScopeType::Project, "p2"),
            "tester",
        )
        .with_name("no-any")
        .with_content("Never use 'any'");
        repo.create(&other).unwrap();

        // After deactivation the name frees up.
        repo.deactivate(EntryKind::Guideline, &first.id, "tester").unwrap();
        repo.create(&draft).unwrap();
    }

    #[test]
    fn test_deactivate_hides_from_default_list() {
        let (_dir, repo) = setup();
        let entry = repo.create(&knowledge_draft("DB choice", "PostgreSQL")).unwrap();
        repo.deactivate(EntryKind::Knowledge, &entry.id, "tester").unwrap();

        let filter = EntryFilter {
            kinds: vec![EntryKind::Knowledge],
            scopes: vec![ScopeRef::new(ScopeType::Project, "p1")],
            ..Default::default()
        };
        assert!(repo.list(&filter).unwrap().is_empty());

        let with_inactive = EntryFilter {
            include_inactive: true,
            ..filter
        };
        assert_eq!(repo.list(&with_inactive).unwrap().len(), 1);
    }

    #[test]
    fn test_promotion_walks_lattice_and_materializes_tool() {
        let (_dir, repo) = setup();
        let draft = EntryDraft::new(
            EntryKind::Experience,
            ScopeRef::new(ScopeType::Project, "p1"),
            "tester",
        )
        .with_title("Batch writes")
        .with_content("Batch sqlite writes in one transaction");
        let entry = repo.create(&draft).unwrap();
        assert_eq!(entry.level, Some(ExperienceLevel::Case));

        let r1 = repo.promote(&entry.id, "tester", true).unwrap();
        assert_eq!(r1.experience.level, Some(ExperienceLevel::Strategy));
        assert!(r1.tool.is_none());

        let r2 = repo.promote(&entry.id, "tester", true).unwrap();
        assert_eq!(r2.experience.level, Some(ExperienceLevel::Skill));
        let tool = r2.tool.expect("skill promotion materializes a tool");
        assert_eq!(tool.kind, EntryKind::Tool);
        assert_eq!(tool.name.as_deref(), Some("batch-writes"));

        assert!(repo.promote(&entry.id, "tester", false).is_err());
    }

    #[test]
    fn test_outcomes_accumulate() {
        let (_dir, repo) = setup();
        let entry = repo.create(&knowledge_draft("DB choice", "PostgreSQL")).unwrap();
        repo.record_outcome(&entry.id, true, None, "agent").unwrap();
        repo.record_outcome(&entry.id, true, Some("helped"), "agent").unwrap();
        repo.record_outcome(&entry.id, false, None, "agent").unwrap();
        assert_eq!(repo.outcome_stats(&entry.id).unwrap(), (2, 3));
    }

    #[test]
    fn test_priority_range_filter() {
        let (_dir, repo) = setup();
        let scope = ScopeRef::new(ScopeType::Project, "p1");
        for (name, priority) in [("critical", 95), ("normal", 60)] {
            let draft = EntryDraft::new(EntryKind::Guideline, scope.clone(), "tester")
                .with_name(name)
                .with_content("rule")
                .with_priority(priority);
            repo.create(&draft).unwrap();
        }
        let filter = EntryFilter {
            kinds: vec![EntryKind::Guideline],
            scopes: vec![scope],
            priority_min: Some(90),
            ..Default::default()
        };
        let listed = repo.list(&filter).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name.as_deref(), Some("critical"));
    }

    #[test]
    fn test_tag_filters() {
        let (_dir, repo) = setup();
        let scope = ScopeRef::new(ScopeType::Project, "p1");
        let tagged = EntryDraft::new(EntryKind::Knowledge, scope.clone(), "tester")
            .with_title("a")
            .with_content("x")
            .with_tags(vec!["db".into(), "perf".into()]);
        let plain = EntryDraft::new(EntryKind::Knowledge, scope.clone(), "tester")
            .with_title("b")
            .with_content("y")
            .with_tags(vec!["db".into()]);
        repo.create(&tagged).unwrap();
        repo.create(&plain).unwrap();

        let require_both = EntryFilter {
            scopes: vec![scope.clone()],
            tags_require: vec!["db".into(), "perf".into()],
            ..Default::default()
        };
        assert_eq!(repo.list(&require_both).unwrap().len(), 1);

        let exclude_perf = EntryFilter {
            scopes: vec![scope],
            tags_include: vec!["db".into()],
            tags_exclude: vec!["perf".into()],
            ..Default::default()
        };
        let listed = repo.list(&exclude_perf).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("b"));
    }

    #[test]
    fn test_hard_delete_requires_token_and_removes_rows() {
        let (_dir, repo) = setup();
        let mut cfg = crate::config::EngramConfig::default();
        cfg.permission_mode = crate::config::PermissionMode::Permissive;
        let token = cfg.authorize_admin(None).unwrap();

        let entry = repo.create(&knowledge_draft("DB choice", "PostgreSQL")).unwrap();
        repo.delete(EntryKind::Knowledge, &entry.id, "admin", &token).unwrap();
        assert!(matches!(
            repo.get(EntryKind::Knowledge, &entry.id),
            Err(CoreError::NotFound { .. })
        ));
    }
}
