//! Append-only audit log.

use crate::error::CoreResult;
use crate::model::{fmt_ts, new_id, now, parse_ts, AuditRecord, ScopeRef};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};
use std::sync::Arc;

/// Append an audit row inside an open write transaction. Every repository
/// write calls this before commit, so a committed write always has its
/// audit record.
pub fn append_tx(
    tx: &Transaction,
    actor: &str,
    action: &str,
    entry: Option<(&str, &str)>,
    scope: Option<&ScopeRef>,
    details: Option<serde_json::Value>,
) -> CoreResult<()> {
    tx.execute(
        "INSERT INTO audit_log (id, ts, actor, action, entry_type, entry_id, scope_type, scope_id, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            new_id(),
            fmt_ts(now()),
            actor,
            action,
            entry.map(|(t, _)| t),
            entry.map(|(_, id)| id),
            scope.map(|s| s.scope_type.as_str()),
            scope.map(|s| s.id_key()),
            details.map(|d| d.to_string()),
        ],
    )?;
    Ok(())
}

/// Read-side filters for audit analytics.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub entry_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Read access to the audit log.
pub struct AuditRepo {
    storage: Arc<Storage>,
}

impl AuditRepo {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Most recent records first.
    pub fn list(&self, filter: &AuditFilter) -> CoreResult<Vec<AuditRecord>> {
        self.storage.with_reader(|conn| {
            let mut sql = String::from(
                "SELECT id, ts, actor, action, entry_type, entry_id, scope_type, scope_id, details
                 FROM audit_log WHERE 1=1",
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(actor) = &filter.actor {
                sql.push_str(" AND actor = ?");
                args.push(Box::new(actor.clone()));
            }
            if let Some(action) = &filter.action {
                sql.push_str(" AND action = ?");
                args.push(Box::new(action.clone()));
            }
            if let Some(entry_id) = &filter.entry_id {
                sql.push_str(" AND entry_id = ?");
                args.push(Box::new(entry_id.clone()));
            }
            if let Some(since) = filter.since {
                sql.push_str(" AND ts >= ?");
                args.push(Box::new(fmt_ts(since)));
            }
            if let Some(until) = filter.until {
                sql.push_str(" AND ts < ?");
                args.push(Box::new(fmt_ts(until)));
            }
            sql.push_str(" ORDER BY ts DESC LIMIT ?");
            let limit = if filter.limit == 0 { 100 } else { filter.limit };
            args.push(Box::new(limit as i64));

            let mut stmt = conn.prepare_cached(&sql)?;
            let refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let rows = stmt.query_map(refs.as_slice(), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                    r.get::<_, Option<String>>(8)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, ts, actor, action, entry_type, entry_id, scope_type, scope_id, details) =
                    row?;
                out.push(AuditRecord {
                    id,
                    ts: parse_ts(&ts)?,
                    actor,
                    action,
                    entry_type,
                    entry_id,
                    scope_type,
                    scope_id,
                    details: details.and_then(|d| serde_json::from_str(&d).ok()),
                });
            }
            Ok(out)
        })
    }

    /// Total number of audit rows (health reporting).
    pub fn count(&self) -> CoreResult<i64> {
        self.storage
            .with_reader(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?))
    }
}
