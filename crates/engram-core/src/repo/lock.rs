//! Advisory file-lock coordinator.
//!
//! Locks are cooperative rows over normalized absolute paths, never OS file
//! locks. At most one live lock exists per path; an expired lock is
//! superseded by the next acquire. Each operation is one serialized
//! transaction, so concurrent acquires on the same path resolve to exactly
//! one winner.

use crate::config::AdminToken;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::model::{fmt_ts, now, parse_ts, FileLock, MemoryEvent};
use crate::repo::audit;
use crate::storage::Storage;
use chrono::Duration;
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;
use tracing::info;

/// Result of an acquire attempt. When `acquired` is false, `lock` carries
/// the competing holder.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AcquireOutcome {
    pub acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<FileLock>,
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct LockFilter {
    pub owner: Option<String>,
    pub path_prefix: Option<String>,
    pub include_expired: bool,
}

pub struct LockRepo {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
}

/// Normalize to a clean absolute path: collapse `//` and `.` segments,
/// reject relative paths and any `..` component.
pub fn normalize_path(path: &str) -> CoreResult<String> {
    let trimmed = path.trim();
    if !trimmed.starts_with('/') {
        return Err(CoreError::InvalidFilePath(format!(
            "{trimmed:?} is not absolute"
        )));
    }
    let mut parts = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(CoreError::InvalidFilePath(format!(
                    "{trimmed:?} contains a parent segment"
                )))
            }
            s => parts.push(s),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

impl LockRepo {
    pub fn new(storage: Arc<Storage>, bus: Arc<EventBus>) -> Self {
        Self { storage, bus }
    }

    /// Try to take the lock. Succeeds when the path is free, already held by
    /// `owner` (refreshing the TTL), or held by an expired lock.
    pub fn acquire(
        &self,
        path: &str,
        owner: &str,
        ttl_ms: Option<u64>,
        metadata: Option<serde_json::Value>,
    ) -> CoreResult<AcquireOutcome> {
        let path = normalize_path(path)?;
        if owner.trim().is_empty() {
            return Err(CoreError::MissingField("owner".into()));
        }
        let outcome = self.storage.write_tx(|tx| {
            let existing = Self::get_tx(tx, &path)?;
            let ts = now();
            match existing {
                Some(lock) if !lock.is_expired(ts) && lock.checked_out_by != owner => {
                    return Ok(AcquireOutcome {
                        acquired: false,
                        lock: Some(lock),
                    });
                }
                Some(_) => {
                    tx.execute("DELETE FROM file_locks WHERE file_path = ?1", params![path])?;
                }
                None => {}
            }

            let expires_at = ttl_ms.map(|ms| ts + Duration::milliseconds(ms as i64));
            tx.execute(
                "INSERT INTO file_locks (file_path, checked_out_by, checked_out_at, expires_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    path,
                    owner,
                    fmt_ts(ts),
                    expires_at.map(fmt_ts),
                    metadata.as_ref().map(|m| m.to_string()),
                ],
            )?;
            audit::append_tx(
                tx,
                owner,
                "lock_acquired",
                Some(("file_lock", &path)),
                None,
                None,
            )?;
            Ok(AcquireOutcome {
                acquired: true,
                lock: Some(FileLock {
                    file_path: path.clone(),
                    checked_out_by: owner.to_string(),
                    checked_out_at: ts,
                    expires_at,
                    metadata: metadata.clone(),
                }),
            })
        })?;
        if outcome.acquired {
            self.bus.emit(&MemoryEvent::LockChanged {
                file_path: path.clone(),
            });
        }
        Ok(outcome)
    }

    /// Release a lock held by `owner`. Returns `true` on release; a lock
    /// held by someone else is reported via `FileLocked`.
    pub fn release(&self, path: &str, owner: &str) -> CoreResult<bool> {
        let path = normalize_path(path)?;
        let released = self.storage.write_tx(|tx| {
            let Some(lock) = Self::get_tx(tx, &path)? else {
                return Err(CoreError::LockNotFound(path.clone()));
            };
            if lock.checked_out_by != owner {
                return Err(CoreError::FileLocked {
                    path: path.clone(),
                    owner: lock.checked_out_by,
                });
            }
            tx.execute("DELETE FROM file_locks WHERE file_path = ?1", params![path])?;
            audit::append_tx(tx, owner, "lock_released", Some(("file_lock", &path)), None, None)?;
            Ok(true)
        })?;
        self.bus.emit(&MemoryEvent::LockChanged { file_path: path });
        Ok(released)
    }

    /// Admin release regardless of owner. Audited with the reason.
    pub fn force_release(
        &self,
        path: &str,
        reason: Option<&str>,
        actor: &str,
        _admin: &AdminToken,
    ) -> CoreResult<bool> {
        let path = normalize_path(path)?;
        let released = self.storage.write_tx(|tx| {
            let removed = tx.execute("DELETE FROM file_locks WHERE file_path = ?1", params![path])?;
            if removed > 0 {
                audit::append_tx(
                    tx,
                    actor,
                    "lock_force_released",
                    Some(("file_lock", &path)),
                    None,
                    reason.map(|r| serde_json::json!({ "reason": r })),
                )?;
            }
            Ok(removed > 0)
        })?;
        if released {
            info!(path, actor, "lock force-released");
            self.bus.emit(&MemoryEvent::LockChanged { file_path: path });
        }
        Ok(released)
    }

    /// A live (unexpired) lock exists on the path.
    pub fn is_locked(&self, path: &str) -> CoreResult<bool> {
        Ok(self
            .get_lock(path)?
            .map_or(false, |lock| !lock.is_expired(now())))
    }

    pub fn get_lock(&self, path: &str) -> CoreResult<Option<FileLock>> {
        let path = normalize_path(path)?;
        self.storage.with_reader(|conn| {
            let row = conn
                .query_row(
                    "SELECT file_path, checked_out_by, checked_out_at, expires_at, metadata
                     FROM file_locks WHERE file_path = ?1",
                    params![path],
                    map_lock_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// All locks matching the filter; expired locks are hidden unless asked
    /// for.
    pub fn list(&self, filter: &LockFilter) -> CoreResult<Vec<FileLock>> {
        let locks = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT file_path, checked_out_by, checked_out_at, expires_at, metadata
                 FROM file_locks ORDER BY file_path",
            )?;
            let rows = stmt.query_map([], map_lock_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        let ts = now();
        Ok(locks
            .into_iter()
            .filter(|l| filter.include_expired || !l.is_expired(ts))
            .filter(|l| {
                filter
                    .owner
                    .as_deref()
                    .map_or(true, |o| l.checked_out_by == o)
            })
            .filter(|l| {
                filter
                    .path_prefix
                    .as_deref()
                    .map_or(true, |p| l.file_path.starts_with(p))
            })
            .collect())
    }

    /// Remove expired lock rows. Returns how many were cleaned up.
    pub fn cleanup_expired(&self) -> CoreResult<usize> {
        let removed = self.storage.write_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM file_locks WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![fmt_ts(now())],
            )?;
            Ok(removed)
        })?;
        if removed > 0 {
            info!(removed, "expired locks cleaned up");
        }
        Ok(removed)
    }

    fn get_tx(tx: &Transaction, path: &str) -> CoreResult<Option<FileLock>> {
        Ok(tx
            .query_row(
                "SELECT file_path, checked_out_by, checked_out_at, expires_at, metadata
                 FROM file_locks WHERE file_path = ?1",
                params![path],
                map_lock_row,
            )
            .optional()?)
    }
}

fn map_lock_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FileLock> {
    let checked_out_at: String = r.get(2)?;
    let expires_at: Option<String> = r.get(3)?;
    let metadata: Option<String> = r.get(4)?;
    Ok(FileLock {
        file_path: r.get(0)?,
        checked_out_by: r.get(1)?,
        checked_out_at: parse_ts(&checked_out_at).map_err(|_| rusqlite::Error::InvalidQuery)?,
        expires_at: expires_at
            .map(|s| parse_ts(&s).map_err(|_| rusqlite::Error::InvalidQuery))
            .transpose()?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, LockRepo) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        (dir, LockRepo::new(storage, Arc::new(EventBus::new())))
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a//b/./c.ts").unwrap(), "/a/b/c.ts");
        assert!(normalize_path("relative/x.ts").is_err());
        assert!(normalize_path("/a/../etc/passwd").is_err());
    }

    #[test]
    fn test_contention_one_winner() {
        let (_dir, repo) = setup();
        let a = repo.acquire("/abs/x.ts", "A", Some(60_000), None).unwrap();
        assert!(a.acquired);

        let b = repo.acquire("/abs/x.ts", "B", None, None).unwrap();
        assert!(!b.acquired);
        assert_eq!(b.lock.unwrap().checked_out_by, "A");
        assert!(repo.is_locked("/abs/x.ts").unwrap());
    }

    #[test]
    fn test_expired_lock_is_superseded() {
        let (_dir, repo) = setup();
        repo.acquire("/abs/x.ts", "A", Some(0), None).unwrap();
        // TTL of zero expires immediately.
        let b = repo.acquire("/abs/x.ts", "B", Some(60_000), None).unwrap();
        assert!(b.acquired);
        assert_eq!(repo.get_lock("/abs/x.ts").unwrap().unwrap().checked_out_by, "B");
    }

    #[test]
    fn test_release_owner_checked() {
        let (_dir, repo) = setup();
        repo.acquire("/abs/x.ts", "A", Some(60_000), None).unwrap();
        assert!(matches!(
            repo.release("/abs/x.ts", "B"),
            Err(CoreError::FileLocked { .. })
        ));
        assert!(repo.release("/abs/x.ts", "A").unwrap());
        assert!(!repo.is_locked("/abs/x.ts").unwrap());
        assert!(matches!(
            repo.release("/abs/x.ts", "A"),
            Err(CoreError::LockNotFound(_))
        ));
    }

    #[test]
    fn test_reacquire_by_owner_refreshes() {
        let (_dir, repo) = setup();
        repo.acquire("/abs/x.ts", "A", Some(1_000), None).unwrap();
        let again = repo.acquire("/abs/x.ts", "A", Some(120_000), None).unwrap();
        assert!(again.acquired);
    }

    #[test]
    fn test_cleanup_expired_counts() {
        let (_dir, repo) = setup();
        repo.acquire("/abs/a.ts", "A", Some(0), None).unwrap();
        repo.acquire("/abs/b.ts", "A", Some(60_000), None).unwrap();
        assert_eq!(repo.cleanup_expired().unwrap(), 1);
        assert!(repo.is_locked("/abs/b.ts").unwrap());
    }

    #[test]
    fn test_force_release() {
        let (_dir, repo) = setup();
        let mut cfg = crate::config::EngramConfig::default();
        cfg.permission_mode = crate::config::PermissionMode::Permissive;
        let token = cfg.authorize_admin(None).unwrap();

        repo.acquire("/abs/x.ts", "A", None, None).unwrap();
        assert!(repo
            .force_release("/abs/x.ts", Some("stale agent"), "admin", &token)
            .unwrap());
        assert!(!repo.is_locked("/abs/x.ts").unwrap());
    }
}
