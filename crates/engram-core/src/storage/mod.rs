//! Embedded SQLite storage engine.
//!
//! One writer connection behind a mutex, a fixed pool of read connections,
//! WAL journaling, and `prepare_cached` on every connection for the
//! statement cache. All repository writes funnel through [`Storage::write_tx`];
//! readers never block each other.

pub mod migrations;

use crate::config::EngramConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{fmt_ts, now};
use migrations::MIGRATIONS;
use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const STATEMENT_CACHE_CAPACITY: usize = 64;
const WRITE_RETRY_ATTEMPTS: u32 = 5;
const WRITE_RETRY_BASE_MS: u64 = 40;
const DEFAULT_CACHE_KB: u64 = 8_192;

/// Migration bookkeeping returned by [`Storage::migration_status`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationStatus {
    pub applied: u32,
    pub pending: u32,
    pub total: u32,
}

/// The storage engine. Cheap to share via `Arc`.
pub struct Storage {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Storage {
    /// Open (or create) the store at the configured path and bring the
    /// schema up to date.
    pub fn open(config: &EngramConfig) -> CoreResult<Self> {
        Self::open_with(
            &config.database_path,
            config.busy_timeout_ms,
            config.reader_pool_size,
            config.cache_memory_kb,
        )
    }

    /// Open at an explicit path with the default page-cache budget.
    /// `reader_pool_size` is clamped to at least 1.
    pub fn open_at(path: &Path, busy_timeout_ms: u64, reader_pool_size: usize) -> CoreResult<Self> {
        Self::open_with(path, busy_timeout_ms, reader_pool_size, DEFAULT_CACHE_KB)
    }

    fn open_with(
        path: &Path,
        busy_timeout_ms: u64,
        reader_pool_size: usize,
        cache_kb: u64,
    ) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Internal(format!("create {}: {e}", parent.display())))?;
        }

        let writer = Self::open_connection(path, busy_timeout_ms, cache_kb, false)?;
        let mut readers = Vec::new();
        for _ in 0..reader_pool_size.max(1) {
            readers.push(Mutex::new(Self::open_connection(
                path,
                busy_timeout_ms,
                cache_kb,
                true,
            )?));
        }

        let storage = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        };
        storage.apply_migrations()?;
        info!(path = %path.display(), "storage ready");
        Ok(storage)
    }

    fn open_connection(
        path: &Path,
        busy_timeout_ms: u64,
        cache_kb: u64,
        read_only: bool,
    ) -> CoreResult<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        // journal_mode returns the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Negative cache_size means KiB rather than pages.
        conn.pragma_update(None, "cache_size", -(cache_kb as i64))?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        if read_only {
            // Readers never write; query_only turns accidental writes into errors.
            conn.pragma_update(None, "query_only", "ON")?;
        }
        Ok(conn)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read closure on a pooled connection.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|_| CoreError::Internal("reader mutex poisoned".into()))?;
        f(&conn)
    }

    /// Run a write closure inside one serialized transaction. The closure may
    /// run more than once if the database reports a transient busy error, so
    /// it must not have side effects outside the transaction.
    pub fn write_tx<T>(&self, f: impl Fn(&Transaction) -> CoreResult<T>) -> CoreResult<T> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| CoreError::Internal("writer mutex poisoned".into()))?;

        let mut attempt = 0u32;
        loop {
            let result: CoreResult<T> = (|| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })();

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < WRITE_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = backoff_with_jitter(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "database busy, retrying write");
                    std::thread::sleep(delay);
                }
                Err(err) if err.is_retryable() => {
                    return Err(CoreError::DatabaseBusy {
                        attempts: WRITE_RETRY_ATTEMPTS,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    // -------------------------------------------------------------------
    // Migrations
    // -------------------------------------------------------------------

    fn apply_migrations(&self) -> CoreResult<()> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| CoreError::Internal("writer mutex poisoned".into()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )?;

        let applied: u32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |r| r.get(0))?;

        for m in MIGRATIONS.iter().filter(|m| m.version > applied) {
            debug!(version = m.version, "applying migration: {}", m.description);
            conn.execute_batch(m.up)
                .map_err(|e| CoreError::Migration(format!("v{}: {e}", m.version)))?;
            conn.execute(
                "INSERT INTO migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![m.version, m.description, fmt_ts(now())],
            )?;
        }
        Ok(())
    }

    /// `(applied, pending, total)` for the migration set.
    pub fn migration_status(&self) -> CoreResult<MigrationStatus> {
        self.with_reader(|conn| {
            let applied: u32 = conn
                .query_row("SELECT COUNT(*) FROM migrations", [], |r| r.get(0))?;
            let total = MIGRATIONS.len() as u32;
            Ok(MigrationStatus {
                applied,
                pending: total.saturating_sub(applied),
                total,
            })
        })
    }

    /// Verify that every migration is recorded and foreign keys hold.
    pub fn verify_integrity(&self) -> CoreResult<()> {
        self.with_reader(|conn| {
            for m in MIGRATIONS {
                let found: bool = conn
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?1)",
                        [m.version],
                        |r| r.get(0),
                    )?;
                if !found {
                    return Err(CoreError::Migration(format!(
                        "migration v{} not recorded",
                        m.version
                    )));
                }
            }
            let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let violations = stmt.query_map([], |_| Ok(()))?.count();
            if violations > 0 {
                return Err(CoreError::Migration(format!(
                    "{violations} foreign key violations"
                )));
            }
            Ok(())
        })
    }

    /// Drop every user table and re-apply the schema. Destructive; callers
    /// gate this behind the admin boundary and an explicit confirmation.
    pub fn reset(&self, confirm: bool) -> CoreResult<()> {
        if !confirm {
            return Err(CoreError::InvalidParameter {
                name: "confirm".into(),
                reason: "reset requires confirm=true".into(),
            });
        }
        {
            let conn = self
                .writer
                .lock()
                .map_err(|_| CoreError::Internal("writer mutex poisoned".into()))?;
            let tables: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                )?;
                let rows = stmt
                    .query_map([], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            conn.pragma_update(None, "foreign_keys", "OFF")?;
            for table in &tables {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
            }
            conn.pragma_update(None, "foreign_keys", "ON")?;
        }
        self.apply_migrations()?;
        warn!(path = %self.path.display(), "storage reset");
        Ok(())
    }
}

/// Exponential backoff with a small random jitter (OS randomness via UUID).
fn backoff_with_jitter(attempt: u32) -> std::time::Duration {
    let base = WRITE_RETRY_BASE_MS.saturating_mul(1 << attempt.min(6));
    let jitter = (uuid::Uuid::new_v4().as_u128() % (WRITE_RETRY_BASE_MS as u128)) as u64;
    std::time::Duration::from_millis(base + jitter)
}
