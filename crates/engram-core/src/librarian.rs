//! Librarian: pattern analysis and background maintenance.
//!
//! The interface is the contract; the built-in jobs are a workable default
//! policy. Every maintenance write goes through the same repositories (and
//! therefore the same serialized writer, audit log, and events) as foreground
//! traffic. Jobs batch their writes so foreground operations interleave.

use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::index::embedding::{EmbedJob, EmbeddingStore};
use crate::index::fts;
use crate::model::{
    fmt_ts, new_id, now, parse_ts, EntryKind, ExperienceLevel, MemoryEvent, ScopeRef,
};
use crate::repo::{EntriesRepo, EntryFilter};
use crate::storage::Storage;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const FORGET_AFTER_DAYS: i64 = 120;
const FORGET_MIN_USES: u32 = 4;
const FORGET_MAX_USEFULNESS: f32 = 0.25;
const PATTERN_MIN_OCCURRENCES: usize = 3;

/// Maintenance job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    Consolidation,
    Forgetting,
    IndexBackfill,
    TagAssignment,
}

/// Job lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Pollable job status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub tasks: Vec<MaintenanceTask>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-task summaries, filled in as tasks complete.
    pub report: HashMap<String, serde_json::Value>,
}

/// A repeated shape detected across experiences.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedPattern {
    pub category: String,
    pub occurrences: usize,
    pub success_rate: f32,
    pub entry_ids: Vec<String>,
}

/// A persisted recommendation awaiting review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    #[serde(flatten)]
    pub scope: ScopeRef,
    pub kind: String,
    pub summary: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Analysis output: patterns plus the recommendations derived from them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeReport {
    pub patterns: Vec<DetectedPattern>,
    pub recommendations: Vec<Recommendation>,
    pub dry_run: bool,
}

pub struct Librarian {
    storage: Arc<Storage>,
    entries: Arc<EntriesRepo>,
    embeddings: Arc<EmbeddingStore>,
    bus: Arc<EventBus>,
    jobs: Arc<DashMap<String, JobStatus>>,
    embed_tx: std::sync::OnceLock<mpsc::Sender<EmbedJob>>,
}

impl Librarian {
    pub fn new(
        storage: Arc<Storage>,
        entries: Arc<EntriesRepo>,
        embeddings: Arc<EmbeddingStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            storage,
            entries,
            embeddings,
            bus,
            jobs: Arc::new(DashMap::new()),
            embed_tx: std::sync::OnceLock::new(),
        }
    }

    pub fn set_embed_sender(&self, tx: mpsc::Sender<EmbedJob>) {
        let _ = self.embed_tx.set(tx);
    }

    // -------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------

    /// Detect repeated experience patterns in a scope and derive promotion
    /// recommendations. `dry_run` skips persisting them.
    pub fn analyze(
        &self,
        scope: &ScopeRef,
        lookback_days: u32,
        dry_run: bool,
    ) -> CoreResult<AnalyzeReport> {
        let since = now() - Duration::days(lookback_days as i64);
        let filter = EntryFilter {
            kinds: vec![EntryKind::Experience],
            scopes: vec![scope.clone()],
            created_after: Some(since),
            ..Default::default()
        };
        let experiences = self.entries.list(&filter)?;

        let mut by_category: HashMap<String, Vec<&crate::model::Entry>> = HashMap::new();
        for e in &experiences {
            let key = e
                .category
                .clone()
                .unwrap_or_else(|| "uncategorized".to_string());
            by_category.entry(key).or_default().push(e);
        }

        let mut patterns = Vec::new();
        let mut recommendations = Vec::new();
        for (category, group) in by_category {
            if group.len() < PATTERN_MIN_OCCURRENCES {
                continue;
            }
            let mut successes = 0u32;
            let mut uses = 0u32;
            for e in &group {
                let (s, u) = self.entries.outcome_stats(&e.id)?;
                successes += s;
                uses += u;
            }
            let success_rate = if uses == 0 {
                0.5
            } else {
                successes as f32 / uses as f32
            };
            let entry_ids: Vec<String> = group.iter().map(|e| e.id.clone()).collect();
            patterns.push(DetectedPattern {
                category: category.clone(),
                occurrences: group.len(),
                success_rate,
                entry_ids: entry_ids.clone(),
            });

            // Promote the best-performing repeated experience below skill.
            if success_rate >= 0.6 {
                if let Some(candidate) = group
                    .iter()
                    .find(|e| e.level.map_or(true, |l| l < ExperienceLevel::Skill))
                {
                    recommendations.push(Recommendation {
                        id: new_id(),
                        scope: scope.clone(),
                        kind: "promote_experience".to_string(),
                        summary: format!(
                            "{} similar '{category}' experiences with {:.0}% success; promote {}",
                            group.len(),
                            success_rate * 100.0,
                            candidate.handle(),
                        ),
                        payload: serde_json::json!({ "entryId": candidate.id }),
                        status: "pending".to_string(),
                        created_at: now(),
                    });
                }
            }
        }

        if !dry_run {
            for rec in &recommendations {
                self.persist_recommendation(rec)?;
            }
        }
        Ok(AnalyzeReport {
            patterns,
            recommendations,
            dry_run,
        })
    }

    fn persist_recommendation(&self, rec: &Recommendation) -> CoreResult<()> {
        self.storage.write_tx(|tx| {
            tx.execute(
                "INSERT INTO recommendations (id, scope_type, scope_id, kind, summary, payload,
                    status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rec.id,
                    rec.scope.scope_type.as_str(),
                    rec.scope.id_key(),
                    rec.kind,
                    rec.summary,
                    rec.payload.to_string(),
                    rec.status,
                    fmt_ts(rec.created_at),
                ],
            )?;
            crate::repo::audit::append_tx(
                tx,
                "librarian",
                "recommendation_created",
                Some(("recommendation", &rec.id)),
                Some(&rec.scope),
                None,
            )
        })
    }

    pub fn list_recommendations(&self, status: Option<&str>) -> CoreResult<Vec<Recommendation>> {
        self.storage.with_reader(|conn| {
            let mut sql = String::from(
                "SELECT id, scope_type, scope_id, kind, summary, payload, status, created_at
                 FROM recommendations",
            );
            if status.is_some() {
                sql.push_str(" WHERE status = ?1");
            }
            sql.push_str(" ORDER BY created_at DESC");
            let mut stmt = conn.prepare_cached(&sql)?;
            let map = |r: &rusqlite::Row<'_>| {
                let scope_type: String = r.get(1)?;
                let scope_id: String = r.get(2)?;
                let payload: String = r.get(5)?;
                let created_at: String = r.get(7)?;
                Ok(Recommendation {
                    id: r.get(0)?,
                    scope: ScopeRef {
                        scope_type: scope_type
                            .parse()
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                        scope_id: if scope_id.is_empty() { None } else { Some(scope_id) },
                    },
                    kind: r.get(3)?,
                    summary: r.get(4)?,
                    payload: serde_json::from_str(&payload).unwrap_or_default(),
                    status: r.get(6)?,
                    created_at: parse_ts(&created_at)
                        .map_err(|_| rusqlite::Error::InvalidQuery)?,
                })
            };
            let rows = match status {
                Some(s) => stmt.query_map(params![s], map)?,
                None => stmt.query_map([], map)?,
            };
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Approve a recommendation and apply it (promotion recommendations
    /// promote the referenced experience).
    pub fn approve(&self, id: &str, actor: &str) -> CoreResult<()> {
        let rec = self.decide(id, "approved", actor)?;
        if rec.kind == "promote_experience" {
            if let Some(entry_id) = rec.payload.get("entryId").and_then(|v| v.as_str()) {
                self.entries.promote(entry_id, actor, true)?;
            }
        }
        Ok(())
    }

    pub fn reject(&self, id: &str, actor: &str) -> CoreResult<()> {
        self.decide(id, "rejected", actor).map(|_| ())
    }

    pub fn skip(&self, id: &str, actor: &str) -> CoreResult<()> {
        self.decide(id, "skipped", actor).map(|_| ())
    }

    fn decide(&self, id: &str, status: &str, actor: &str) -> CoreResult<Recommendation> {
        let rec = self
            .list_recommendations(None)?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| CoreError::NotFound {
                kind: "recommendation".into(),
                id: id.to_string(),
            })?;
        if rec.status != "pending" {
            return Err(CoreError::Conflict(format!(
                "recommendation {id} already {}",
                rec.status
            )));
        }
        self.storage.write_tx(|tx| {
            tx.execute(
                "UPDATE recommendations SET status = ?1, decided_at = ?2, decided_by = ?3
                 WHERE id = ?4",
                params![status, fmt_ts(now()), actor, id],
            )?;
            crate::repo::audit::append_tx(
                tx,
                actor,
                "recommendation_decided",
                Some(("recommendation", id)),
                None,
                Some(serde_json::json!({ "status": status })),
            )
        })?;
        Ok(rec)
    }

    // -------------------------------------------------------------------
    // Maintenance jobs
    // -------------------------------------------------------------------

    /// Launch the given tasks as one background job; returns the job id for
    /// polling. Takes the librarian by `Arc` so the job can outlive the
    /// caller.
    pub fn run_maintenance(
        self: Arc<Self>,
        tasks: Vec<MaintenanceTask>,
        dry_run: bool,
    ) -> CoreResult<String> {
        if tasks.is_empty() {
            return Err(CoreError::MissingField("tasks".into()));
        }
        let job_id = new_id();
        self.jobs.insert(
            job_id.clone(),
            JobStatus {
                job_id: job_id.clone(),
                state: JobState::Queued,
                tasks: tasks.clone(),
                dry_run,
                started_at: now(),
                finished_at: None,
                report: HashMap::new(),
            },
        );

        let librarian = Arc::clone(&self);
        let id = job_id.clone();
        tokio::spawn(async move {
            librarian.set_job_state(&id, JobState::Running);
            let mut failed = false;
            for task in tasks {
                let result = match task {
                    MaintenanceTask::Consolidation => librarian.consolidate(dry_run),
                    MaintenanceTask::Forgetting => librarian.forget(dry_run),
                    MaintenanceTask::IndexBackfill => librarian.backfill_indices(dry_run),
                    MaintenanceTask::TagAssignment => librarian.assign_tags(dry_run),
                };
                match result {
                    Ok(report) => librarian.record_report(&id, task, report),
                    Err(e) => {
                        warn!(job_id = %id, ?task, "maintenance task failed: {e}");
                        librarian.record_report(
                            &id,
                            task,
                            serde_json::json!({ "error": e.sanitized_message() }),
                        );
                        failed = true;
                    }
                }
                tokio::task::yield_now().await;
            }
            librarian.set_job_state(&id, if failed { JobState::Failed } else { JobState::Completed });
            librarian.bus.emit(&MemoryEvent::MaintenanceCompleted { job_id: id.clone() });
            info!(job_id = %id, "maintenance job finished");
        });
        Ok(job_id)
    }

    pub fn get_job_status(&self, job_id: &str) -> CoreResult<JobStatus> {
        self.jobs
            .get(job_id)
            .map(|j| j.clone())
            .ok_or_else(|| CoreError::NotFound {
                kind: "job".into(),
                id: job_id.to_string(),
            })
    }

    fn set_job_state(&self, job_id: &str, state: JobState) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.state = state;
            if matches!(job.state, JobState::Completed | JobState::Failed) {
                job.finished_at = Some(now());
            }
        }
    }

    fn record_report(&self, job_id: &str, task: MaintenanceTask, report: serde_json::Value) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            let key = serde_json::to_value(task)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{task:?}"));
            job.report.insert(key, report);
        }
    }

    /// Deactivate knowledge entries whose current content duplicates an
    /// older active entry in the same scope.
    fn consolidate(&self, dry_run: bool) -> CoreResult<serde_json::Value> {
        let duplicates: Vec<String> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT e2.id FROM entries e1
                 JOIN entry_versions v1 ON v1.version_id = e1.current_version_id
                 JOIN entries e2 ON e2.kind = e1.kind
                   AND e2.scope_type = e1.scope_type AND e2.scope_id = e1.scope_id
                   AND e2.id != e1.id AND e2.created_at > e1.created_at
                 JOIN entry_versions v2 ON v2.version_id = e2.current_version_id
                 WHERE e1.kind = 'knowledge' AND e1.is_active = 1 AND e2.is_active = 1
                   AND v1.content = v2.content
                   AND COALESCE(e1.title, '') = COALESCE(e2.title, '')",
            )?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        if !dry_run {
            for id in &duplicates {
                self.entries
                    .deactivate(EntryKind::Knowledge, id, "librarian")?;
            }
        }
        Ok(serde_json::json!({ "duplicates": duplicates.len(), "dryRun": dry_run }))
    }

    /// Deactivate stale, repeatedly-unhelpful experiences.
    fn forget(&self, dry_run: bool) -> CoreResult<serde_json::Value> {
        let cutoff = now() - Duration::days(FORGET_AFTER_DAYS);
        let filter = EntryFilter {
            kinds: vec![EntryKind::Experience],
            scopes: Vec::new(),
            created_before: Some(cutoff),
            ..Default::default()
        };
        // No scope filter: walk everything registered.
        let all_scopes = self.all_scopes()?;
        let mut forgotten = 0usize;
        for scope in all_scopes {
            let mut scoped = filter.clone();
            scoped.scopes = vec![scope];
            for entry in self.entries.list(&scoped)? {
                if entry.updated_at > cutoff {
                    continue;
                }
                let (successes, uses) = self.entries.outcome_stats(&entry.id)?;
                if uses < FORGET_MIN_USES {
                    continue;
                }
                let usefulness = (successes as f32 + 1.0) / (uses as f32 + 2.0);
                if usefulness <= FORGET_MAX_USEFULNESS {
                    forgotten += 1;
                    if !dry_run {
                        self.entries
                            .deactivate(EntryKind::Experience, &entry.id, "librarian")?;
                    }
                }
            }
        }
        Ok(serde_json::json!({ "forgotten": forgotten, "dryRun": dry_run }))
    }

    /// Rebuild the FTS table and queue embeddings for entries missing one.
    fn backfill_indices(&self, dry_run: bool) -> CoreResult<serde_json::Value> {
        let missing = self.embeddings.missing(1024)?;
        let mut queued = 0usize;
        if !dry_run {
            fts::rebuild(&self.storage, None)?;
            if let Some(tx) = self.embed_tx.get() {
                for (kind, id) in &missing {
                    if let Ok(entry) = self.entries.get(*kind, id) {
                        if tx
                            .try_send(EmbedJob {
                                kind: *kind,
                                entry_id: id.clone(),
                                text: entry.searchable_text(),
                            })
                            .is_ok()
                        {
                            queued += 1;
                        }
                    }
                }
            }
        }
        Ok(serde_json::json!({
            "missingEmbeddings": missing.len(),
            "queued": queued,
            "dryRun": dry_run,
        }))
    }

    /// Attach each untagged entry's category as a tag so tag filters keep
    /// working for older data.
    fn assign_tags(&self, dry_run: bool) -> CoreResult<serde_json::Value> {
        let untagged: Vec<(String, String, String)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT e.kind, e.id, e.category FROM entries e
                 WHERE e.is_active = 1 AND e.category IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM entry_tags et
                                   WHERE et.entry_type = e.kind AND et.entry_id = e.id)
                 LIMIT 1024",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        if !dry_run {
            self.storage.write_tx(|tx| {
                for (kind, id, category) in &untagged {
                    if let Ok(kind) = kind.parse::<EntryKind>() {
                        crate::repo::tag::attach_tx(tx, kind, id, category)?;
                    }
                }
                Ok(())
            })?;
        }
        Ok(serde_json::json!({ "tagged": untagged.len(), "dryRun": dry_run }))
    }

    fn all_scopes(&self) -> CoreResult<Vec<ScopeRef>> {
        self.storage.with_reader(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT scope_type, scope_id FROM scopes")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut out = vec![ScopeRef::global()];
            for row in rows {
                let (scope_type, scope_id) = row?;
                if let Ok(scope_type) = scope_type.parse() {
                    out.push(ScopeRef {
                        scope_type,
                        scope_id: if scope_id.is_empty() { None } else { Some(scope_id) },
                    });
                }
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryDraft, ScopeType};

    fn setup() -> (tempfile::TempDir, Arc<Librarian>, Arc<EntriesRepo>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        let bus = Arc::new(EventBus::new());
        let entries = Arc::new(EntriesRepo::new(storage.clone(), bus.clone()));
        let embeddings = Arc::new(EmbeddingStore::new(storage.clone(), 4));
        let librarian = Arc::new(Librarian::new(storage, entries.clone(), embeddings, bus));
        (dir, librarian, entries)
    }

    fn experience(entries: &EntriesRepo, title: &str, category: &str) -> String {
        let draft = EntryDraft::new(
            EntryKind::Experience,
            ScopeRef::new(ScopeType::Project, "p1"),
            "agent",
        )
        .with_title(title)
        .with_content(format!("learned: {title}"))
        .with_category(category);
        entries.create(&draft).unwrap().id
    }

    #[test]
    fn test_analyze_detects_repeated_categories() {
        let (_dir, librarian, entries) = setup();
        for i in 0..3 {
            let id = experience(&entries, &format!("retry {i}"), "flaky-tests");
            entries.record_outcome(&id, true, None, "agent").unwrap();
        }
        experience(&entries, "one-off", "misc");

        let report = librarian
            .analyze(&ScopeRef::new(ScopeType::Project, "p1"), 30, true)
            .unwrap();
        assert_eq!(report.patterns.len(), 1);
        assert_eq!(report.patterns[0].category, "flaky-tests");
        assert_eq!(report.recommendations.len(), 1);
        // Dry run persists nothing.
        assert!(librarian.list_recommendations(None).unwrap().is_empty());
    }

    #[test]
    fn test_recommendation_review_flow() {
        let (_dir, librarian, entries) = setup();
        for i in 0..3 {
            let id = experience(&entries, &format!("retry {i}"), "flaky-tests");
            entries.record_outcome(&id, true, None, "agent").unwrap();
        }
        librarian
            .analyze(&ScopeRef::new(ScopeType::Project, "p1"), 30, false)
            .unwrap();
        let pending = librarian.list_recommendations(Some("pending")).unwrap();
        assert_eq!(pending.len(), 1);

        librarian.approve(&pending[0].id, "reviewer").unwrap();
        assert!(librarian.list_recommendations(Some("pending")).unwrap().is_empty());
        assert!(matches!(
            librarian.approve(&pending[0].id, "reviewer"),
            Err(CoreError::Conflict(_))
        ));

        // The promotion actually happened.
        let promoted = pending[0].payload["entryId"].as_str().unwrap();
        let entry = entries.get(EntryKind::Experience, promoted).unwrap();
        assert_eq!(entry.level, Some(ExperienceLevel::Strategy));
    }

    #[tokio::test]
    async fn test_maintenance_job_lifecycle() {
        let (_dir, librarian, entries) = setup();
        let scope = ScopeRef::new(ScopeType::Project, "p1");
        let a = EntryDraft::new(EntryKind::Knowledge, scope.clone(), "agent")
            .with_title("dup")
            .with_content("same content");
        let b = EntryDraft::new(EntryKind::Knowledge, scope, "agent")
            .with_title("dup")
            .with_content("same content");
        entries.create(&a).unwrap();
        entries.create(&b).unwrap();

        let job_id = librarian
            .clone()
            .run_maintenance(vec![MaintenanceTask::Consolidation], false)
            .unwrap();
        // Poll until the background task settles.
        for _ in 0..50 {
            let status = librarian.get_job_status(&job_id).unwrap();
            if matches!(status.state, JobState::Completed | JobState::Failed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let status = librarian.get_job_status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.report["consolidation"]["duplicates"], 1);
    }
}
