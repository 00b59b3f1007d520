//! Integration tests: the memory store end to end.
//!
//! Verifies that:
//! 1. Critical guidelines surface through scope inheritance and drop out
//!    when their priority falls below the threshold.
//! 2. Updates append versions; history and the current pointer stay dense.
//! 3. Inheritance ranks more specific scopes above global on ties.
//! 4. File locks serialize contenders and expire by TTL.
//! 5. A write invalidates cached query results immediately.
//! 6. A failing embedder degrades semantic search instead of failing it.

use engram_core::index::embedding::Embedder;
use engram_core::model::EntryDraft;
use engram_core::query::{MemoryQueryParams, ScopeParam};
use engram_core::{
    CoreError, CoreResult, EngramConfig, EngramContext, EntryKind, EntryPatch, ScopeRef, ScopeType,
};
use std::sync::Arc;

fn open(dir: &tempfile::TempDir) -> EngramContext {
    EngramContext::open(EngramConfig {
        database_path: dir.path().join("engram.sqlite"),
        ..Default::default()
    })
    .unwrap()
}

fn session_under_project(ctx: &EngramContext, project: &str, session: &str) {
    ctx.scopes
        .register(&ScopeRef::new(ScopeType::Project, project), None)
        .unwrap();
    ctx.scopes
        .register(&ScopeRef::new(ScopeType::Session, session), Some(project))
        .unwrap();
}

fn query_at_session(session: &str) -> MemoryQueryParams {
    MemoryQueryParams {
        scope: Some(ScopeParam {
            scope_type: ScopeType::Session,
            id: Some(session.to_string()),
            inherit: Some(true),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn critical_guideline_surfaces_and_drops_with_priority() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);
    session_under_project(&ctx, "P1", "S1");

    let guideline = ctx
        .entries
        .create(
            &EntryDraft::new(
                EntryKind::Guideline,
                ScopeRef::new(ScopeType::Project, "P1"),
                "tester",
            )
            .with_name("no-any")
            .with_content("Never use 'any' type")
            .with_priority(95),
        )
        .unwrap();

    let mut params = query_at_session("S1");
    params.types = vec![EntryKind::Guideline];
    params.critical = true;

    let results = ctx.query.execute(&params, None).await.unwrap();
    assert_eq!(results.meta.returned_count, 1);
    assert_eq!(results.items[0].entry.name.as_deref(), Some("no-any"));

    // Lower the priority below the critical threshold; the same query must
    // now exclude it (and must not serve a stale cache).
    ctx.entries
        .update(
            EntryKind::Guideline,
            &guideline.id,
            &EntryPatch {
                priority: Some(80),
                ..Default::default()
            },
            "tester",
        )
        .unwrap();
    let results = ctx.query.execute(&params, None).await.unwrap();
    assert_eq!(results.meta.returned_count, 0);
}

#[tokio::test]
async fn versioning_appends_and_advances_current() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);

    let entry = ctx
        .entries
        .create(
            &EntryDraft::new(
                EntryKind::Knowledge,
                ScopeRef::new(ScopeType::Project, "P1"),
                "tester",
            )
            .with_title("DB choice")
            .with_content("PostgreSQL"),
        )
        .unwrap();

    ctx.entries
        .update(
            EntryKind::Knowledge,
            &entry.id,
            &EntryPatch {
                content: Some("MySQL".into()),
                change_reason: Some("switched".into()),
                ..Default::default()
            },
            "tester",
        )
        .unwrap();

    let current = ctx.entries.get(EntryKind::Knowledge, &entry.id).unwrap();
    assert_eq!(current.current.content, "MySQL");
    assert_eq!(current.version_num, 2);

    let history = ctx.entries.history(EntryKind::Knowledge, &entry.id).unwrap();
    let nums: Vec<i64> = history.iter().map(|v| v.version_num).collect();
    assert_eq!(nums, vec![2, 1], "history is newest-first and dense");
    assert_eq!(history[0].change_reason.as_deref(), Some("switched"));
}

#[tokio::test]
async fn inheritance_ranks_specific_scope_above_global() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);
    session_under_project(&ctx, "P1", "S1");

    ctx.entries
        .create(
            &EntryDraft::new(EntryKind::Guideline, ScopeRef::global(), "tester")
                .with_name("prefer-clarity")
                .with_content("Prefer clarity over cleverness"),
        )
        .unwrap();
    ctx.entries
        .create(
            &EntryDraft::new(
                EntryKind::Guideline,
                ScopeRef::new(ScopeType::Project, "P1"),
                "tester",
            )
            .with_name("project-style")
            .with_content("Follow the project style guide"),
        )
        .unwrap();

    let mut params = query_at_session("S1");
    params.types = vec![EntryKind::Guideline];
    let results = ctx.query.execute(&params, None).await.unwrap();
    assert_eq!(results.meta.returned_count, 2, "both scopes are reachable");
    assert_eq!(
        results.items[0].entry.scope.scope_type,
        ScopeType::Project,
        "project entry outranks global on ties"
    );
    assert_eq!(results.items[1].entry.scope.scope_type, ScopeType::Global);
}

#[tokio::test]
async fn file_lock_contention_and_ttl_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);

    let a = ctx
        .locks
        .acquire("/abs/x.ts", "A", Some(150), None)
        .unwrap();
    assert!(a.acquired);

    let b = ctx.locks.acquire("/abs/x.ts", "B", None, None).unwrap();
    assert!(!b.acquired, "held lock refuses a second owner");

    std::thread::sleep(std::time::Duration::from_millis(200));
    let b = ctx
        .locks
        .acquire("/abs/x.ts", "B", Some(60_000), None)
        .unwrap();
    assert!(b.acquired, "expired lock is superseded");
    assert_eq!(
        ctx.locks
            .get_lock("/abs/x.ts")
            .unwrap()
            .unwrap()
            .checked_out_by,
        "B"
    );
}

#[tokio::test]
async fn write_invalidates_cached_query() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);
    let scope = ScopeRef::new(ScopeType::Project, "P1");

    for i in 0..3 {
        ctx.entries
            .create(
                &EntryDraft::new(EntryKind::Knowledge, scope.clone(), "tester")
                    .with_title(format!("note {i}"))
                    .with_content("postgres tuning note"),
            )
            .unwrap();
    }

    let params = MemoryQueryParams {
        search: Some("postgres".into()),
        scope: Some(ScopeParam {
            scope_type: ScopeType::Project,
            id: Some("P1".into()),
            inherit: Some(false),
        }),
        ..Default::default()
    };
    let first = ctx.query.execute(&params, None).await.unwrap();
    assert_eq!(first.meta.returned_count, 3);

    // Warm cache, then write a matching entry.
    let cached = ctx.query.execute(&params, None).await.unwrap();
    assert!(cached.meta.cache_hit);

    ctx.entries
        .create(
            &EntryDraft::new(EntryKind::Knowledge, scope, "tester")
                .with_title("new note")
                .with_content("postgres connection pooling"),
        )
        .unwrap();

    let after = ctx.query.execute(&params, None).await.unwrap();
    assert!(!after.meta.cache_hit, "write must drop the cached result");
    assert_eq!(after.meta.returned_count, 4);
}

struct DownEmbedder;

#[async_trait::async_trait]
impl Embedder for DownEmbedder {
    fn model_id(&self) -> &str {
        "down"
    }
    fn dimensions(&self) -> usize {
        4
    }
    async fn embed(&self, _text: &str) -> CoreResult<Vec<f32>> {
        Err(CoreError::EmbedderUnavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn semantic_fallback_when_embedder_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = open(&dir);
    ctx.start_embedding(Some(Arc::new(DownEmbedder)));

    let scope = ScopeRef::new(ScopeType::Project, "P1");
    ctx.entries
        .create(
            &EntryDraft::new(EntryKind::Knowledge, scope, "tester")
                .with_title("perf")
                .with_content("benchmark results for the parser"),
        )
        .unwrap();

    let params = MemoryQueryParams {
        search: Some("benchmark".into()),
        semantic_search: true,
        scope: Some(ScopeParam {
            scope_type: ScopeType::Project,
            id: Some("P1".into()),
            inherit: Some(false),
        }),
        ..Default::default()
    };
    let results = ctx.query.execute(&params, None).await.unwrap();
    assert_eq!(results.meta.returned_count, 1, "FTS still answers");
    assert!(
        results.meta.degraded.contains(&"semantic".to_string()),
        "degradation is reported, not fatal"
    );
}

#[tokio::test]
async fn limit_zero_returns_empty_with_zero_total() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);
    let params = MemoryQueryParams {
        limit: 0,
        ..Default::default()
    };
    let results = ctx.query.execute(&params, None).await.unwrap();
    assert_eq!(results.meta.total_count, 0);
    assert!(results.items.is_empty());
}

#[tokio::test]
async fn fuzzy_search_tolerates_one_typo() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);
    let scope = ScopeRef::new(ScopeType::Project, "P1");
    ctx.entries
        .create(
            &EntryDraft::new(EntryKind::Knowledge, scope, "tester")
                .with_title("storage")
                .with_content("postgres is the storage engine"),
        )
        .unwrap();

    let params = MemoryQueryParams {
        search: Some("postgers".into()),
        use_fts5: false,
        fuzzy: true,
        scope: Some(ScopeParam {
            scope_type: ScopeType::Project,
            id: Some("P1".into()),
            inherit: Some(false),
        }),
        ..Default::default()
    };
    let results = ctx.query.execute(&params, None).await.unwrap();
    assert_eq!(results.meta.returned_count, 1);
}

#[tokio::test]
async fn audit_trail_covers_writes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir);
    let entry = ctx
        .entries
        .create(
            &EntryDraft::new(
                EntryKind::Knowledge,
                ScopeRef::new(ScopeType::Project, "P1"),
                "tester",
            )
            .with_title("t")
            .with_content("c"),
        )
        .unwrap();
    ctx.entries
        .deactivate(EntryKind::Knowledge, &entry.id, "tester")
        .unwrap();

    let records = ctx
        .audit
        .list(&engram_core::repo::AuditFilter {
            entry_id: Some(entry.id.clone()),
            ..Default::default()
        })
        .unwrap();
    let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
    assert!(actions.contains(&"entry_created"));
    assert!(actions.contains(&"entry_deleted"));
}
