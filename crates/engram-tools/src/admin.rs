//! Admin-facing tools: `memory_init`, `memory_health`, `memory_librarian`,
//! `memory_export`, `memory_import`.

use crate::{default_actor, parse_params, to_value};
use engram_core::export::{bundle_from_json, bundle_to_json, ConflictStrategy, ExportBundle};
use engram_core::librarian::MaintenanceTask;
use engram_core::{CoreError, CoreResult, EngramContext, ScopeRef, ScopeType};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct InitParams {
    #[serde(default)]
    confirm: bool,
    /// With `force`, init behaves like a confirmed reset (admin-gated).
    #[serde(default)]
    force: bool,
    #[serde(rename = "adminKey", default)]
    admin_key: Option<String>,
}

#[derive(Deserialize)]
struct RegisterScopeParams {
    #[serde(rename = "scopeType")]
    scope_type: ScopeType,
    #[serde(rename = "scopeId", default)]
    scope_id: Option<String>,
    #[serde(rename = "parentId", default)]
    parent_id: Option<String>,
}

#[derive(Deserialize)]
struct AnalyzeParams {
    #[serde(rename = "scopeType")]
    scope_type: ScopeType,
    #[serde(rename = "scopeId", default)]
    scope_id: Option<String>,
    #[serde(rename = "lookbackDays", default = "default_lookback")]
    lookback_days: u32,
    #[serde(rename = "dryRun", default)]
    dry_run: bool,
}

fn default_lookback() -> u32 {
    30
}

#[derive(Deserialize)]
struct MaintenanceParams {
    tasks: Vec<MaintenanceTask>,
    #[serde(rename = "dryRun", default)]
    dry_run: bool,
}

#[derive(Deserialize)]
struct JobParams {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Deserialize)]
struct RecommendationParams {
    id: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct ListRecommendationParams {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct ExportParams {
    #[serde(rename = "scopeType")]
    scope_type: ScopeType,
    #[serde(rename = "scopeId", default)]
    scope_id: Option<String>,
    #[serde(rename = "includeVersions", default)]
    include_versions: bool,
    /// `json` is the only built-in format; other formats live in external
    /// formatters.
    #[serde(default)]
    format: Option<String>,
}

#[derive(Deserialize)]
struct ImportParams {
    #[serde(default)]
    bundle: Option<ExportBundle>,
    /// Alternative to `bundle`: the bundle as a JSON string.
    #[serde(default)]
    json: Option<String>,
    #[serde(rename = "conflictStrategy", default)]
    conflict_strategy: ConflictStrategy,
    #[serde(default = "default_actor")]
    actor: String,
}

pub(crate) fn handle(
    ctx: &EngramContext,
    tool: &str,
    action: &str,
    payload: Value,
) -> CoreResult<Value> {
    match (tool, action) {
        ("memory_init", "init") => {
            // The schema is migrated on open; init verifies and reports, or
            // wipes first when forced.
            let p: InitParams = parse_params(payload)?;
            if p.force {
                ctx.authorize_admin(p.admin_key.as_deref())?;
                ctx.storage.reset(true)?;
                ctx.bus.bump_epoch();
            }
            ctx.storage.verify_integrity()?;
            to_value(&ctx.storage.migration_status()?)
        }
        ("memory_init", "status") => to_value(&ctx.storage.migration_status()?),
        ("memory_init", "verify") => {
            ctx.storage.verify_integrity()?;
            Ok(json!({ "ok": true }))
        }
        ("memory_init", "reset") => {
            let p: InitParams = parse_params(payload)?;
            ctx.authorize_admin(p.admin_key.as_deref())?;
            ctx.storage.reset(p.confirm)?;
            ctx.bus.bump_epoch();
            Ok(json!({ "reset": true }))
        }
        ("memory_init", "register_scope") => {
            let p: RegisterScopeParams = parse_params(payload)?;
            let scope = ScopeRef {
                scope_type: p.scope_type,
                scope_id: p.scope_id,
            };
            ctx.scopes.register(&scope, p.parent_id.as_deref())?;
            Ok(json!({ "registered": scope.to_string() }))
        }
        ("memory_health", "check") => to_value(&ctx.health()?),
        ("memory_librarian", "analyze") => {
            let p: AnalyzeParams = parse_params(payload)?;
            let scope = ScopeRef {
                scope_type: p.scope_type,
                scope_id: p.scope_id,
            };
            scope.validate()?;
            to_value(&ctx.librarian.analyze(&scope, p.lookback_days, p.dry_run)?)
        }
        ("memory_librarian", "run_maintenance") => {
            let p: MaintenanceParams = parse_params(payload)?;
            let job_id = ctx.librarian.clone().run_maintenance(p.tasks, p.dry_run)?;
            Ok(json!({ "jobId": job_id }))
        }
        ("memory_librarian", "get_job_status") => {
            let p: JobParams = parse_params(payload)?;
            to_value(&ctx.librarian.get_job_status(&p.job_id)?)
        }
        ("memory_librarian", "list_recommendations") => {
            let p: ListRecommendationParams = parse_params(payload)?;
            to_value(&ctx.librarian.list_recommendations(p.status.as_deref())?)
        }
        ("memory_librarian", "approve") => {
            let p: RecommendationParams = parse_params(payload)?;
            ctx.librarian.approve(&p.id, &p.actor)?;
            Ok(json!({ "approved": p.id }))
        }
        ("memory_librarian", "reject") => {
            let p: RecommendationParams = parse_params(payload)?;
            ctx.librarian.reject(&p.id, &p.actor)?;
            Ok(json!({ "rejected": p.id }))
        }
        ("memory_librarian", "skip") => {
            let p: RecommendationParams = parse_params(payload)?;
            ctx.librarian.skip(&p.id, &p.actor)?;
            Ok(json!({ "skipped": p.id }))
        }
        ("memory_export", "export") => {
            let p: ExportParams = parse_params(payload)?;
            if let Some(format) = p.format.as_deref() {
                if format != "json" {
                    return Err(CoreError::InvalidParameter {
                        name: "format".into(),
                        reason: format!("{format:?} is handled by external formatters; use json"),
                    });
                }
            }
            let scope = ScopeRef {
                scope_type: p.scope_type,
                scope_id: p.scope_id,
            };
            let bundle = ctx.exporter.export(&scope, p.include_versions)?;
            Ok(json!({ "json": bundle_to_json(&bundle)? }))
        }
        ("memory_import", "import") => {
            let p: ImportParams = parse_params(payload)?;
            let bundle = match (p.bundle, p.json) {
                (Some(bundle), _) => bundle,
                (None, Some(json)) => bundle_from_json(&json)?,
                (None, None) => return Err(CoreError::MissingField("bundle|json".into())),
            };
            to_value(&ctx.exporter.import(&bundle, p.conflict_strategy, &p.actor)?)
        }
        (tool, other) => Err(CoreError::InvalidAction(format!(
            "{tool} has no action {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::dispatch;
    use engram_core::{EngramConfig, EngramContext};
    use serde_json::json;

    async fn ctx(dir: &tempfile::TempDir) -> EngramContext {
        EngramContext::open(EngramConfig {
            database_path: dir.path().join("engram.sqlite"),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let status = dispatch(&ctx, "memory_init", json!({ "action": "status" })).await;
        assert_eq!(status["pending"], 0);

        let health = dispatch(&ctx, "memory_health", json!({ "action": "check" })).await;
        assert_eq!(health["semanticEnabled"], false);
    }

    #[tokio::test]
    async fn test_export_import_via_tools() {
        let dir = tempfile::tempdir().unwrap();
        let ctx1 = ctx(&dir).await;
        dispatch(
            &ctx1,
            "memory_knowledge",
            json!({
                "action": "add",
                "title": "t",
                "scopeType": "project",
                "scopeId": "P1",
                "content": "c",
            }),
        )
        .await;

        let exported = dispatch(
            &ctx1,
            "memory_export",
            json!({
                "action": "export",
                "scopeType": "project",
                "scopeId": "P1",
                "includeVersions": true,
            }),
        )
        .await;
        let bundle_json = exported["json"].as_str().unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let ctx2 = ctx(&dir2).await;
        let stats = dispatch(
            &ctx2,
            "memory_import",
            json!({ "action": "import", "json": bundle_json, "conflictStrategy": "update" }),
        )
        .await;
        assert_eq!(stats["created"], 1);
    }

    #[tokio::test]
    async fn test_reset_gated() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(
            &ctx,
            "memory_init",
            json!({ "action": "reset", "confirm": true }),
        )
        .await;
        assert_eq!(out["code"], "E6000");
    }

    #[tokio::test]
    async fn test_non_json_export_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(
            &ctx,
            "memory_export",
            json!({ "action": "export", "scopeType": "global", "format": "yaml" }),
        )
        .await;
        assert_eq!(out["code"], "E1004");
    }
}
