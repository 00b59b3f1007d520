//! `memory_file_lock` handlers: checkout / checkin / status / list /
//! force_unlock / cleanup.

use crate::{default_actor, parse_params, to_value};
use engram_core::repo::LockFilter;
use engram_core::{CoreError, CoreResult, EngramContext};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct CheckoutParams {
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(default = "default_actor")]
    agent: String,
    #[serde(rename = "ttlMs", default)]
    ttl_ms: Option<u64>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
struct CheckinParams {
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(default = "default_actor")]
    agent: String,
}

#[derive(Deserialize)]
struct StatusParams {
    #[serde(rename = "filePath")]
    file_path: String,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    owner: Option<String>,
    #[serde(rename = "pathPrefix", default)]
    path_prefix: Option<String>,
    #[serde(rename = "includeExpired", default)]
    include_expired: bool,
}

#[derive(Deserialize)]
struct ForceParams {
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(rename = "adminKey", default)]
    admin_key: Option<String>,
}

pub(crate) fn handle(ctx: &EngramContext, action: &str, payload: Value) -> CoreResult<Value> {
    match action {
        "checkout" => {
            let p: CheckoutParams = parse_params(payload)?;
            to_value(&ctx.locks.acquire(&p.file_path, &p.agent, p.ttl_ms, p.metadata)?)
        }
        "checkin" => {
            let p: CheckinParams = parse_params(payload)?;
            Ok(json!({ "released": ctx.locks.release(&p.file_path, &p.agent)? }))
        }
        "status" => {
            let p: StatusParams = parse_params(payload)?;
            let lock = ctx.locks.get_lock(&p.file_path)?;
            Ok(json!({
                "locked": ctx.locks.is_locked(&p.file_path)?,
                "lock": lock,
            }))
        }
        "list" => {
            let p: ListParams = parse_params(payload)?;
            let filter = LockFilter {
                owner: p.owner,
                path_prefix: p.path_prefix,
                include_expired: p.include_expired,
            };
            to_value(&ctx.locks.list(&filter)?)
        }
        "force_unlock" => {
            let p: ForceParams = parse_params(payload)?;
            let token = ctx.authorize_admin(p.admin_key.as_deref())?;
            Ok(json!({
                "released": ctx
                    .locks
                    .force_release(&p.file_path, p.reason.as_deref(), &p.actor, &token)?,
            }))
        }
        "cleanup" => Ok(json!({ "removed": ctx.locks.cleanup_expired()? })),
        other => Err(CoreError::InvalidAction(format!(
            "memory_file_lock has no action {other:?}"
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
    async fn test_checkout_contention_and_checkin() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let a = dispatch(
            &ctx,
            "memory_file_lock",
            json!({ "action": "checkout", "filePath": "/abs/x.ts", "agent": "A", "ttlMs": 60000 }),
        )
        .await;
        assert_eq!(a["acquired"], true);

        let b = dispatch(
            &ctx,
            "memory_file_lock",
            json!({ "action": "checkout", "filePath": "/abs/x.ts", "agent": "B" }),
        )
        .await;
        assert_eq!(b["acquired"], false);

        let status = dispatch(
            &ctx,
            "memory_file_lock",
            json!({ "action": "status", "filePath": "/abs/x.ts" }),
        )
        .await;
        assert_eq!(status["locked"], true);

        let released = dispatch(
            &ctx,
            "memory_file_lock",
            json!({ "action": "checkin", "filePath": "/abs/x.ts", "agent": "A" }),
        )
        .await;
        assert_eq!(released["released"], true);
    }

    #[tokio::test]
    async fn test_relative_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(
            &ctx,
            "memory_file_lock",
            json!({ "action": "checkout", "filePath": "x.ts", "agent": "A" }),
        )
        .await;
        assert_eq!(out["code"], "E1003");
    }

    #[tokio::test]
    async fn test_force_unlock_requires_admin() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        dispatch(
            &ctx,
            "memory_file_lock",
            json!({ "action": "checkout", "filePath": "/abs/x.ts", "agent": "A" }),
        )
        .await;
        let out = dispatch(
            &ctx,
            "memory_file_lock",
            json!({ "action": "force_unlock", "filePath": "/abs/x.ts" }),
        )
        .await;
        assert_eq!(out["code"], "E6000");
    }
}
