//! `memory_query` and `memory_feedback` handlers.

use crate::{default_actor, parse_params, to_value};
use engram_core::query::MemoryQueryParams;
use engram_core::{CoreError, CoreResult, EngramContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

#[derive(Deserialize)]
struct FeedbackParams {
    #[serde(rename = "entryId", default)]
    entry_id: Option<String>,
    #[serde(rename = "queryText", default)]
    query_text: Option<String>,
    #[serde(rename = "topEntryIds", default)]
    top_entry_ids: Vec<String>,
    success: bool,
    #[serde(default)]
    note: Option<String>,
    #[serde(default = "default_actor")]
    actor: String,
}

pub(crate) async fn handle(
    ctx: &EngramContext,
    tool: &str,
    action: &str,
    payload: Value,
) -> CoreResult<Value> {
    match (tool, action) {
        ("memory_query", "query" | "context" | "search") => {
            // deadlineMs is an envelope concern; strip it before the strict
            // params parse.
            let mut payload = payload;
            let deadline = payload
                .as_object_mut()
                .and_then(|obj| obj.remove("deadlineMs"))
                .and_then(|v| v.as_u64())
                .map(|ms| Instant::now() + Duration::from_millis(ms));
            let params: MemoryQueryParams = parse_params(payload)?;
            to_value(&ctx.query.execute(&params, deadline).await?)
        }
        ("memory_feedback", "record") => {
            let p: FeedbackParams = parse_params(payload)?;
            match (&p.entry_id, &p.query_text) {
                (Some(entry_id), _) => {
                    let outcome =
                        ctx.entries
                            .record_outcome(entry_id, p.success, p.note.as_deref(), &p.actor)?;
                    to_value(&outcome)
                }
                (None, Some(query_text)) => {
                    ctx.record_query_feedback(query_text, None, &p.top_entry_ids, p.success)?;
                    Ok(json!({ "recorded": true }))
                }
                (None, None) => Err(CoreError::MissingField("entryId|queryText".into())),
            }
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
    async fn test_query_roundtrip_with_search() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        dispatch(
            &ctx,
            "memory_knowledge",
            json!({
                "action": "add",
                "title": "DB choice",
                "scopeType": "project",
                "scopeId": "P1",
                "content": "We chose postgres for storage",
            }),
        )
        .await;

        let out = dispatch(
            &ctx,
            "memory_query",
            json!({
                "action": "search",
                "search": "postgres",
                "scope": { "type": "project", "id": "P1" },
            }),
        )
        .await;
        assert_eq!(out["meta"]["returnedCount"], 1);
        assert_eq!(out["items"][0]["title"], "DB choice");
    }

    #[tokio::test]
    async fn test_unknown_query_flag_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(
            &ctx,
            "memory_query",
            json!({ "action": "search", "search": "x", "rankMode": "magic" }),
        )
        .await;
        assert_eq!(out["code"], "E1004");
    }

    #[tokio::test]
    async fn test_feedback_requires_target() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(
            &ctx,
            "memory_feedback",
            json!({ "action": "record", "success": true }),
        )
        .await;
        assert_eq!(out["code"], "E1000");
    }
}
