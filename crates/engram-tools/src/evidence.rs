//! `memory_evidence` handlers. Evidence has no update action.

use crate::{default_actor, parse_params, to_value};
use engram_core::model::EvidenceDraft;
use engram_core::repo::EvidenceFilter;
use engram_core::{CoreError, CoreResult, EngramContext, EntryKind};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct IdParams {
    id: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(rename = "entryType", default)]
    entry_type: Option<EntryKind>,
    #[serde(rename = "entryId", default)]
    entry_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(rename = "includeInactive", default)]
    include_inactive: bool,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) fn handle(ctx: &EngramContext, action: &str, payload: Value) -> CoreResult<Value> {
    match action {
        "add" => {
            let mut payload = payload;
            if let Some(obj) = payload.as_object_mut() {
                obj.entry("capturedBy").or_insert(json!(default_actor()));
            }
            let draft: EvidenceDraft = parse_params(payload)?;
            to_value(&ctx.evidence.add(&draft)?)
        }
        "get" => {
            let p: IdParams = parse_params(payload)?;
            to_value(&ctx.evidence.get(&p.id)?)
        }
        "list" | "list_by_type" | "list_by_source" => {
            let p: ListParams = parse_params(payload)?;
            if action == "list_by_type" && p.entry_type.is_none() {
                return Err(CoreError::MissingField("entryType".into()));
            }
            if action == "list_by_source" && p.source.is_none() {
                return Err(CoreError::MissingField("source".into()));
            }
            let filter = EvidenceFilter {
                entry_type: p.entry_type,
                entry_id: p.entry_id,
                source: p.source,
                include_inactive: p.include_inactive,
                limit: p.limit.unwrap_or(0),
            };
            to_value(&ctx.evidence.list(&filter)?)
        }
        "deactivate" => {
            let p: IdParams = parse_params(payload)?;
            ctx.evidence.deactivate(&p.id, &p.actor)?;
            Ok(json!({ "deactivated": p.id }))
        }
        "update" => Err(engram_core::repo::evidence::reject_update()),
        other => Err(CoreError::InvalidAction(format!(
            "memory_evidence has no action {other:?}"
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
    async fn test_update_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let added = dispatch(
            &ctx,
            "memory_evidence",
            json!({ "action": "add", "content": "observed", "capturedBy": "a" }),
        )
        .await;
        let id = added["id"].as_str().unwrap();

        let out = dispatch(
            &ctx,
            "memory_evidence",
            json!({ "action": "update", "id": id, "content": "edited" }),
        )
        .await;
        assert_eq!(out["code"], "E1002");
    }

    #[tokio::test]
    async fn test_list_by_source_requires_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(&ctx, "memory_evidence", json!({ "action": "list_by_source" })).await;
        assert_eq!(out["code"], "E1000");
    }
}
