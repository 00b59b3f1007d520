//! `memory_relation` and `memory_tag` handlers.

use crate::{default_actor, parse_params, to_value};
use engram_core::{CoreError, CoreResult, EngramContext, EntryKind, RelationType};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct RelationCreateParams {
    #[serde(rename = "sourceType")]
    source_type: EntryKind,
    #[serde(rename = "sourceId")]
    source_id: String,
    #[serde(rename = "targetType")]
    target_type: EntryKind,
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "relationType")]
    relation_type: RelationType,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct RelationListParams {
    #[serde(rename = "entryType")]
    entry_type: EntryKind,
    #[serde(rename = "entryId")]
    entry_id: String,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct TagParams {
    name: String,
}

#[derive(Deserialize)]
struct AttachParams {
    #[serde(rename = "entryType")]
    entry_type: EntryKind,
    #[serde(rename = "entryId")]
    entry_id: String,
    tag: String,
}

pub(crate) fn handle(
    ctx: &EngramContext,
    tool: &str,
    action: &str,
    payload: Value,
) -> CoreResult<Value> {
    match tool {
        "memory_relation" => handle_relation(ctx, action, payload),
        "memory_tag" => handle_tag(ctx, action, payload),
        other => Err(CoreError::InvalidAction(format!("unknown tool {other:?}"))),
    }
}

fn handle_relation(ctx: &EngramContext, action: &str, payload: Value) -> CoreResult<Value> {
    match action {
        "create" => {
            let p: RelationCreateParams = parse_params(payload)?;
            to_value(&ctx.relations.create(
                (p.source_type, &p.source_id),
                (p.target_type, &p.target_id),
                p.relation_type,
                &p.actor,
            )?)
        }
        "list" => {
            let p: RelationListParams = parse_params(payload)?;
            to_value(&ctx.relations.list_for(p.entry_type, &p.entry_id)?)
        }
        "delete" => {
            let p: IdParams = parse_params(payload)?;
            Ok(json!({ "deleted": ctx.relations.delete(&p.id, &p.actor)? }))
        }
        other => Err(CoreError::InvalidAction(format!(
            "memory_relation has no action {other:?}"
        ))),
    }
}

fn handle_tag(ctx: &EngramContext, action: &str, payload: Value) -> CoreResult<Value> {
    match action {
        "get_or_create" => {
            let p: TagParams = parse_params(payload)?;
            to_value(&ctx.tags.get_or_create(&p.name)?)
        }
        "get" => {
            let p: TagParams = parse_params(payload)?;
            let tag = ctx
                .tags
                .get_by_name(&p.name)?
                .ok_or_else(|| CoreError::NotFound {
                    kind: "tag".into(),
                    id: p.name,
                })?;
            to_value(&tag)
        }
        "list" => to_value(&ctx.tags.list()?),
        "attach" => {
            let p: AttachParams = parse_params(payload)?;
            ctx.tags.attach(p.entry_type, &p.entry_id, &p.tag)?;
            Ok(json!({ "attached": p.tag }))
        }
        "detach" => {
            let p: AttachParams = parse_params(payload)?;
            Ok(json!({ "detached": ctx.tags.detach(p.entry_type, &p.entry_id, &p.tag)? }))
        }
        "of_entry" => {
            let p: RelationListParams = parse_params(payload)?;
            to_value(&ctx.tags.tags_of(p.entry_type, &p.entry_id)?)
        }
        other => Err(CoreError::InvalidAction(format!(
            "memory_tag has no action {other:?}"
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
    async fn test_relation_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let a = dispatch(
            &ctx,
            "memory_knowledge",
            json!({ "action": "add", "title": "a", "scopeType": "project", "scopeId": "P1", "content": "x" }),
        )
        .await;
        let b = dispatch(
            &ctx,
            "memory_knowledge",
            json!({ "action": "add", "title": "b", "scopeType": "project", "scopeId": "P1", "content": "y" }),
        )
        .await;

        let rel = dispatch(
            &ctx,
            "memory_relation",
            json!({
                "action": "create",
                "sourceType": "knowledge",
                "sourceId": a["id"],
                "targetType": "knowledge",
                "targetId": b["id"],
                "relationType": "depends_on",
            }),
        )
        .await;
        assert!(rel.get("code").is_none(), "unexpected error: {rel}");

        let listed = dispatch(
            &ctx,
            "memory_relation",
            json!({ "action": "list", "entryType": "knowledge", "entryId": a["id"] }),
        )
        .await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tag_attach_detach() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let a = dispatch(
            &ctx,
            "memory_knowledge",
            json!({ "action": "add", "title": "a", "scopeType": "project", "scopeId": "P1", "content": "x" }),
        )
        .await;

        dispatch(
            &ctx,
            "memory_tag",
            json!({ "action": "attach", "entryType": "knowledge", "entryId": a["id"], "tag": "DB" }),
        )
        .await;
        let tags = dispatch(
            &ctx,
            "memory_tag",
            json!({ "action": "of_entry", "entryType": "knowledge", "entryId": a["id"] }),
        )
        .await;
        assert_eq!(tags.as_array().unwrap()[0], "db");
    }
}
