//! `memory_{guideline,knowledge,tool,experience}` handlers.

use crate::{default_actor, parse_params, to_value};
use engram_core::model::{EntryDraft, EntryPatch, ExperienceLevel};
use engram_core::repo::EntryFilter;
use engram_core::{CoreError, CoreResult, EngramContext, EntryKind, ScopeRef, ScopeType};
use serde::Deserialize;
use serde_json::{json, Value};

fn kind_of(tool: &str) -> CoreResult<EntryKind> {
    match tool {
        "memory_guideline" => Ok(EntryKind::Guideline),
        "memory_knowledge" => Ok(EntryKind::Knowledge),
        "memory_tool" => Ok(EntryKind::Tool),
        "memory_experience" => Ok(EntryKind::Experience),
        other => Err(CoreError::InvalidAction(format!("unknown tool {other:?}"))),
    }
}

#[derive(Deserialize)]
struct GetParams {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "scopeType", default)]
    scope_type: Option<ScopeType>,
    #[serde(rename = "scopeId", default)]
    scope_id: Option<String>,
}

#[derive(Deserialize)]
struct UpdateParams {
    id: String,
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(flatten)]
    patch: EntryPatch,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(rename = "adminKey", default)]
    admin_key: Option<String>,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(rename = "scopeType", default)]
    scope_type: Option<ScopeType>,
    #[serde(rename = "scopeId", default)]
    scope_id: Option<String>,
    #[serde(default)]
    inherit: Option<bool>,
    #[serde(rename = "includeInactive", default)]
    include_inactive: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    level: Option<ExperienceLevel>,
    #[serde(rename = "priorityMin", default)]
    priority_min: Option<i64>,
    #[serde(rename = "priorityMax", default)]
    priority_max: Option<i64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

#[derive(Deserialize)]
struct BulkAddParams {
    items: Vec<Value>,
}

#[derive(Deserialize)]
struct PromoteParams {
    id: String,
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(rename = "materializeTool", default)]
    materialize_tool: bool,
}

#[derive(Deserialize)]
struct OutcomeParams {
    id: String,
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
    let kind = kind_of(tool)?;
    match action {
        "add" => add(ctx, kind, payload),
        "bulk_add" => bulk_add(ctx, kind, payload),
        "update" => {
            let p: UpdateParams = parse_params(payload)?;
            let entry = ctx.entries.update(kind, &p.id, &p.patch, &p.actor)?;
            to_value(&entry)
        }
        "get" => get(ctx, kind, payload),
        "list" => list(ctx, kind, payload),
        "history" => {
            let p: GetParams = parse_params(payload)?;
            let id = p.id.ok_or_else(|| CoreError::MissingField("id".into()))?;
            to_value(&ctx.entries.history(kind, &id)?)
        }
        "deactivate" => {
            let p: IdParams = parse_params(payload)?;
            ctx.entries.deactivate(kind, &p.id, &p.actor)?;
            Ok(json!({ "deactivated": p.id }))
        }
        "delete" => {
            let p: IdParams = parse_params(payload)?;
            let token = ctx.authorize_admin(p.admin_key.as_deref())?;
            ctx.entries.delete(kind, &p.id, &p.actor, &token)?;
            Ok(json!({ "deleted": p.id }))
        }
        "promote" if kind == EntryKind::Experience => {
            let p: PromoteParams = parse_params(payload)?;
            to_value(&ctx.entries.promote(&p.id, &p.actor, p.materialize_tool)?)
        }
        "record_outcome" => {
            let p: OutcomeParams = parse_params(payload)?;
            to_value(&ctx
                .entries
                .record_outcome(&p.id, p.success, p.note.as_deref(), &p.actor)?)
        }
        other => Err(CoreError::InvalidAction(format!(
            "{tool} has no action {other:?}"
        ))),
    }
}

fn add(ctx: &EngramContext, kind: EntryKind, mut payload: Value) -> CoreResult<Value> {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("kind".to_string(), json!(kind.as_str()));
        obj.entry("createdBy").or_insert(json!(default_actor()));
    }
    let draft: EntryDraft = parse_params(payload)?;
    let entry = ctx.entries.create(&draft)?;
    to_value(&entry)
}

fn bulk_add(ctx: &EngramContext, kind: EntryKind, payload: Value) -> CoreResult<Value> {
    let p: BulkAddParams = parse_params(payload)?;
    let mut results = Vec::with_capacity(p.items.len());
    for item in p.items {
        match add(ctx, kind, item) {
            Ok(entry) => results.push(json!({ "ok": true, "entry": entry })),
            Err(e) => results.push(json!({
                "ok": false,
                "error": e.sanitized_message(),
                "code": e.code().as_str(),
            })),
        }
    }
    Ok(json!({ "results": results }))
}

fn get(ctx: &EngramContext, kind: EntryKind, payload: Value) -> CoreResult<Value> {
    let p: GetParams = parse_params(payload)?;
    match (p.id, p.name) {
        (Some(id), _) => to_value(&ctx.entries.get(kind, &id)?),
        (None, Some(name)) => {
            let scope_type = p
                .scope_type
                .ok_or_else(|| CoreError::MissingField("scopeType".into()))?;
            let scope = ScopeRef {
                scope_type,
                scope_id: p.scope_id,
            };
            scope.validate()?;
            let entry = ctx
                .entries
                .get_by_name(kind, &scope, &name)?
                .ok_or_else(|| CoreError::NotFound {
                    kind: kind.to_string(),
                    id: name,
                })?;
            to_value(&entry)
        }
        (None, None) => Err(CoreError::MissingField("id".into())),
    }
}

fn list(ctx: &EngramContext, kind: EntryKind, payload: Value) -> CoreResult<Value> {
    let p: ListParams = parse_params(payload)?;
    let scopes = match p.scope_type {
        Some(scope_type) => {
            let leaf = ScopeRef {
                scope_type,
                scope_id: p.scope_id,
            };
            leaf.validate()?;
            ctx.scopes
                .resolve(&leaf, p.inherit.unwrap_or(true))?
                .into_iter()
                .map(|s| s.scope)
                .collect()
        }
        None => vec![ScopeRef::global()],
    };
    let filter = EntryFilter {
        kinds: vec![kind],
        scopes,
        include_inactive: p.include_inactive,
        category: p.category,
        level: p.level,
        priority_min: p.priority_min,
        priority_max: p.priority_max,
        limit: p.limit,
        offset: p.offset,
        ..Default::default()
    };
    to_value(&ctx.entries.list(&filter)?)
}
