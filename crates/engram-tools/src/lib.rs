//! Typed tool/action dispatch over the engram core.
//!
//! Each tool is an action-keyed JSON surface. The dispatcher parses the
//! payload once into typed parameter structs, calls the matching core
//! operation, and returns either the result object or a stable error body
//! `{error, code, context, suggestion?}`. Unknown tools and actions are
//! first-class errors, not panics.

mod admin;
mod entries;
mod evidence;
mod graph;
mod locks;
mod query;
mod relations;

use engram_core::{CoreError, CoreResult, EngramContext, ErrorCode};
use serde_json::{json, Value};
use tracing::debug;

/// Tools served by this dispatcher.
pub const TOOLS: &[&str] = &[
    "memory_guideline",
    "memory_knowledge",
    "memory_tool",
    "memory_experience",
    "memory_evidence",
    "graph_node",
    "graph_edge",
    "memory_relation",
    "memory_tag",
    "memory_file_lock",
    "memory_query",
    "memory_feedback",
    "memory_init",
    "memory_health",
    "memory_librarian",
    "memory_export",
    "memory_import",
];

/// Dispatch one tool call. Never returns an error: failures become the
/// stable error body.
pub async fn dispatch(ctx: &EngramContext, tool: &str, payload: Value) -> Value {
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    debug!(tool, action = %action, "dispatch");
    match dispatch_inner(ctx, tool, &action, payload).await {
        Ok(result) => result,
        Err(e) => error_body(&e, tool, &action),
    }
}

async fn dispatch_inner(
    ctx: &EngramContext,
    tool: &str,
    action: &str,
    mut payload: Value,
) -> CoreResult<Value> {
    if !payload.is_object() {
        return Err(CoreError::InvalidParameter {
            name: "payload".into(),
            reason: "tool payloads are JSON objects".into(),
        });
    }
    if action.is_empty() {
        return Err(CoreError::MissingField("action".into()));
    }
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("action");
    }

    match tool {
        "memory_guideline" | "memory_knowledge" | "memory_tool" | "memory_experience" => {
            entries::handle(ctx, tool, action, payload).await
        }
        "memory_evidence" => evidence::handle(ctx, action, payload),
        "graph_node" | "graph_edge" => graph::handle(ctx, tool, action, payload),
        "memory_relation" | "memory_tag" => relations::handle(ctx, tool, action, payload),
        "memory_file_lock" => locks::handle(ctx, action, payload),
        "memory_query" | "memory_feedback" => query::handle(ctx, tool, action, payload).await,
        "memory_init" | "memory_health" | "memory_librarian" | "memory_export"
        | "memory_import" => admin::handle(ctx, tool, action, payload),
        other => Err(CoreError::InvalidAction(format!("unknown tool {other:?}"))),
    }
}

/// Stable error body for the external boundary.
pub fn error_body(e: &CoreError, tool: &str, action: &str) -> Value {
    let code = e.code();
    let mut body = json!({
        "error": e.sanitized_message(),
        "code": code.as_str(),
        "context": { "tool": tool, "action": action },
    });
    if let Some(suggestion) = suggestion_for(code) {
        body["suggestion"] = Value::String(suggestion.to_string());
    }
    body
}

fn suggestion_for(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::FileLocked => {
            Some("wait for the holder, pass a ttlMs when acquiring, or force_unlock with an admin key")
        }
        ErrorCode::AlreadyExists => Some("use update, or pick a different name"),
        ErrorCode::MissingRequiredField | ErrorCode::InvalidParameter => {
            Some("check the action's parameter shape")
        }
        ErrorCode::PermissionDenied => Some("provide a valid adminKey"),
        ErrorCode::ExtractionUnavailable => {
            Some("semantic features need a configured embedding provider")
        }
        _ => None,
    }
}

/// Parse a typed parameter struct, mapping serde failures onto the stable
/// validation codes.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(payload: Value) -> CoreResult<T> {
    serde_json::from_value(payload).map_err(|e| {
        let msg = e.to_string();
        if let Some(rest) = msg.strip_prefix("missing field `") {
            let field = rest.split('`').next().unwrap_or("?");
            CoreError::MissingField(field.to_string())
        } else {
            CoreError::InvalidParameter {
                name: "payload".into(),
                reason: msg,
            }
        }
    })
}

pub(crate) fn default_actor() -> String {
    "agent".to_string()
}

pub(crate) fn to_value<T: serde::Serialize>(value: &T) -> CoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::EngramConfig;

    async fn ctx(dir: &tempfile::TempDir) -> EngramContext {
        EngramContext::open(EngramConfig {
            database_path: dir.path().join("engram.sqlite"),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_action() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(&ctx, "memory_nope", json!({ "action": "get" })).await;
        assert_eq!(out["code"], "E1002");
    }

    #[tokio::test]
    async fn test_missing_action_is_e1000() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(&ctx, "memory_guideline", json!({})).await;
        assert_eq!(out["code"], "E1000");
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir).await;
        let out = dispatch(
            &ctx,
            "memory_guideline",
            json!({ "action": "get", "id": "missing" }),
        )
        .await;
        assert_eq!(out["code"], "E2000");
        assert!(out["error"].is_string());
        assert_eq!(out["context"]["tool"], "memory_guideline");
        assert_eq!(out["context"]["action"], "get");
    }
}
