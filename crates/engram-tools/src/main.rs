//! Line-oriented tool driver for local use and smoke testing.
//!
//! Reads one call per line from stdin as `<tool> <json-payload>` and prints
//! the JSON reply. Example:
//!
//! ```text
//! memory_guideline {"action":"add","name":"no-any","scopeType":"project","scopeId":"P1","content":"Never use 'any'"}
//! memory_query {"action":"search","search":"any","scope":{"type":"project","id":"P1"}}
//! ```

use engram_core::{EngramConfig, EngramContext};
use std::io::{BufRead, Write};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engram_core=info,engram_tools=info".into()),
        )
        .init();

    let config = EngramConfig::load();
    let mut ctx = EngramContext::open(config)?;
    ctx.start_embedding(None);
    info!(db = %ctx.storage.path().display(), "engram ready; reading tool calls from stdin");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (tool, payload) = match trimmed.split_once(' ') {
            Some((tool, rest)) => (tool, rest.trim()),
            None => (trimmed, "{}"),
        };
        let payload = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({ "error": format!("bad payload: {e}"), "code": "E1004" })
                )?;
                continue;
            }
        };
        let reply = engram_tools::dispatch(&ctx, tool, payload).await;
        writeln!(stdout, "{reply}")?;
    }
    Ok(())
}
