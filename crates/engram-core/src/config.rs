//! Engram configuration loaded from `.env` / environment with an optional
//! `engram.toml` overlay.
//!
//! Every knob has a working default so a bare `EngramConfig::from_env()` gives
//! a usable local store. Env vars win over the TOML file.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Capability token required by admin-gated operations (hard delete, force
/// unlock, reset). Only [`EngramConfig::authorize_admin`] can mint one.
#[derive(Debug, Clone)]
pub struct AdminToken(());

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/engram/engram.sqlite")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_query_ttl_ms() -> u64 {
    30_000
}

fn default_query_cache_max_entries() -> usize {
    256
}

fn default_semantic_threshold() -> f32 {
    0.35
}

fn default_critical_priority_threshold() -> i64 {
    90
}

fn default_recency_half_life_days() -> f64 {
    30.0
}

fn default_max_query_limit() -> usize {
    200
}

fn default_embed_queue_capacity() -> usize {
    512
}

fn default_reader_pool_size() -> usize {
    4
}

fn default_context_boost_cap() -> f32 {
    1.2
}

fn default_permission_mode() -> PermissionMode {
    PermissionMode::Strict
}

/// How admin-gated operations (hard delete, force unlock, reset) are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Admin actions require the configured admin key.
    #[default]
    Strict,
    /// Admin actions are allowed without a key (single-user local setups).
    Permissive,
}

/// Weights for the composite ranking score. Textual + semantic stay dominant
/// by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankWeights {
    pub textual: f32,
    pub semantic: f32,
    pub priority: f32,
    pub recency: f32,
    pub usefulness: f32,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            textual: 0.30,
            semantic: 0.30,
            priority: 0.15,
            recency: 0.10,
            usefulness: 0.15,
        }
    }
}

/// Engram configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | ENGRAM_DB_PATH | ./data/engram/engram.sqlite | SQLite database file. |
/// | ENGRAM_BUSY_TIMEOUT_MS | 5000 | SQLite busy timeout per connection. |
/// | ENGRAM_QUERY_TTL_MS | 30000 | Query cache entry TTL. |
/// | ENGRAM_QUERY_CACHE_MAX | 256 | Query cache capacity (entries). |
/// | ENGRAM_EMBEDDING_URL / _MODEL / _API_KEY | unset | Remote embedder; unset disables semantic search. |
/// | ENGRAM_EMBEDDING_DIMENSIONS | 384 | Expected vector dimensions. |
/// | ENGRAM_SEMANTIC_THRESHOLD | 0.35 | Minimum cosine similarity for semantic hits. |
/// | ENGRAM_CRITICAL_PRIORITY | 90 | Priority at/above which a guideline is critical. |
/// | ENGRAM_RECENCY_HALF_LIFE_DAYS | 30 | Half-life for the recency decay signal. |
/// | ENGRAM_MAX_QUERY_LIMIT | 200 | Hard cap on query `limit`. |
/// | ENGRAM_ADMIN_KEY | unset | Key required for admin actions in strict mode. |
/// | ENGRAM_PERMISSION_MODE | strict | `strict` \| `permissive`. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngramConfig {
    /// ENGRAM_DB_PATH: SQLite database file (WAL sidecars live next to it).
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// ENGRAM_BUSY_TIMEOUT_MS: per-connection busy timeout.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// ENGRAM_CACHE_KB: SQLite page-cache budget per connection, in KiB.
    #[serde(default = "default_cache_memory_kb")]
    pub cache_memory_kb: u64,
    /// ENGRAM_READER_POOL_SIZE: number of pooled read connections.
    #[serde(default = "default_reader_pool_size")]
    pub reader_pool_size: usize,
    /// ENGRAM_QUERY_TTL_MS: TTL for cached query results.
    #[serde(default = "default_query_ttl_ms")]
    pub query_ttl_ms: u64,
    /// ENGRAM_QUERY_CACHE_MAX: bounded query cache size in entries.
    #[serde(default = "default_query_cache_max_entries")]
    pub query_cache_max_entries: usize,
    /// ENGRAM_EMBEDDING_URL: OpenAI-compatible `/embeddings` endpoint. Unset = semantic search disabled.
    #[serde(default)]
    pub embedding_url: Option<String>,
    /// ENGRAM_EMBEDDING_MODEL: model id sent to the embedding provider.
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// ENGRAM_EMBEDDING_API_KEY: bearer token for the embedding provider.
    #[serde(default, skip_serializing)]
    pub embedding_api_key: Option<String>,
    /// ENGRAM_EMBEDDING_DIMENSIONS: expected vector dimensions; mismatched vectors are rejected.
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
    /// ENGRAM_SEMANTIC_THRESHOLD: minimum cosine similarity for a semantic candidate.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
    /// ENGRAM_CRITICAL_PRIORITY: threshold for critical-only guideline views.
    #[serde(default = "default_critical_priority_threshold")]
    pub critical_priority_threshold: i64,
    /// ENGRAM_RECENCY_HALF_LIFE_DAYS: half-life of the recency score decay.
    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,
    /// Composite score weights; see [`RankWeights`].
    #[serde(default)]
    pub rank_weights: RankWeights,
    /// ENGRAM_CONTEXT_BOOST_CAP: upper bound on the context-similarity multiplier.
    #[serde(default = "default_context_boost_cap")]
    pub context_boost_cap: f32,
    /// ENGRAM_MAX_QUERY_LIMIT: hard cap applied to query `limit`.
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: usize,
    /// ENGRAM_EMBED_QUEUE_CAPACITY: bounded embedding regeneration queue size.
    #[serde(default = "default_embed_queue_capacity")]
    pub embed_queue_capacity: usize,
    /// ENGRAM_RATE_LIMIT_PER_MINUTE: advisory limit enforced by the RPC
    /// facade; the core only carries the setting.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// ENGRAM_SUGGESTION_MIN / ENGRAM_SUGGESTION_MAX: bounds for the
    /// suggestion surface (facade-side).
    #[serde(default = "default_suggestion_min")]
    pub suggestion_min_count: usize,
    #[serde(default = "default_suggestion_max")]
    pub suggestion_max_count: usize,
    /// ENGRAM_EXTRACTION_PROVIDER / ENGRAM_EXTRACTION_MODEL: LLM used by the
    /// external extraction pipeline; opaque to the core.
    #[serde(default)]
    pub extraction_provider: Option<String>,
    #[serde(default)]
    pub extraction_model: Option<String>,
    /// ENGRAM_ADMIN_KEY: required for admin-gated actions in strict mode.
    #[serde(default, skip_serializing)]
    pub admin_key: Option<String>,
    /// ENGRAM_PERMISSION_MODE: strict | permissive.
    #[serde(default = "default_permission_mode")]
    pub permission_mode: PermissionMode,
}

fn default_embedding_dimensions() -> usize {
    384
}

fn default_cache_memory_kb() -> u64 {
    8_192
}

fn default_suggestion_min() -> usize {
    1
}

fn default_suggestion_max() -> usize {
    5
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            cache_memory_kb: default_cache_memory_kb(),
            reader_pool_size: default_reader_pool_size(),
            query_ttl_ms: default_query_ttl_ms(),
            query_cache_max_entries: default_query_cache_max_entries(),
            embedding_url: None,
            embedding_model: None,
            embedding_api_key: None,
            embedding_dimensions: default_embedding_dimensions(),
            semantic_threshold: default_semantic_threshold(),
            critical_priority_threshold: default_critical_priority_threshold(),
            recency_half_life_days: default_recency_half_life_days(),
            rank_weights: RankWeights::default(),
            context_boost_cap: default_context_boost_cap(),
            max_query_limit: default_max_query_limit(),
            embed_queue_capacity: default_embed_queue_capacity(),
            rate_limit_per_minute: None,
            suggestion_min_count: default_suggestion_min(),
            suggestion_max_count: default_suggestion_max(),
            extraction_provider: None,
            extraction_model: None,
            admin_key: None,
            permission_mode: default_permission_mode(),
        }
    }
}

impl EngramConfig {
    /// Load from `.env` and `engram.toml` (if present in the working
    /// directory), then apply environment overrides.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::load_toml(Path::new("engram.toml")).unwrap_or_default();
        cfg.apply_env();
        cfg
    }

    /// Environment-only configuration (no TOML file).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn load_toml(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::warn!("ignoring malformed {}: {}", path.display(), e);
                None
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(p) = env_opt("ENGRAM_DB_PATH") {
            self.database_path = PathBuf::from(p);
        }
        if let Some(v) = env_parse::<u64>("ENGRAM_BUSY_TIMEOUT_MS") {
            self.busy_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("ENGRAM_CACHE_KB") {
            self.cache_memory_kb = v.max(64);
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_READER_POOL_SIZE") {
            self.reader_pool_size = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("ENGRAM_QUERY_TTL_MS") {
            self.query_ttl_ms = v;
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_QUERY_CACHE_MAX") {
            self.query_cache_max_entries = v.max(1);
        }
        if let Some(v) = env_opt("ENGRAM_EMBEDDING_URL") {
            self.embedding_url = Some(v);
        }
        if let Some(v) = env_opt("ENGRAM_EMBEDDING_MODEL") {
            self.embedding_model = Some(v);
        }
        if let Some(v) = env_opt("ENGRAM_EMBEDDING_API_KEY") {
            self.embedding_api_key = Some(v);
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_EMBEDDING_DIMENSIONS") {
            self.embedding_dimensions = v;
        }
        if let Some(v) = env_parse::<f32>("ENGRAM_SEMANTIC_THRESHOLD") {
            self.semantic_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<i64>("ENGRAM_CRITICAL_PRIORITY") {
            self.critical_priority_threshold = v.clamp(0, 100);
        }
        if let Some(v) = env_parse::<f64>("ENGRAM_RECENCY_HALF_LIFE_DAYS") {
            self.recency_half_life_days = v.max(0.01);
        }
        if let Some(v) = env_parse::<f32>("ENGRAM_CONTEXT_BOOST_CAP") {
            self.context_boost_cap = v.max(1.0);
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_MAX_QUERY_LIMIT") {
            self.max_query_limit = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_EMBED_QUEUE_CAPACITY") {
            self.embed_queue_capacity = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("ENGRAM_RATE_LIMIT_PER_MINUTE") {
            self.rate_limit_per_minute = Some(v);
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_SUGGESTION_MIN") {
            self.suggestion_min_count = v;
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_SUGGESTION_MAX") {
            self.suggestion_max_count = v.max(self.suggestion_min_count);
        }
        if let Some(v) = env_opt("ENGRAM_EXTRACTION_PROVIDER") {
            self.extraction_provider = Some(v);
        }
        if let Some(v) = env_opt("ENGRAM_EXTRACTION_MODEL") {
            self.extraction_model = Some(v);
        }
        if let Some(v) = env_opt("ENGRAM_ADMIN_KEY") {
            self.admin_key = Some(v);
        }
        if let Some(v) = env_opt("ENGRAM_PERMISSION_MODE") {
            self.permission_mode = if v.eq_ignore_ascii_case("permissive") {
                PermissionMode::Permissive
            } else {
                PermissionMode::Strict
            };
        }
    }

    /// True when semantic search can run (an embedder endpoint is configured).
    pub fn semantic_enabled(&self) -> bool {
        self.embedding_url.is_some()
    }

    /// Check a presented admin key against the permission mode. Permissive
    /// mode hands out tokens freely; strict mode requires a configured key
    /// and an exact match.
    pub fn authorize_admin(&self, presented_key: Option<&str>) -> CoreResult<AdminToken> {
        match self.permission_mode {
            PermissionMode::Permissive => Ok(AdminToken(())),
            PermissionMode::Strict => match (&self.admin_key, presented_key) {
                (Some(expected), Some(got)) if expected == got => Ok(AdminToken(())),
                (None, _) => Err(CoreError::PermissionDenied(
                    "no admin key configured; admin actions are disabled".into(),
                )),
                _ => Err(CoreError::PermissionDenied("admin key mismatch".into())),
            },
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_opt(name).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngramConfig::default();
        assert_eq!(cfg.critical_priority_threshold, 90);
        assert_eq!(cfg.query_cache_max_entries, 256);
        assert_eq!(cfg.permission_mode, PermissionMode::Strict);
        assert!(!cfg.semantic_enabled());
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = EngramConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: EngramConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.busy_timeout_ms, cfg.busy_timeout_ms);
        assert_eq!(back.max_query_limit, cfg.max_query_limit);
    }

    #[test]
    fn test_rank_weights_default_keeps_text_dominant() {
        let w = RankWeights::default();
        assert!(w.textual + w.semantic > w.priority + w.recency + w.usefulness);
    }

    #[test]
    fn test_admin_authorization() {
        let mut cfg = EngramConfig::default();
        assert!(cfg.authorize_admin(None).is_err());

        cfg.admin_key = Some("sekrit".into());
        assert!(cfg.authorize_admin(Some("sekrit")).is_ok());
        assert!(cfg.authorize_admin(Some("wrong")).is_err());
        assert!(cfg.authorize_admin(None).is_err());

        cfg.permission_mode = PermissionMode::Permissive;
        assert!(cfg.authorize_admin(None).is_ok());
    }
}
