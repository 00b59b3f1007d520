//! Explicit application context.
//!
//! Everything with state lives here and is threaded through operations; no
//! module-level mutables. `open` wires storage, repositories, indices,
//! caches, and the event bus; `start_embedding` attaches an embedder and
//! spawns the regeneration worker (requires a tokio runtime).

use crate::config::{AdminToken, EngramConfig};
use crate::error::CoreResult;
use crate::events::EventBus;
use crate::export::Exporter;
use crate::index::embedding::{spawn_regen_worker, Embedder, EmbeddingStore, HttpEmbedder};
use crate::librarian::Librarian;
use crate::model::MemoryEvent;
use crate::query::{PriorityCache, QueryCache, QueryEngine};
use crate::repo::{
    AuditRepo, EntriesRepo, EvidenceRepo, GraphRepo, LockRepo, RelationRepo, TagRepo,
};
use crate::scope::ScopeResolver;
use crate::storage::{MigrationStatus, Storage};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Health snapshot for the `memory_health` surface.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub migrations: MigrationStatus,
    pub entry_counts: Vec<(String, i64)>,
    pub embedding_coverage: (i64, i64),
    pub query_cache: crate::query::CacheStats,
    pub audit_rows: i64,
    pub semantic_enabled: bool,
}

/// The assembled core. Construct once at startup and share via `Arc`.
pub struct EngramContext {
    pub config: Arc<EngramConfig>,
    pub storage: Arc<Storage>,
    pub bus: Arc<EventBus>,
    pub scopes: Arc<ScopeResolver>,
    pub entries: Arc<EntriesRepo>,
    pub evidence: Arc<EvidenceRepo>,
    pub relations: Arc<RelationRepo>,
    pub tags: Arc<TagRepo>,
    pub graph: Arc<GraphRepo>,
    pub locks: Arc<LockRepo>,
    pub audit: Arc<AuditRepo>,
    pub embeddings: Arc<EmbeddingStore>,
    pub query: Arc<QueryEngine>,
    pub query_cache: Arc<QueryCache>,
    pub priority_cache: Arc<PriorityCache>,
    pub librarian: Arc<Librarian>,
    pub exporter: Arc<Exporter>,
}

impl EngramContext {
    /// Open the store and wire every component. Does not start the embedding
    /// worker; call [`EngramContext::start_embedding`] from async context if
    /// semantic search is configured.
    pub fn open(config: EngramConfig) -> CoreResult<Self> {
        let config = Arc::new(config);
        let storage = Arc::new(Storage::open(&config)?);
        let bus = Arc::new(EventBus::new());

        let scopes = Arc::new(ScopeResolver::new(storage.clone()));
        let entries = Arc::new(EntriesRepo::new(storage.clone(), bus.clone()));
        let evidence = Arc::new(EvidenceRepo::new(storage.clone()));
        let relations = Arc::new(RelationRepo::new(storage.clone()));
        let tags = Arc::new(TagRepo::new(storage.clone()));
        let graph = Arc::new(GraphRepo::new(storage.clone(), bus.clone()));
        let locks = Arc::new(LockRepo::new(storage.clone(), bus.clone()));
        let audit = Arc::new(AuditRepo::new(storage.clone()));
        let embeddings = Arc::new(EmbeddingStore::new(
            storage.clone(),
            config.embedding_dimensions,
        ));

        let query_cache = Arc::new(QueryCache::new(
            bus.clone(),
            Duration::from_millis(config.query_ttl_ms),
            config.query_cache_max_entries,
        ));
        let priority_cache = Arc::new(PriorityCache::new(
            Duration::from_millis(config.query_ttl_ms),
            config.query_cache_max_entries * 16,
        ));
        // Feedback wipes memoized composite scores.
        {
            let priority_cache = priority_cache.clone();
            bus.subscribe("priority-cache", move |event| {
                if matches!(event, MemoryEvent::FeedbackRecorded { .. }) {
                    priority_cache.invalidate_all();
                }
            });
        }

        let query = Arc::new(QueryEngine::new(
            config.clone(),
            storage.clone(),
            scopes.clone(),
            entries.clone(),
            relations.clone(),
            tags.clone(),
            embeddings.clone(),
            None,
            query_cache.clone(),
            priority_cache.clone(),
        ));
        let librarian = Arc::new(Librarian::new(
            storage.clone(),
            entries.clone(),
            embeddings.clone(),
            bus.clone(),
        ));
        let exporter = Arc::new(Exporter::new(
            entries.clone(),
            relations.clone(),
            tags.clone(),
        ));

        info!(db = %storage.path().display(), "engram context ready");
        Ok(Self {
            config,
            storage,
            bus,
            scopes,
            entries,
            evidence,
            relations,
            tags,
            graph,
            locks,
            audit,
            embeddings,
            query,
            query_cache,
            priority_cache,
            librarian,
            exporter,
        })
    }

    /// Attach an embedder, wire the bounded regeneration queue, and spawn the
    /// worker. With `embedder = None`, builds one from config when an
    /// endpoint is set; otherwise this is a no-op and semantic search stays
    /// degraded.
    pub fn start_embedding(&mut self, embedder: Option<Arc<dyn Embedder>>) {
        let embedder = embedder.or_else(|| {
            HttpEmbedder::from_config(&self.config).map(|e| Arc::new(e) as Arc<dyn Embedder>)
        });
        let Some(embedder) = embedder else {
            info!("no embedder configured; semantic search disabled");
            return;
        };

        let (tx, rx) = tokio::sync::mpsc::channel(self.config.embed_queue_capacity);
        self.entries.set_embed_sender(tx.clone());
        self.librarian.set_embed_sender(tx);
        spawn_regen_worker(self.embeddings.clone(), embedder.clone(), rx);

        self.query = Arc::new(QueryEngine::new(
            self.config.clone(),
            self.storage.clone(),
            self.scopes.clone(),
            self.entries.clone(),
            self.relations.clone(),
            self.tags.clone(),
            self.embeddings.clone(),
            Some(embedder),
            self.query_cache.clone(),
            self.priority_cache.clone(),
        ));
    }

    /// Mint an admin token for gated operations.
    pub fn authorize_admin(&self, presented_key: Option<&str>) -> CoreResult<AdminToken> {
        self.config.authorize_admin(presented_key)
    }

    /// Record how a past query worked out; feeds the context-similarity
    /// boost.
    pub fn record_query_feedback(
        &self,
        query_text: &str,
        query_vector: Option<&[f32]>,
        top_entry_ids: &[String],
        success: bool,
    ) -> CoreResult<()> {
        crate::query::rank::record_query_feedback(
            &self.storage,
            query_text,
            query_vector,
            top_entry_ids,
            success,
        )
    }

    pub fn health(&self) -> CoreResult<HealthReport> {
        Ok(HealthReport {
            migrations: self.storage.migration_status()?,
            entry_counts: self
                .entries
                .counts()?
                .into_iter()
                .map(|(k, n)| (k.to_string(), n))
                .collect(),
            embedding_coverage: self.embeddings.coverage()?,
            query_cache: self.query_cache.stats(),
            audit_rows: self.audit.count()?,
            semantic_enabled: self.config.semantic_enabled(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_wires_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngramConfig {
            database_path: dir.path().join("engram.sqlite"),
            ..Default::default()
        };
        let ctx = EngramContext::open(config).unwrap();
        let health = ctx.health().unwrap();
        assert_eq!(health.migrations.pending, 0);
        assert!(!health.semantic_enabled);
    }
}
