//! Embedding store and regeneration queue.
//!
//! Vectors are stored unit-length as little-endian f32 blobs keyed by
//! `(entry_type, entry_id)`, so cosine similarity is a dot product at query
//! time. The [`Embedder`] trait is the seam to the external provider; when
//! it is down, callers degrade to the remaining signals instead of failing.

use crate::error::{CoreError, CoreResult};
use crate::model::{fmt_ts, now, EntryKind};
use crate::storage::Storage;
use async_trait::async_trait;
use rusqlite::params;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EMBED_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const EMBED_RETRY_ATTEMPTS: u32 = 3;
const EMBED_RETRY_BASE_MS: u64 = 250;

/// Maps text to a fixed-dimension vector. Implementations must be safe to
/// share across tasks.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;
}

/// Remote embedder speaking the OpenAI-compatible `/embeddings` shape.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(url: String, model: String, api_key: Option<String>, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            model,
            api_key,
            dimensions,
        }
    }

    /// Build from config; `None` when no endpoint is configured.
    pub fn from_config(config: &crate::config::EngramConfig) -> Option<Self> {
        let url = config.embedding_url.clone()?;
        Some(Self::new(
            url,
            config
                .embedding_model
                .clone()
                .unwrap_or_else(|| "all-MiniLM-L6-v2".to_string()),
            config.embedding_api_key.clone(),
            config.embedding_dimensions,
        ))
    }
}

#[derive(serde::Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(serde::Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "model": self.model,
            "input": [text],
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = tokio::time::timeout(EMBED_CALL_TIMEOUT, request.send())
            .await
            .map_err(|_| CoreError::EmbedderUnavailable("embedding request timed out".into()))?
            .map_err(|e| CoreError::EmbedderUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::EmbedderUnavailable(format!(
                "embedding provider returned {}",
                response.status()
            )));
        }
        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CoreError::EmbedderUnavailable(format!("bad embedding payload: {e}")))?;
        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CoreError::EmbedderUnavailable("empty embedding payload".into()))?;
        if vector.len() != self.dimensions {
            return Err(CoreError::InvalidParameter {
                name: "embedding".into(),
                reason: format!("expected {} dimensions, got {}", self.dimensions, vector.len()),
            });
        }
        Ok(vector)
    }
}

/// One queued regeneration request.
#[derive(Debug, Clone)]
pub struct EmbedJob {
    pub kind: EntryKind,
    pub entry_id: String,
    pub text: String,
}

/// A semantic hit from [`EmbeddingStore::top_k`].
#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub kind: EntryKind,
    pub entry_id: String,
    pub similarity: f32,
}

/// Persistent vector store over the `embeddings` table.
pub struct EmbeddingStore {
    storage: Arc<Storage>,
    expected_dims: usize,
}

impl EmbeddingStore {
    pub fn new(storage: Arc<Storage>, expected_dims: usize) -> Self {
        Self {
            storage,
            expected_dims,
        }
    }

    /// Store a vector, normalized to unit length. Dimension mismatches are
    /// rejected so one misconfigured provider cannot poison the table.
    pub fn put(&self, kind: EntryKind, entry_id: &str, vector: &[f32], model: &str) -> CoreResult<()> {
        if vector.len() != self.expected_dims {
            return Err(CoreError::InvalidParameter {
                name: "vector".into(),
                reason: format!(
                    "expected {} dimensions, got {}",
                    self.expected_dims,
                    vector.len()
                ),
            });
        }
        let unit = normalize(vector).ok_or_else(|| CoreError::InvalidParameter {
            name: "vector".into(),
            reason: "zero-length vector".into(),
        })?;
        self.storage.write_tx(|tx| {
            tx.execute(
                "INSERT INTO embeddings (entry_type, entry_id, vector, model, dims, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (entry_type, entry_id)
                 DO UPDATE SET vector = ?3, model = ?4, dims = ?5, updated_at = ?6",
                params![
                    kind.as_str(),
                    entry_id,
                    encode(&unit),
                    model,
                    unit.len() as i64,
                    fmt_ts(now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, kind: EntryKind, entry_id: &str) -> CoreResult<Option<Vec<f32>>> {
        self.storage.with_reader(|conn| {
            use rusqlite::OptionalExtension;
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT vector FROM embeddings WHERE entry_type = ?1 AND entry_id = ?2",
                    params![kind.as_str(), entry_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(blob.map(|b| decode(&b)))
        })
    }

    pub fn remove(&self, kind: EntryKind, entry_id: &str) -> CoreResult<()> {
        self.storage.write_tx(|tx| {
            tx.execute(
                "DELETE FROM embeddings WHERE entry_type = ?1 AND entry_id = ?2",
                params![kind.as_str(), entry_id],
            )?;
            Ok(())
        })
    }

    /// Brute-force cosine scan over the requested kinds: entries with
    /// similarity >= `threshold`, best first, at most `k`.
    pub fn top_k(
        &self,
        query: &[f32],
        kinds: &[EntryKind],
        k: usize,
        threshold: f32,
    ) -> CoreResult<Vec<SemanticHit>> {
        let Some(query) = normalize(query) else {
            return Ok(Vec::new());
        };
        let kind_list = kinds
            .iter()
            .map(|kind| format!("'{}'", kind.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let mut hits = self.storage.with_reader(|conn| {
            let sql = format!(
                "SELECT entry_type, entry_id, vector FROM embeddings WHERE entry_type IN ({kind_list})"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                ))
            })?;
            let mut hits = Vec::new();
            for row in rows {
                let (kind, entry_id, blob) = row?;
                let Ok(kind) = EntryKind::from_str(&kind) else {
                    continue;
                };
                let vector = decode(&blob);
                if vector.len() != query.len() {
                    continue;
                }
                let similarity = dot(&query, &vector);
                if similarity >= threshold {
                    hits.push(SemanticHit {
                        kind,
                        entry_id,
                        similarity,
                    });
                }
            }
            Ok(hits)
        })?;
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// `(embedded, total_active)` across entry kinds, for backfill status.
    pub fn coverage(&self) -> CoreResult<(i64, i64)> {
        self.storage.with_reader(|conn| {
            let embedded: i64 =
                conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE is_active = 1",
                [],
                |r| r.get(0),
            )?;
            Ok((embedded, total))
        })
    }

    /// Active entries without a stored vector, for backfill.
    pub fn missing(&self, limit: usize) -> CoreResult<Vec<(EntryKind, String)>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT e.kind, e.id FROM entries e
                 LEFT JOIN embeddings em ON em.entry_type = e.kind AND em.entry_id = e.id
                 WHERE e.is_active = 1 AND em.entry_id IS NULL
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (kind, id) = row?;
                if let Ok(kind) = EntryKind::from_str(&kind) {
                    out.push((kind, id));
                }
            }
            Ok(out)
        })
    }
}

/// Spawn the regeneration worker: drains the queue, embeds with bounded
/// retries and jitter, and writes vectors. Failures are logged and dropped;
/// they never block or fail the originating write.
pub fn spawn_regen_worker(
    store: Arc<EmbeddingStore>,
    embedder: Arc<dyn Embedder>,
    mut rx: mpsc::Receiver<EmbedJob>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(model = embedder.model_id(), "embedding worker started");
        while let Some(job) = rx.recv().await {
            let mut attempt = 0u32;
            loop {
                match embedder.embed(&job.text).await {
                    Ok(vector) => {
                        if let Err(e) =
                            store.put(job.kind, &job.entry_id, &vector, embedder.model_id())
                        {
                            warn!(entry_id = %job.entry_id, "embedding store write failed: {e}");
                        } else {
                            debug!(entry_id = %job.entry_id, "embedding refreshed");
                        }
                        break;
                    }
                    Err(e) if attempt + 1 < EMBED_RETRY_ATTEMPTS => {
                        attempt += 1;
                        let base = EMBED_RETRY_BASE_MS.saturating_mul(1 << attempt);
                        let jitter =
                            (uuid::Uuid::new_v4().as_u128() % (EMBED_RETRY_BASE_MS as u128)) as u64;
                        warn!(entry_id = %job.entry_id, attempt, "embed failed, retrying: {e}");
                        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                    }
                    Err(e) => {
                        warn!(entry_id = %job.entry_id, "embedding dropped after retries: {e}");
                        break;
                    }
                }
            }
        }
        info!("embedding worker stopped");
    })
}

fn normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn encode(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for x in vector {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn decode(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(dims: usize) -> (tempfile::TempDir, EmbeddingStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        (dir, EmbeddingStore::new(storage, dims))
    }

    #[test]
    fn test_vectors_are_stored_unit_length() {
        let (_dir, store) = setup(3);
        store
            .put(EntryKind::Knowledge, "e1", &[3.0, 0.0, 4.0], "test-model")
            .unwrap();
        let v = store.get(EntryKind::Knowledge, "e1").unwrap().unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let (_dir, store) = setup(3);
        assert!(store
            .put(EntryKind::Knowledge, "e1", &[1.0, 0.0], "test-model")
            .is_err());
        assert!(store
            .put(EntryKind::Knowledge, "e1", &[0.0, 0.0, 0.0], "test-model")
            .is_err());
    }

    #[test]
    fn test_top_k_orders_by_similarity_and_applies_threshold() {
        let (_dir, store) = setup(2);
        store.put(EntryKind::Knowledge, "close", &[1.0, 0.1], "m").unwrap();
        store.put(EntryKind::Knowledge, "far", &[0.0, 1.0], "m").unwrap();
        store.put(EntryKind::Tool, "tool", &[1.0, 0.0], "m").unwrap();

        let hits = store
            .top_k(&[1.0, 0.0], &[EntryKind::Knowledge], 10, 0.5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, "close");

        let all_kinds = store
            .top_k(&[1.0, 0.0], &[EntryKind::Knowledge, EntryKind::Tool], 10, 0.5)
            .unwrap();
        assert_eq!(all_kinds.len(), 2);
        assert_eq!(all_kinds[0].entry_id, "tool");
    }

    #[test]
    fn test_roundtrip_encoding() {
        let v = vec![0.25f32, -1.5, 3.25];
        assert_eq!(decode(&encode(&v)), v);
    }

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_id(&self) -> &str {
            "fixed"
        }
        fn dimensions(&self) -> usize {
            self.0.len()
        }
        async fn embed(&self, _text: &str) -> CoreResult<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let (_dir, store) = setup(2);
        let store = Arc::new(store);
        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_regen_worker(store.clone(), Arc::new(FixedEmbedder(vec![1.0, 0.0])), rx);

        tx.send(EmbedJob {
            kind: EntryKind::Knowledge,
            entry_id: "e1".into(),
            text: "some text".into(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(store.get(EntryKind::Knowledge, "e1").unwrap().is_some());
    }
}
