//! The staged query pipeline: `Params -> Context -> Results`.
//!
//! Stages run in order: normalize, resolve the scope chain, derive candidate
//! sets (FTS / fuzzy / regex / entity / semantic / relation), fetch, apply
//! structural filters, score, rank, truncate. Optional signals degrade
//! silently (recorded in `meta.degraded`); scope resolution and fetch
//! failures surface as typed errors.

pub mod cache;
pub mod rank;

pub use cache::{CacheStats, QueryCache};
pub use rank::{PriorityCache, Signals};

use crate::config::EngramConfig;
use crate::error::{CoreError, CoreResult};
use crate::index::embedding::{Embedder, EmbeddingStore};
use crate::index::{entity, fts};
use crate::model::{
    now, Entry, EntryKind, RelationType, ScopeRef, ScopeType,
};
use crate::repo::{EntriesRepo, EntryFilter, RelationRepo, TagRepo};
use crate::scope::{ResolvedScope, ScopeResolver};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const FTS_CANDIDATE_LIMIT: usize = 256;
const SEMANTIC_CANDIDATE_LIMIT: usize = 128;

/// What the caller is doing; `context` pulls ranked working context,
/// `search` is an explicit lookup. Both run the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryAction {
    Context,
    Search,
}

/// Scope selector for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeParam {
    #[serde(rename = "type")]
    pub scope_type: ScopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit: Option<bool>,
}

/// Tag filters: any-of, all-of, none-of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Relation-graph constraint: keep entries reachable from a start entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RelatedToParam {
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationType>,
    #[serde(default)]
    pub direction: RelationDirection,
    #[serde(default = "default_depth")]
    pub depth: usize,
}

fn default_depth() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationDirection {
    Out,
    In,
    #[default]
    Both,
}

/// Query parameters. Unknown fields are rejected at the parse boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MemoryQueryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<QueryAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<EntryKind>,
    #[serde(default, skip_serializing_if = "TagFilters::is_empty")]
    pub tags: TagFilters,
    #[serde(default = "default_true")]
    pub use_fts5: bool,
    #[serde(default)]
    pub semantic_search: bool,
    #[serde(default)]
    pub fuzzy: bool,
    #[serde(default)]
    pub regex: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_max: Option<i64>,
    /// Critical-only view: raises `priority_min` to the configured
    /// critical threshold.
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_to: Option<RelatedToParam>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub include_inactive: bool,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    20
}

impl Default for MemoryQueryParams {
    fn default() -> Self {
        Self {
            action: None,
            search: None,
            scope: None,
            types: Vec::new(),
            tags: TagFilters::default(),
            use_fts5: true,
            semantic_search: false,
            fuzzy: false,
            regex: false,
            priority_min: None,
            priority_max: None,
            critical: false,
            created_after: None,
            created_before: None,
            at_time: None,
            related_to: None,
            limit: default_limit(),
            fields: None,
            include_inactive: false,
        }
    }
}

impl TagFilters {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.require.is_empty() && self.exclude.is_empty()
    }
}

/// One scored result.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    #[serde(flatten)]
    pub entry: Entry,
    pub score: f32,
    pub signals: Signals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Result metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    pub total_count: usize,
    pub returned_count: usize,
    pub truncated: bool,
    pub has_more: bool,
    /// Optional signals that failed and were skipped (e.g. "semantic").
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResults {
    pub items: Vec<QueryHit>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default)]
struct Candidate {
    fts_rank: Option<f64>,
    snippet: Option<String>,
    fuzzy: bool,
    regex: bool,
    entity_count: u32,
    semantic: Option<f32>,
}

/// The staged query engine.
pub struct QueryEngine {
    config: Arc<EngramConfig>,
    storage: Arc<Storage>,
    scopes: Arc<ScopeResolver>,
    entries: Arc<EntriesRepo>,
    relations: Arc<RelationRepo>,
    tags: Arc<TagRepo>,
    embeddings: Arc<EmbeddingStore>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Arc<QueryCache>,
    priority_cache: Arc<PriorityCache>,
}

impl QueryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngramConfig>,
        storage: Arc<Storage>,
        scopes: Arc<ScopeResolver>,
        entries: Arc<EntriesRepo>,
        relations: Arc<RelationRepo>,
        tags: Arc<TagRepo>,
        embeddings: Arc<EmbeddingStore>,
        embedder: Option<Arc<dyn Embedder>>,
        cache: Arc<QueryCache>,
        priority_cache: Arc<PriorityCache>,
    ) -> Self {
        Self {
            config,
            storage,
            scopes,
            entries,
            relations,
            tags,
            embeddings,
            embedder,
            cache,
            priority_cache,
        }
    }

    /// Run the pipeline. `deadline` bounds the whole call; expiry rolls the
    /// operation back to a typed error between stages.
    pub async fn execute(
        &self,
        params: &MemoryQueryParams,
        deadline: Option<Instant>,
    ) -> CoreResult<QueryResults> {
        // Stage 1: normalize and validate.
        let params = self.normalize(params)?;
        if params.limit == 0 {
            return Ok(QueryResults {
                items: Vec::new(),
                meta: QueryMeta {
                    total_count: 0,
                    returned_count: 0,
                    truncated: false,
                    has_more: false,
                    degraded: Vec::new(),
                    cache_hit: false,
                },
            });
        }

        let cache_key = serde_json::to_string(&params)?;
        if let Some(mut cached) = self.cache.get(&cache_key) {
            cached.meta.cache_hit = true;
            return Ok(cached);
        }
        check_deadline(deadline, "candidate collection")?;

        // Stage 2: resolve the scope chain.
        let (leaf, inherit) = match &params.scope {
            Some(s) => (
                ScopeRef {
                    scope_type: s.scope_type,
                    scope_id: s.id.clone(),
                },
                s.inherit.unwrap_or(true),
            ),
            None => (ScopeRef::global(), true),
        };
        let chain = self.scopes.resolve(&leaf, inherit)?;

        let kinds = if params.types.is_empty() {
            EntryKind::all().to_vec()
        } else {
            params.types.clone()
        };
        let mut degraded = Vec::new();

        // Stage 3: derive candidate sets.
        let mut query_vector: Option<Vec<f32>> = None;
        let has_constraints =
            params.search.is_some() || params.semantic_search || params.related_to.is_some();
        let mut candidates: HashMap<(EntryKind, String), Candidate> = HashMap::new();

        if let Some(text) = params.search.as_deref() {
            if params.use_fts5 {
                let fields = params.fields.clone();
                match self.storage.with_reader(|conn| {
                    fts::search(conn, text, &kinds, fields.as_deref(), FTS_CANDIDATE_LIMIT, true)
                }) {
                    Ok(hits) => {
                        for hit in hits {
                            let c = candidates.entry((hit.kind, hit.entry_id)).or_default();
                            c.fts_rank = Some(hit.rank);
                            c.snippet = hit.snippet;
                        }
                    }
                    Err(e) => {
                        warn!("full-text stage degraded: {e}");
                        degraded.push("fts".to_string());
                    }
                }
            }

            if params.fuzzy || params.regex {
                let scoped = self.list_scoped(&params, &chain, &kinds, false)?;
                let matcher = if params.regex {
                    Some(regex::Regex::new(text).map_err(|e| CoreError::InvalidParameter {
                        name: "search".into(),
                        reason: format!("invalid regex: {e}"),
                    })?)
                } else {
                    None
                };
                for entry in scoped {
                    let body = entry.searchable_text();
                    if params.fuzzy && fuzzy_matches(text, &body) {
                        candidates
                            .entry((entry.kind, entry.id.clone()))
                            .or_default()
                            .fuzzy = true;
                    }
                    if let Some(re) = &matcher {
                        if re.is_match(&body) {
                            candidates
                                .entry((entry.kind, entry.id.clone()))
                                .or_default()
                                .regex = true;
                        }
                    }
                }
            }

            let mentioned = entity::extract_entities(text);
            if !mentioned.is_empty() {
                match self
                    .storage
                    .with_reader(|conn| entity::lookup_multiple(conn, &mentioned))
                {
                    Ok(counts) => {
                        for ((kind, id), count) in counts {
                            if kinds.contains(&kind) {
                                candidates.entry((kind, id)).or_default().entity_count = count;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("entity stage degraded: {e}");
                        degraded.push("entity".to_string());
                    }
                }
            }
        }

        check_deadline(deadline, "semantic collection")?;
        if params.semantic_search {
            match &self.embedder {
                Some(embedder) => {
                    let text = params.search.clone().unwrap_or_default();
                    if text.trim().is_empty() {
                        degraded.push("semantic".to_string());
                    } else {
                        match embedder.embed(&text).await {
                            Ok(vector) => {
                                match self.embeddings.top_k(
                                    &vector,
                                    &kinds,
                                    SEMANTIC_CANDIDATE_LIMIT,
                                    self.config.semantic_threshold,
                                ) {
                                    Ok(hits) => {
                                        for hit in hits {
                                            candidates
                                                .entry((hit.kind, hit.entry_id))
                                                .or_default()
                                                .semantic = Some(hit.similarity);
                                        }
                                    }
                                    Err(e) => {
                                        warn!("semantic lookup degraded: {e}");
                                        degraded.push("semantic".to_string());
                                    }
                                }
                                query_vector = Some(vector);
                            }
                            Err(e) => {
                                warn!("embedder unavailable, semantic stage skipped: {e}");
                                degraded.push("semantic".to_string());
                            }
                        }
                    }
                }
                None => degraded.push("semantic".to_string()),
            }
        }

        if let Some(related) = &params.related_to {
            for (kind, id) in self.traverse_relations(related)? {
                if kinds.contains(&kind) {
                    candidates.entry((kind, id)).or_default();
                }
            }
        }

        check_deadline(deadline, "fetch")?;

        // Stage 4+5: fetch the candidate union and apply structural filters.
        let scope_keys: HashSet<(ScopeType, String)> = chain
            .iter()
            .map(|s| (s.scope.scope_type, s.scope.id_key().to_string()))
            .collect();
        let entries: Vec<Entry> = if has_constraints {
            let ids: Vec<(EntryKind, String)> = candidates
                .keys()
                .filter(|(k, _)| kinds.contains(k))
                .cloned()
                .collect();
            let fetched = self.entries.get_batch(&ids)?;
            fetched
                .into_iter()
                .filter(|e| params.include_inactive || e.is_active)
                .filter(|e| scope_keys.contains(&(e.scope.scope_type, e.scope.id_key().to_string())))
                .filter(|e| self.structural_filter(&params, e))
                .collect()
        } else {
            self.list_scoped(&params, &chain, &kinds, true)?
        };

        // Tag filters for the candidate path (the list path already filtered
        // in SQL).
        let entries: Vec<(Entry, Vec<String>)> = {
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries {
                let tags = self.tags.tags_of(entry.kind, &entry.id)?;
                if has_constraints && !tag_filter_passes(&params.tags, &tags) {
                    continue;
                }
                kept.push((entry, tags));
            }
            kept
        };

        check_deadline(deadline, "ranking")?;

        // Stage 6: score and rank.
        let candidate_ids: HashSet<String> =
            entries.iter().map(|(e, _)| e.id.clone()).collect();
        let (boost, boosted_ids) = rank::context_boost(
            &self.storage,
            query_vector.as_deref(),
            &candidate_ids,
            self.config.semantic_threshold,
            self.config.context_boost_cap,
        )
        .unwrap_or_else(|e| {
            warn!("context boost degraded: {e}");
            (1.0, HashSet::new())
        });

        let max_bm25 = candidates
            .values()
            .filter_map(|c| c.fts_rank)
            .map(f64::abs)
            .fold(0.0f64, f64::max);
        let query_hash = hash_key(&cache_key);
        let at = now();

        let mut hits: Vec<(QueryHit, usize)> = Vec::with_capacity(entries.len());
        for (entry, tags) in entries {
            let candidate = candidates
                .get(&(entry.kind, entry.id.clone()))
                .cloned()
                .unwrap_or_default();
            let signals = self.signals_for(&entry, &candidate, max_bm25, at, boost, &boosted_ids)?;
            let score = match self.priority_cache.get(&entry.id, query_hash) {
                Some(score) => score,
                None => {
                    let score = rank::composite(
                        &signals,
                        &self.config.rank_weights,
                        self.config.context_boost_cap,
                    );
                    self.priority_cache.put(&entry.id, query_hash, score);
                    score
                }
            };
            let specificity = chain
                .iter()
                .position(|s| {
                    s.scope.scope_type == entry.scope.scope_type
                        && s.scope.id_key() == entry.scope.id_key()
                })
                .unwrap_or(usize::MAX);
            hits.push((
                QueryHit {
                    entry,
                    score,
                    signals,
                    snippet: candidate.snippet,
                    tags,
                },
                specificity,
            ));
        }

        hits.sort_by(|(a, sa), (b, sb)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| sa.cmp(sb))
                .then_with(|| b.entry.priority.cmp(&a.entry.priority))
                .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });

        // Stage 7: truncate.
        let total_count = hits.len();
        let items: Vec<QueryHit> = hits
            .into_iter()
            .take(params.limit)
            .map(|(hit, _)| hit)
            .collect();
        let returned_count = items.len();
        let truncated = returned_count < total_count;

        let results = QueryResults {
            items,
            meta: QueryMeta {
                total_count,
                returned_count,
                truncated,
                has_more: truncated,
                degraded,
                cache_hit: false,
            },
        };
        self.cache.put(cache_key, results.clone());
        debug!(total_count, returned_count, "query executed");
        Ok(results)
    }

    fn normalize(&self, params: &MemoryQueryParams) -> CoreResult<MemoryQueryParams> {
        let mut out = params.clone();
        if let Some(scope) = &out.scope {
            if scope.scope_type != ScopeType::Global
                && scope.id.as_deref().map_or(true, |s| s.trim().is_empty())
            {
                return Err(CoreError::MissingField("scope.id".into()));
            }
            if scope.scope_type == ScopeType::Global && scope.id.is_some() {
                return Err(CoreError::InvalidParameter {
                    name: "scope.id".into(),
                    reason: "global scope takes no scope id".into(),
                });
            }
        }
        out.limit = out.limit.min(self.config.max_query_limit);
        if out.critical {
            let threshold = self.config.critical_priority_threshold;
            out.priority_min = Some(out.priority_min.map_or(threshold, |p| p.max(threshold)));
        }
        if let Some(fields) = &out.fields {
            for field in fields {
                if !fts::SEARCHABLE_FIELDS.contains(&field.as_str()) {
                    return Err(CoreError::InvalidParameter {
                        name: "fields".into(),
                        reason: format!("unknown field {field:?}"),
                    });
                }
            }
        }
        if let Some(related) = &mut out.related_to {
            if related.depth == 0 {
                related.depth = 1;
            }
            related.depth = related.depth.min(8);
        }
        out.tags.include = normalize_tags(&out.tags.include);
        out.tags.require = normalize_tags(&out.tags.require);
        out.tags.exclude = normalize_tags(&out.tags.exclude);
        if let Some(search) = &out.search {
            if search.trim().is_empty() {
                out.search = None;
            }
        }
        Ok(out)
    }

    /// Structural filters shared by the candidate path (the list path pushes
    /// them into SQL instead).
    fn structural_filter(&self, params: &MemoryQueryParams, entry: &Entry) -> bool {
        if let Some(min) = params.priority_min {
            if entry.priority < min {
                return false;
            }
        }
        if let Some(max) = params.priority_max {
            if entry.priority > max {
                return false;
            }
        }
        if let Some(after) = params.created_after {
            if entry.created_at < after {
                return false;
            }
        }
        if let Some(before) = params.created_before {
            if entry.created_at >= before {
                return false;
            }
        }
        if let Some(at) = params.at_time {
            if entry.kind == EntryKind::Knowledge {
                if let Some(from) = entry.current.valid_from {
                    if from > at {
                        return false;
                    }
                }
                if let Some(until) = entry.current.valid_until {
                    if until <= at {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn list_scoped(
        &self,
        params: &MemoryQueryParams,
        chain: &[ResolvedScope],
        kinds: &[EntryKind],
        apply_filters: bool,
    ) -> CoreResult<Vec<Entry>> {
        let mut filter = EntryFilter {
            kinds: kinds.to_vec(),
            scopes: chain.iter().map(|s| s.scope.clone()).collect(),
            include_inactive: params.include_inactive,
            ..Default::default()
        };
        if apply_filters {
            filter.priority_min = params.priority_min;
            filter.priority_max = params.priority_max;
            filter.created_after = params.created_after;
            filter.created_before = params.created_before;
            filter.at_time = params.at_time;
            filter.tags_include = params.tags.include.clone();
            filter.tags_require = params.tags.require.clone();
            filter.tags_exclude = params.tags.exclude.clone();
        }
        self.entries.list(&filter)
    }

    fn traverse_relations(&self, related: &RelatedToParam) -> CoreResult<Vec<(EntryKind, String)>> {
        let start = (related.entry_type, related.id.clone());
        let mut visited: HashSet<(EntryKind, String)> = HashSet::from([start.clone()]);
        let mut frontier = VecDeque::from([(start, 0usize)]);
        let mut reached = Vec::new();
        while let Some(((kind, id), dist)) = frontier.pop_front() {
            if dist >= related.depth {
                continue;
            }
            let mut next = Vec::new();
            if matches!(related.direction, RelationDirection::Out | RelationDirection::Both) {
                next.extend(self.relations.neighbors(kind, &id, related.relation, true)?);
            }
            if matches!(related.direction, RelationDirection::In | RelationDirection::Both) {
                next.extend(self.relations.neighbors(kind, &id, related.relation, false)?);
            }
            for n in next {
                if visited.insert(n.clone()) {
                    reached.push(n.clone());
                    frontier.push_back((n, dist + 1));
                }
            }
        }
        Ok(reached)
    }

    fn signals_for(
        &self,
        entry: &Entry,
        candidate: &Candidate,
        max_bm25: f64,
        at: DateTime<Utc>,
        boost: f32,
        boosted_ids: &HashSet<String>,
    ) -> CoreResult<Signals> {
        let mut textual: f32 = match candidate.fts_rank {
            Some(rank) if max_bm25 > f64::EPSILON => (rank.abs() / max_bm25) as f32,
            Some(_) => 1.0,
            None if candidate.regex => 0.6,
            None if candidate.fuzzy => 0.45,
            None => 0.0,
        };
        textual = (textual + 0.15 * candidate.entity_count.min(2) as f32).min(1.0);

        let (successes, uses) = self.entries.outcome_stats(&entry.id)?;
        Ok(Signals {
            textual,
            semantic: candidate.semantic.unwrap_or(0.0),
            priority: rank::priority_score(entry.kind, entry.priority),
            recency: rank::recency_score(entry.updated_at, self.config.recency_half_life_days, at),
            usefulness: rank::usefulness_score(successes, uses),
            context_boost: if boosted_ids.contains(&entry.id) { boost } else { 1.0 },
        })
    }
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn tag_filter_passes(filters: &TagFilters, tags: &[String]) -> bool {
    let set: HashSet<&str> = tags.iter().map(String::as_str).collect();
    if !filters.include.is_empty() && !filters.include.iter().any(|t| set.contains(t.as_str())) {
        return false;
    }
    if !filters.require.iter().all(|t| set.contains(t.as_str())) {
        return false;
    }
    if filters.exclude.iter().any(|t| set.contains(t.as_str())) {
        return false;
    }
    true
}

/// All query tokens must land within edit distance 1 of some body token.
/// Damerau distance, so a transposed pair counts as one typo.
fn fuzzy_matches(query: &str, body: &str) -> bool {
    let body_tokens: Vec<String> = body
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    if body_tokens.is_empty() {
        return false;
    }
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .all(|q| {
            body_tokens.iter().any(|b| {
                if q == *b {
                    return true;
                }
                if q.len().abs_diff(b.len()) > 1 {
                    return false;
                }
                strsim::damerau_levenshtein(&q, b) <= 1
            })
        })
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn check_deadline(deadline: Option<Instant>, stage: &str) -> CoreResult<()> {
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            return Err(CoreError::DeadlineExceeded(stage.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuzzy_matches_one_typo() {
        assert!(fuzzy_matches("postgers", "We chose PostgreSQL postgres for storage"));
        assert!(fuzzy_matches("benchmark", "benchmarks and baselines"));
        assert!(!fuzzy_matches("kubernetes", "We chose postgres for storage"));
    }

    #[test]
    fn test_tag_filter_logic() {
        let tags = vec!["db".to_string(), "perf".to_string()];
        let any = TagFilters {
            include: vec!["db".into(), "web".into()],
            ..Default::default()
        };
        assert!(tag_filter_passes(&any, &tags));

        let all = TagFilters {
            require: vec!["db".into(), "web".into()],
            ..Default::default()
        };
        assert!(!tag_filter_passes(&all, &tags));

        let none = TagFilters {
            exclude: vec!["perf".into()],
            ..Default::default()
        };
        assert!(!tag_filter_passes(&none, &tags));
    }

    #[test]
    fn test_params_reject_unknown_fields() {
        let raw = serde_json::json!({ "search": "x", "unknownFlag": true });
        assert!(serde_json::from_value::<MemoryQueryParams>(raw).is_err());
    }

    #[test]
    fn test_params_defaults() {
        let params: MemoryQueryParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(params.limit, 20);
        assert!(params.use_fts5);
        assert!(!params.semantic_search);
    }
}
