//! Ranking signals and the composite priority score.
//!
//! Each signal is normalized to [0,1] before weighting; the composite is the
//! weighted mean, multiplied by the context-similarity boost (capped). A
//! small memo cache keyed by `(entry_id, query_hash)` avoids recomputing
//! scores inside one epoch; any feedback event clears it wholesale.

use crate::config::RankWeights;
use crate::error::CoreResult;
use crate::model::{fmt_ts, new_id, now, EntryKind};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::params;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// The individual signals feeding an entry's composite score.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Signals {
    pub textual: f32,
    pub semantic: f32,
    pub priority: f32,
    pub recency: f32,
    pub usefulness: f32,
    #[serde(rename = "contextBoost")]
    pub context_boost: f32,
}

/// Half-life decay on the update timestamp.
pub fn recency_score(updated_at: DateTime<Utc>, half_life_days: f64, at: DateTime<Utc>) -> f32 {
    let age_days = (at - updated_at).num_seconds().max(0) as f64 / 86_400.0;
    (0.5f64.powf(age_days / half_life_days.max(0.01))) as f32
}

/// Laplace-smoothed success rate: `(successes + 1) / (uses + 2)`.
pub fn usefulness_score(successes: u32, uses: u32) -> f32 {
    (successes as f32 + 1.0) / (uses as f32 + 2.0)
}

/// Priority signal: guidelines scale their 0..=100 priority; other kinds sit
/// at the neutral midpoint.
pub fn priority_score(kind: EntryKind, priority: i64) -> f32 {
    match kind {
        EntryKind::Guideline => (priority as f32 / 100.0).clamp(0.0, 1.0),
        _ => 0.5,
    }
}

/// Weighted combination of the signals, scaled by the context boost.
pub fn composite(signals: &Signals, weights: &RankWeights, boost_cap: f32) -> f32 {
    let total = weights.textual + weights.semantic + weights.priority + weights.recency
        + weights.usefulness;
    if total <= f32::EPSILON {
        return 0.0;
    }
    let base = (weights.textual * signals.textual
        + weights.semantic * signals.semantic
        + weights.priority * signals.priority
        + weights.recency * signals.recency
        + weights.usefulness * signals.usefulness)
        / total;
    let boost = signals.context_boost.clamp(1.0, boost_cap.max(1.0));
    (base * boost).clamp(0.0, boost_cap.max(1.0))
}

// ---------------------------------------------------------------------------
// Query feedback and the context-similarity boost
// ---------------------------------------------------------------------------

const CONTEXT_LOOKBACK_ROWS: usize = 50;

/// Record the outcome of a past query so later similar queries can boost the
/// entries that worked.
pub fn record_query_feedback(
    storage: &Storage,
    query_text: &str,
    query_vector: Option<&[f32]>,
    top_entry_ids: &[String],
    success: bool,
) -> CoreResult<()> {
    storage.write_tx(|tx| {
        let id = new_id();
        tx.execute(
            "INSERT INTO query_feedback (id, query_text, query_vector, top_entry_ids, outcome, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                query_text,
                query_vector.map(encode_vec),
                serde_json::to_string(top_entry_ids)?,
                if success { "success" } else { "failure" },
                fmt_ts(now()),
            ],
        )?;
        crate::repo::audit::append_tx(
            tx,
            "system",
            "feedback_recorded",
            Some(("query_feedback", &id)),
            None,
            Some(serde_json::json!({ "success": success })),
        )?;
        Ok(())
    })
}

/// Boost from past successful queries whose embedding is close to the
/// current one. Returns the multiplier (capped at `cap`) and the candidate
/// ids that earned it, meaning entries that topped those past queries. Entries
/// outside the set keep a neutral 1.0.
pub fn context_boost(
    storage: &Storage,
    query_vector: Option<&[f32]>,
    candidates: &HashSet<String>,
    threshold: f32,
    cap: f32,
) -> CoreResult<(f32, HashSet<String>)> {
    let Some(query_vector) = query_vector else {
        return Ok((1.0, HashSet::new()));
    };
    if candidates.is_empty() {
        return Ok((1.0, HashSet::new()));
    }
    let rows: Vec<(Vec<u8>, String)> = storage.with_reader(|conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT query_vector, top_entry_ids FROM query_feedback
             WHERE outcome = 'success' AND query_vector IS NOT NULL
             ORDER BY recorded_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![CONTEXT_LOOKBACK_ROWS as i64], |r| {
            Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })?;

    let mut best_overlap = 0.0f32;
    let mut boosted = HashSet::new();
    for (blob, top_ids) in rows {
        let past = decode_vec(&blob);
        if past.len() != query_vector.len() {
            continue;
        }
        let similarity: f32 = past.iter().zip(query_vector).map(|(a, b)| a * b).sum();
        if similarity < threshold {
            continue;
        }
        let top: Vec<String> = serde_json::from_str(&top_ids).unwrap_or_default();
        if top.is_empty() {
            continue;
        }
        let shared: Vec<&String> = top.iter().filter(|id| candidates.contains(*id)).collect();
        let overlap = shared.len() as f32 / top.len() as f32;
        best_overlap = best_overlap.max(overlap);
        boosted.extend(shared.into_iter().cloned());
    }
    let multiplier = (1.0 + best_overlap * (cap.max(1.0) - 1.0)).min(cap.max(1.0));
    Ok((multiplier, boosted))
}

fn encode_vec(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn decode_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Per-entry score memo
// ---------------------------------------------------------------------------

/// LRU-ish TTL memo for composite scores, keyed by `(entry_id, query_hash)`.
/// Feedback events clear it wholesale via [`PriorityCache::invalidate_all`].
pub struct PriorityCache {
    slots: DashMap<(String, u64), (f32, Instant)>,
    ttl: Duration,
    max_entries: usize,
}

impl PriorityCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, entry_id: &str, query_hash: u64) -> Option<f32> {
        let key = (entry_id.to_string(), query_hash);
        let slot = self.slots.get(&key)?;
        if slot.1.elapsed() > self.ttl {
            drop(slot);
            self.slots.remove(&key);
            return None;
        }
        Some(slot.0)
    }

    pub fn put(&self, entry_id: &str, query_hash: u64, score: f32) {
        if self.slots.len() >= self.max_entries {
            if let Some(key) = self.slots.iter().next().map(|s| s.key().clone()) {
                self.slots.remove(&key);
            }
        }
        self.slots
            .insert((entry_id.to_string(), query_hash), (score, Instant::now()));
    }

    pub fn invalidate_all(&self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recency_half_life() {
        let at = now();
        let fresh = recency_score(at, 30.0, at);
        assert!((fresh - 1.0).abs() < 1e-3);
        let half = recency_score(at - chrono::Duration::days(30), 30.0, at);
        assert!((half - 0.5).abs() < 1e-2);
    }

    #[test]
    fn test_usefulness_laplace_smoothing() {
        assert!((usefulness_score(0, 0) - 0.5).abs() < 1e-6);
        assert!((usefulness_score(3, 3) - 0.8).abs() < 1e-6);
        assert!(usefulness_score(0, 10) < 0.1);
    }

    #[test]
    fn test_priority_signal_only_scales_guidelines() {
        assert!((priority_score(EntryKind::Guideline, 95) - 0.95).abs() < 1e-6);
        assert!((priority_score(EntryKind::Knowledge, 95) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_composite_bounded_by_cap() {
        let signals = Signals {
            textual: 1.0,
            semantic: 1.0,
            priority: 1.0,
            recency: 1.0,
            usefulness: 1.0,
            context_boost: 5.0,
        };
        let weights = RankWeights::default();
        let score = composite(&signals, &weights, 1.2);
        assert!(score <= 1.2 + 1e-6);

        let no_boost = Signals {
            context_boost: 1.0,
            ..signals
        };
        assert!((composite(&no_boost, &weights, 1.2) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_priority_cache_roundtrip() {
        let cache = PriorityCache::new(Duration::from_secs(60), 8);
        cache.put("e1", 42, 0.8);
        assert_eq!(cache.get("e1", 42), Some(0.8));
        assert_eq!(cache.get("e1", 43), None);
        cache.invalidate_all();
        assert_eq!(cache.get("e1", 42), None);
    }
}
