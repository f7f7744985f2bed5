use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::chunk::Chunk;
use crate::embedder::DenseHit;
use crate::ranker::Bm25Hit;

// ---------------------------------------------------------------------------
// Hybrid fuser — normalized BM25 + cosine, weighted combine, temporal decay.
//
// BM25 scores are unbounded, so they are normalized by the top score before
// mixing with cosine (which is already in [-1, 1]). Decay rides on top of
// either mode: recency halves the bonus every 90 days but never drops a
// chunk below half its raw score.
// ---------------------------------------------------------------------------

const KEYWORD_WEIGHT: f32 = 0.4;
const SEMANTIC_WEIGHT: f32 = 0.6;
const DECAY_HALF_LIFE_DAYS: f32 = 90.0;
const MISSING_TIMESTAMP_DECAY: f32 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Hybrid,
    Keyword,
    Semantic,
}

impl SearchMode {
    pub fn parse(raw: &str) -> Option<SearchMode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Some(Self::Hybrid),
            "keyword" => Some(Self::Keyword),
            "semantic" => Some(Self::Semantic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Keyword => "keyword",
            Self::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusedHit {
    pub chunk_idx: usize,
    pub combined: f32,
    /// Normalized keyword-side score (0 when the chunk only surfaced densely).
    pub kw: f32,
    /// Cosine score (0 when the chunk only surfaced lexically).
    pub sem: f32,
    pub decay: f32,
}

/// `tau = 0.5 + 0.5 * exp(-age_days * ln 2 / H)`, H = 90 days.
/// Chunks without a timestamp get a flat 0.85.
pub fn temporal_decay(indexed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
    match indexed_at {
        Some(at) => {
            let age_days = (now - at).num_seconds().max(0) as f32 / 86_400.0;
            0.5 + 0.5 * (-age_days * std::f32::consts::LN_2 / DECAY_HALF_LIFE_DAYS).exp()
        }
        None => MISSING_TIMESTAMP_DECAY,
    }
}

/// Fuse the two candidate lists into a final ranking of at most `k` chunks.
pub fn fuse(
    mode: SearchMode,
    bm25: &[Bm25Hit],
    dense: &[DenseHit],
    chunks: &[Chunk],
    now: DateTime<Utc>,
    k: usize,
) -> Vec<FusedHit> {
    let top_kw = bm25.first().map(|h| h.score).unwrap_or(0.0);

    // Union keyed by chunk identity; a missing side defaults to 0.
    let mut union: BTreeMap<usize, (f32, f32)> = BTreeMap::new();
    if mode != SearchMode::Semantic {
        for h in bm25 {
            let kw = if top_kw > 0.0 { h.score / top_kw } else { 0.0 };
            union.entry(h.chunk_idx).or_insert((0.0, 0.0)).0 = kw;
        }
    }
    if mode != SearchMode::Keyword {
        for h in dense {
            union.entry(h.chunk_idx).or_insert((0.0, 0.0)).1 = h.score;
        }
    }

    let mut fused: Vec<FusedHit> = union
        .into_iter()
        .filter_map(|(chunk_idx, (kw, sem))| {
            let raw = match mode {
                SearchMode::Hybrid => KEYWORD_WEIGHT * kw + SEMANTIC_WEIGHT * sem,
                SearchMode::Keyword => kw,
                SearchMode::Semantic => sem,
            };
            if raw <= 0.0 {
                return None;
            }
            let decay = temporal_decay(chunks.get(chunk_idx).and_then(|c| c.indexed_at), now);
            Some(FusedHit {
                chunk_idx,
                combined: raw * decay,
                kw,
                sem,
                decay,
            })
        })
        .collect();

    fused.sort_by(|a, b| b.combined.partial_cmp(&a.combined).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(k);
    fused
}
