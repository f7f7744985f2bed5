use model2vec_rs::model::StaticModel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chunk::{Chunk, EmbeddedChunk};

// ---------------------------------------------------------------------------
// Dense retrieval — embeddings with a corpus-fingerprinted disk cache.
//
// The embedder is an opaque component: one string in (<= 512 chars), one
// L2-normalized vector out. When model init fails (no network, no cached
// model weights) the dense path stays off for the whole session and every
// query degrades to BM25 transparently.
//
// Cache: vectors persist under ~/.contextengine keyed by a fingerprint over
// all chunk content-hashes. Same fingerprint -> load vectors from disk, no
// embedder invocation.
// ---------------------------------------------------------------------------

pub const EMBED_MODEL_ID: &str = "minishlab/potion-retrieval-32M";

/// Kill switch for CI / offline runs. Setting it is exactly the
/// "embedder unavailable" degradation path, made deterministic.
pub const DISABLE_ENV_VAR: &str = "CONTEXTENGINE_DISABLE_EMBEDDINGS";

const EMBED_INPUT_MAX_CHARS: usize = 512;
const EMBED_BATCH: usize = 10;
const CACHE_FILE: &str = "embeddings.json";

pub struct Embedder {
    model: StaticModel,
}

impl Embedder {
    /// Load the model once per process. `None` disables the dense path for
    /// the rest of the session.
    pub fn init() -> Option<Self> {
        if std::env::var(DISABLE_ENV_VAR).map(|v| v == "1").unwrap_or(false) {
            return None;
        }
        match StaticModel::from_pretrained(EMBED_MODEL_ID, None, None, None) {
            Ok(model) => Some(Self { model }),
            Err(e) => {
                eprintln!("[contextengine] embedding model unavailable ({e}); dense search disabled");
                None
            }
        }
    }

    pub fn embed_query(&self, query: &str) -> Vec<f32> {
        l2_normalize(self.model.encode_single(truncate_chars(query, EMBED_INPUT_MAX_CHARS)))
    }

    /// Embed all chunks in batches of 10, preserving chunk order.
    pub fn embed_chunks(&self, chunks: &[Chunk]) -> Vec<EmbeddedChunk> {
        let mut embedded: Vec<EmbeddedChunk> = Vec::with_capacity(chunks.len());
        for (batch_no, batch) in chunks.chunks(EMBED_BATCH).enumerate() {
            let inputs: Vec<String> = batch.iter().map(embed_input).collect();
            let vectors = self.model.encode(&inputs);
            for (offset, vector) in vectors.into_iter().enumerate() {
                embedded.push(EmbeddedChunk {
                    chunk_idx: batch_no * EMBED_BATCH + offset,
                    vector: l2_normalize(vector),
                });
            }
        }
        embedded
    }
}

/// Section title + content, truncated to the embedder's input window.
fn embed_input(chunk: &Chunk) -> String {
    truncate_chars(&format!("{}\n{}", chunk.section, chunk.content), EMBED_INPUT_MAX_CHARS)
        .to_string()
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

// ── Dense search ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DenseHit {
    pub chunk_idx: usize,
    pub score: f32,
}

/// Dot product over normalized vectors == cosine similarity.
pub fn dense_rank(query_vec: &[f32], embedded: &[EmbeddedChunk], limit: usize) -> Vec<DenseHit> {
    let mut hits: Vec<DenseHit> = embedded
        .iter()
        .map(|e| DenseHit {
            chunk_idx: e.chunk_idx,
            score: dot(query_vec, &e.vector),
        })
        .collect();
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    hits
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ── Corpus fingerprint ───────────────────────────────────────────────────────

/// xxh3 over all content-hashes, concatenated in the deterministic order
/// (source, section, start line). Changes iff any chunk's content changes or
/// the chunk set itself changes.
pub fn corpus_fingerprint(chunks: &[Chunk]) -> String {
    let mut keys: Vec<(&str, &str, u32, &str)> = chunks
        .iter()
        .filter_map(|c| {
            c.hash
                .as_deref()
                .map(|h| (c.source.as_str(), c.section.as_str(), c.start_line, h))
        })
        .collect();
    keys.sort();

    let mut concat = String::with_capacity(keys.len() * 16);
    for (_, _, _, hash) in keys {
        concat.push_str(hash);
    }
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(concat.as_bytes()))
}

// ── Disk cache ───────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    chunk_idx: usize,
    vector: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFileBody {
    fingerprint: String,
    model: String,
    entries: Vec<CacheEntry>,
}

pub struct EmbeddingCache {
    path: PathBuf,
}

impl EmbeddingCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CACHE_FILE),
        }
    }

    /// Cache hit when the persisted fingerprint matches. Vectors are re-read
    /// from disk without touching the embedder.
    pub fn load(&self, fingerprint: &str) -> Option<Vec<EmbeddedChunk>> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let body: CacheFileBody = serde_json::from_str(&text).ok()?;
        if body.fingerprint != fingerprint || body.model != EMBED_MODEL_ID {
            return None;
        }
        Some(
            body.entries
                .into_iter()
                .map(|e| EmbeddedChunk {
                    chunk_idx: e.chunk_idx,
                    vector: e.vector,
                })
                .collect(),
        )
    }

    pub fn store(&self, fingerprint: &str, embedded: &[EmbeddedChunk]) {
        let body = CacheFileBody {
            fingerprint: fingerprint.to_string(),
            model: EMBED_MODEL_ID.to_string(),
            entries: embedded
                .iter()
                .map(|e| CacheEntry {
                    chunk_idx: e.chunk_idx,
                    vector: e.vector.clone(),
                })
                .collect(),
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("json.tmp");
        let write = serde_json::to_string(&body)
            .map_err(std::io::Error::other)
            .and_then(|text| std::fs::write(&tmp, text))
            .and_then(|_| std::fs::rename(&tmp, &self.path));
        if write.is_err() {
            eprintln!("[contextengine] failed to persist embedding cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, section: &str, content: &str, start: u32) -> Chunk {
        Chunk::new(source, section, content.to_string(), start, start)
    }

    #[test]
    fn fingerprint_is_order_independent_but_content_sensitive() {
        let a = chunk("a.md", "## x", "alpha", 1);
        let b = chunk("b.md", "## y", "beta", 1);
        let fp1 = corpus_fingerprint(&[a.clone(), b.clone()]);
        let fp2 = corpus_fingerprint(&[b.clone(), a.clone()]);
        assert_eq!(fp1, fp2, "fingerprint uses the deterministic sort order");

        let changed = chunk("a.md", "## x", "alpha changed", 1);
        let fp3 = corpus_fingerprint(&[changed, b]);
        assert_ne!(fp1, fp3);
    }

    #[test]
    fn fingerprint_changes_when_chunk_set_changes() {
        let a = chunk("a.md", "## x", "alpha", 1);
        let b = chunk("b.md", "## y", "beta", 1);
        assert_ne!(corpus_fingerprint(&[a.clone()]), corpus_fingerprint(&[a, b]));
    }

    #[test]
    fn normalized_vectors_have_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn dense_rank_orders_by_dot_product() {
        let embedded = vec![
            EmbeddedChunk { chunk_idx: 0, vector: vec![1.0, 0.0] },
            EmbeddedChunk { chunk_idx: 1, vector: vec![0.6, 0.8] },
            EmbeddedChunk { chunk_idx: 2, vector: vec![0.0, 1.0] },
        ];
        let hits = dense_rank(&[1.0, 0.0], &embedded, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_idx, 0);
        assert_eq!(hits[1].chunk_idx, 1);
    }

    #[test]
    fn cache_round_trips_and_rejects_stale_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(tmp.path());
        let embedded = vec![EmbeddedChunk { chunk_idx: 0, vector: vec![0.1, 0.2] }];
        cache.store("fp-1", &embedded);

        let hit = cache.load("fp-1").unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].vector, vec![0.1, 0.2]);
        assert!(cache.load("fp-2").is_none());
    }

    #[test]
    fn embed_input_truncates_to_window() {
        let c = chunk("big.md", "## big", &"x".repeat(2000), 1);
        assert_eq!(embed_input(&c).chars().count(), EMBED_INPUT_MAX_CHARS);
    }
}
