use crate::chunk::Chunk;

// ---------------------------------------------------------------------------
// BM25 lexical ranker.
//
// IDF is recomputed per query — corpora here are thousands of chunks, not
// millions, and a live index beats a stale frequency table. Term frequency
// counts document tokens that *contain* the query term as a substring; this
// is deliberate so path-like and kebab tokens ("docker-compose.yml",
// "src/auth/jwt.ts") match their parts. The >= 2 char token floor keeps that
// substring rule from inflating tf on trivial terms.
// ---------------------------------------------------------------------------

const K1: f32 = 1.5;
const B: f32 = 0.75;
const MULTI_TERM_BONUS: f32 = 0.15;

/// Lowercase, map everything outside `[a-z0-9_\-./]` to space, split, drop
/// tokens of length <= 1.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.' | '/') {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Bm25Hit {
    /// Index into the ranked chunk slice.
    pub chunk_idx: usize,
    pub score: f32,
    /// Distinct query terms present in the chunk.
    pub matched_terms: usize,
}

/// Rank `chunks` against `query`. Chunks containing no query term are
/// filtered out entirely.
pub fn bm25_rank(query: &str, chunks: &[Chunk], limit: usize) -> Vec<Bm25Hit> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() || chunks.is_empty() {
        return vec![];
    }

    let docs_lower: Vec<String> = chunks
        .iter()
        .map(|c| c.searchable_text().to_lowercase())
        .collect();
    let doc_tokens: Vec<Vec<String>> = docs_lower.iter().map(|d| tokenize(d)).collect();

    let n = chunks.len() as f32;
    let avg_dl = doc_tokens.iter().map(|t| t.len() as f32).sum::<f32>() / n;
    let avg_dl = avg_dl.max(1.0);

    // Per-term IDF with substring document frequency.
    let idf: Vec<f32> = terms
        .iter()
        .map(|t| {
            let df = docs_lower.iter().filter(|d| d.contains(t.as_str())).count() as f32;
            ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
        })
        .collect();

    let mut hits: Vec<Bm25Hit> = Vec::new();
    for (i, tokens) in doc_tokens.iter().enumerate() {
        let dl = tokens.len() as f32;
        let mut score = 0.0f32;
        let mut matched = 0usize;

        for (t, t_idf) in terms.iter().zip(&idf) {
            let tf = tokens.iter().filter(|tok| tok.contains(t.as_str())).count() as f32;
            if tf == 0.0 {
                continue;
            }
            matched += 1;
            let norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * dl / avg_dl));
            score += t_idf * norm;
        }

        if matched > 0 && score > 0.0 {
            score *= 1.0 + MULTI_TERM_BONUS * matched as f32;
            hits.push(Bm25Hit {
                chunk_idx: i,
                score,
                matched_terms: matched,
            });
        }
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> Chunk {
        Chunk::new("test", "", content.to_string(), 1, 1)
    }

    #[test]
    fn tokenizer_keeps_paths_and_kebab_tokens() {
        assert_eq!(
            tokenize("Deploy src/auth/jwt.ts via docker-compose!"),
            vec!["deploy", "src/auth/jwt.ts", "via", "docker-compose"]
        );
    }

    #[test]
    fn tokenizer_drops_single_char_tokens() {
        assert_eq!(tokenize("a b cd e"), vec!["cd"]);
    }

    #[test]
    fn zero_score_for_chunks_without_query_terms() {
        let chunks = vec![chunk("nothing relevant here"), chunk("docker deploy steps")];
        let hits = bm25_rank("kubernetes", &chunks, 10);
        assert!(hits.is_empty());
    }

    #[test]
    fn multi_term_chunk_beats_single_term_by_bonus_factor() {
        let chunks = vec![
            chunk("docker deploy pipeline"),
            chunk("docker images are cached"),
            chunk("docker volumes fill disk"),
        ];
        let hits = bm25_rank("docker deploy", &chunks, 10);
        assert_eq!(hits.len(), 3, "all contain at least one term");
        assert_eq!(hits[0].chunk_idx, 0);
        assert!(hits.iter().all(|h| h.score > 0.0));
        let best = hits[0].score;
        let runner_up = hits[1].score;
        assert!(
            best >= runner_up * 1.15,
            "two-term hit must lead by at least the bonus factor ({best} vs {runner_up})"
        );
    }

    #[test]
    fn verbatim_query_ranks_at_least_subset_matches() {
        let chunks = vec![
            chunk("restart nginx after cert renewal"),
            chunk("restart nginx"),
            chunk("nginx config lives in /etc/nginx"),
        ];
        let hits = bm25_rank("restart nginx after cert renewal", &chunks, 10);
        assert_eq!(hits[0].chunk_idx, 0);
    }

    #[test]
    fn ubiquitous_terms_contribute_less_than_rare_terms() {
        // "docker" appears everywhere; "grafana" once. The rare-term chunk
        // must outrank a same-length chunk scoring only on the common term.
        let chunks = vec![
            chunk("docker basics for the team"),
            chunk("docker compose for the team"),
            chunk("grafana basics for the team"),
            chunk("docker volumes for the team"),
        ];
        let hits = bm25_rank("grafana docker", &chunks, 10);
        assert_eq!(hits[0].chunk_idx, 2);
    }

    #[test]
    fn substring_tf_matches_path_tokens() {
        let chunks = vec![chunk("edit src/auth/jwt.ts then rebuild"), chunk("unrelated")];
        let hits = bm25_rank("jwt", &chunks, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_idx, 0);
    }
}
