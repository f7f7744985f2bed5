use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Chunk — the uniform record every indexed source is reduced to.
//
// A chunk is created once during ingest and never mutated; reindex drops the
// whole set and rebuilds. Line ranges are 1-based and inclusive and always
// refer to the primary content, not any prepended overlap.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Name of the source this chunk came from (file label, collector label).
    pub source: String,
    /// Heading path ("## A > ### B") or structural locator ("fn handle", "commits 1-10").
    pub section: String,
    /// The indexed text. Never empty.
    pub content: String,
    /// 1-based first line of the primary content within the source.
    pub start_line: u32,
    /// 1-based last line (inclusive).
    pub end_line: u32,
    /// First 16 hex chars of SHA-256 over the primary content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// When the backing source was last written (file mtime at ingest).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn new(source: &str, section: &str, content: String, start_line: u32, end_line: u32) -> Self {
        let hash = content_hash(&content);
        Self {
            source: source.to_string(),
            section: section.to_string(),
            content,
            start_line,
            end_line,
            hash: Some(hash),
            indexed_at: None,
        }
    }

    pub fn with_indexed_at(mut self, at: DateTime<Utc>) -> Self {
        self.indexed_at = Some(at);
        self
    }

    /// The text handed to rankers: content plus section label so heading
    /// words are searchable too.
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.content, self.section)
    }
}

/// First 16 hex chars of SHA-256 over `content`. Deterministic, so equal
/// content always produces equal hashes regardless of source or position.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

// ---------------------------------------------------------------------------
// Sources and projects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Markdown,
    Code,
}

/// A named file registered for ingestion, either declared explicitly in the
/// config or discovered via workspace patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub name: String,
    pub path: PathBuf,
    pub kind: SourceKind,
    /// Workspace project this source was discovered under; `None` for
    /// explicit config entries (universal scope).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// A first-level directory under a workspace root. `name` is the
/// workspace-unique identifier used for learning scope and collector labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDirectory {
    pub name: String,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Embedded chunks
// ---------------------------------------------------------------------------

/// A chunk paired with its dense vector. The vector is L2-normalized at
/// embed time, so cosine similarity reduces to a dot product.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    /// Index into the engine's ordered chunk list.
    pub chunk_idx: usize,
    pub vector: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_16_hex_and_deterministic() {
        let a = content_hash("hello world");
        let b = content_hash("hello world");
        let c = content_hash("hello worlds");
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn chunk_new_fills_hash_from_content() {
        let c = Chunk::new("guide.md", "## Setup", "run make".to_string(), 3, 3);
        assert_eq!(c.hash.as_deref(), Some(content_hash("run make").as_str()));
        assert!(c.indexed_at.is_none());
    }
}
