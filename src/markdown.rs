use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

use crate::chunk::{content_hash, Chunk};

// ---------------------------------------------------------------------------
// Markdown ingester — heading-hierarchical splitting with overlap.
//
// Two passes:
//   1. Stream lines with a heading stack; every heading (and EOF) flushes the
//      pending body as a raw section labeled by the full heading path
//      ("## A > ### B").
//   2. Build final chunks by prepending up to OVERLAP_LINES tail lines from
//      the previous section behind a literal `---` separator. The overlap
//      gives retrieval continuity across headings without re-embedding whole
//      files.
//
// The content hash always covers the primary (non-overlapped) content, so the
// corpus dedup set and the cache fingerprint are stable under the overlap
// pass. Line ranges likewise refer only to primary content.
// ---------------------------------------------------------------------------

/// Tail lines carried over from the previous section.
const OVERLAP_LINES: usize = 4;

/// Separator line between overlap and primary content.
const OVERLAP_MARKER: &str = "---";

#[derive(Debug, Clone)]
pub(crate) struct RawSection {
    pub section: String,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
}

/// Split markdown text into raw sections using a heading stack.
///
/// A heading is `#{1..6}` followed by whitespace and a title. On a heading the
/// pending body is flushed under the *current* path, then entries with level
/// >= the new heading's level are popped and the new heading is pushed.
///
/// Content before the first heading is dropped unless the document has no
/// headings at all, in which case the whole file becomes one section.
pub(crate) fn split_sections(text: &str) -> Vec<RawSection> {
    let heading_re = Regex::new(r"^(#{1,6})\s+(.+)$").unwrap();

    // (level, rendered heading e.g. "## B")
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut pending: Vec<(u32, &str)> = Vec::new();
    let mut sections: Vec<RawSection> = Vec::new();

    let flush = |stack: &[(usize, String)], pending: &mut Vec<(u32, &str)>, out: &mut Vec<RawSection>| {
        if stack.is_empty() {
            pending.clear();
            return;
        }
        // Trim blank edge lines; line range covers only what survives.
        let first = pending.iter().position(|(_, l)| !l.trim().is_empty());
        let last = pending.iter().rposition(|(_, l)| !l.trim().is_empty());
        if let (Some(a), Some(b)) = (first, last) {
            let body: Vec<&str> = pending[a..=b].iter().map(|(_, l)| *l).collect();
            out.push(RawSection {
                section: stack.iter().map(|(_, h)| h.as_str()).collect::<Vec<_>>().join(" > "),
                content: body.join("\n"),
                start_line: pending[a].0,
                end_line: pending[b].0,
            });
        }
        pending.clear();
    };

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx as u32 + 1;
        if let Some(caps) = heading_re.captures(line) {
            flush(&stack, &mut pending, &mut sections);
            let level = caps[1].len();
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, line.trim_end().to_string()));
        } else {
            pending.push((line_no, line));
        }
    }
    flush(&stack, &mut pending, &mut sections);

    // Heading-free documents still index as a single section.
    if sections.is_empty() && !text.trim().is_empty() {
        let lines: Vec<&str> = text.lines().collect();
        let first = lines.iter().position(|l| !l.trim().is_empty()).unwrap_or(0);
        let last = lines.iter().rposition(|l| !l.trim().is_empty()).unwrap_or(0);
        sections.push(RawSection {
            section: "(document)".to_string(),
            content: lines[first..=last].join("\n"),
            start_line: first as u32 + 1,
            end_line: last as u32 + 1,
        });
    }

    sections
}

/// Build final chunks from markdown text: overlap pass + corpus dedup.
///
/// `seen` is the corpus-wide content-hash set; a collision drops the later
/// chunk (handles the same doc referenced from multiple workspace roots).
pub fn chunks_from_text(
    source_name: &str,
    text: &str,
    indexed_at: Option<DateTime<Utc>>,
    seen: &mut HashSet<String>,
) -> Vec<Chunk> {
    let raw = split_sections(text);
    let mut chunks: Vec<Chunk> = Vec::with_capacity(raw.len());

    for (i, sec) in raw.iter().enumerate() {
        let hash = content_hash(&sec.content);
        if !seen.insert(hash.clone()) {
            continue;
        }

        let content = if i > 0 {
            let prev_lines: Vec<&str> = raw[i - 1].content.lines().collect();
            let tail_start = prev_lines.len().saturating_sub(OVERLAP_LINES);
            let mut parts: Vec<&str> = prev_lines[tail_start..].to_vec();
            parts.push(OVERLAP_MARKER);
            format!("{}\n{}", parts.join("\n"), sec.content)
        } else {
            sec.content.clone()
        };

        chunks.push(Chunk {
            source: source_name.to_string(),
            section: sec.section.clone(),
            content,
            start_line: sec.start_line,
            end_line: sec.end_line,
            hash: Some(hash),
            indexed_at,
        });
    }

    chunks
}

pub(crate) fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest(text: &str) -> Vec<Chunk> {
        let mut seen = HashSet::new();
        chunks_from_text("test.md", text, None, &mut seen)
    }

    #[test]
    fn splits_on_headings_with_full_path_sections() {
        let chunks = ingest("# A\n## B\nhello world\n## C\nbye");
        assert_eq!(chunks.len(), 2);

        assert_eq!(chunks[0].section, "# A > ## B");
        assert_eq!(chunks[0].content, "hello world");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (3, 3));

        assert_eq!(chunks[1].section, "# A > ## C");
        assert_eq!(chunks[1].content, "hello world\n---\nbye");
        assert_eq!((chunks[1].start_line, chunks[1].end_line), (5, 5));
    }

    #[test]
    fn hash_covers_primary_content_not_overlap() {
        let chunks = ingest("# A\n## B\nhello world\n## C\nbye");
        assert_eq!(chunks[1].hash.as_deref(), Some(content_hash("bye").as_str()));
    }

    #[test]
    fn heading_stack_pops_on_equal_or_higher_level() {
        let text = "# Top\n## A\naaa\n### Deep\nddd\n## B\nbbb";
        let chunks = ingest(text);
        let sections: Vec<&str> = chunks.iter().map(|c| c.section.as_str()).collect();
        assert_eq!(sections, vec!["# Top > ## A", "# Top > ## A > ### Deep", "# Top > ## B"]);
    }

    #[test]
    fn primary_line_ranges_cover_heading_bodies_exactly() {
        let text = "# T\nline two\nline three\n## S\nline five\n\nline seven";
        let chunks = ingest(text);
        let mut covered: Vec<u32> = Vec::new();
        for c in &chunks {
            covered.extend(c.start_line..=c.end_line);
        }
        // Body lines: 2,3 under "# T"; 5..7 under "## S" (blank line 6 inside range).
        assert_eq!(covered, vec![2, 3, 5, 6, 7]);
    }

    #[test]
    fn dedup_is_idempotent_across_repeat_ingest() {
        let text = "# A\n## B\nhello world\n## C\nbye";
        let mut seen = HashSet::new();
        let first = chunks_from_text("a.md", text, None, &mut seen);
        let second = chunks_from_text("b.md", text, None, &mut seen);
        assert_eq!(first.len(), 2);
        assert!(second.is_empty(), "repeat ingest must add no chunks");
    }

    #[test]
    fn overlap_takes_at_most_four_tail_lines() {
        let text = "## A\n1\n2\n3\n4\n5\n6\n## B\nend";
        let chunks = ingest(text);
        assert_eq!(chunks[1].content, "3\n4\n5\n6\n---\nend");
    }

    #[test]
    fn heading_free_document_is_one_section() {
        let chunks = ingest("just some notes\nsecond line");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section, "(document)");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 2));
    }

    #[test]
    fn empty_sections_are_dropped() {
        let chunks = ingest("# A\n## B\n\n## C\nreal content");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section, "# A > ## C");
    }
}
