use ignore::WalkBuilder;
use regex::Regex;
use std::path::Path;

use crate::chunk::Chunk;
use crate::markdown::file_mtime;

// ---------------------------------------------------------------------------
// Code chunker — language-tagged top-level blocks.
//
// C-family sources (ts/js/mjs/mts) are scanned with regex-driven declaration
// finders plus a string-aware balanced-brace scanner. Python blocks expand
// from module-level `def`/`async def`/`class` by indentation. No AST; the
// block granularity here only needs to be good enough for retrieval.
// ---------------------------------------------------------------------------

/// Max distance (bytes) between a declaration head and its opening brace.
const BRACE_SEARCH_WINDOW: usize = 200;

/// Blocks shorter than this many lines are noise and dropped.
const MIN_BLOCK_LINES: u32 = 2;

/// Directory scan recursion limit.
pub const DEFAULT_SCAN_DEPTH: usize = 3;

/// Files above this size are skipped entirely.
const MAX_FILE_BYTES: u64 = 100 * 1024;

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "out",
    "coverage",
    "vendor",
    "__pycache__",
    ".next",
    ".cache",
    "target",
];

const CONFIG_FILES: &[&str] = &[
    "package.json",
    "package-lock.json",
    "tsconfig.json",
    "composer.json",
    "setup.py",
    "conftest.py",
];

#[derive(Debug, Clone)]
struct Block {
    label: String,
    start_line: u32,
    end_line: u32,
    text: String,
}

// ── C-family extraction ──────────────────────────────────────────────────────

/// Declaration patterns for TypeScript/JavaScript. Each yields a kind label
/// and a captured symbol name; the block body is found by brace matching.
fn cfamily_patterns() -> Vec<(&'static str, Regex)> {
    vec![
        (
            "function",
            Regex::new(r"(?m)^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)").unwrap(),
        ),
        (
            "function",
            Regex::new(r"(?m)^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=\n]+)?=\s*(?:async\s*)?\([^)\n]*\)\s*(?::[^=\n]+)?=>").unwrap(),
        ),
        (
            "class",
            Regex::new(r"(?m)^(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)").unwrap(),
        ),
        (
            "interface",
            Regex::new(r"(?m)^(?:export\s+)?interface\s+([A-Za-z_$][\w$]*)").unwrap(),
        ),
        (
            "type",
            Regex::new(r"(?m)^(?:export\s+)?type\s+([A-Za-z_$][\w$]*)(?:<[^>\n]*>)?\s*=\s*\{").unwrap(),
        ),
    ]
}

#[derive(Debug)]
enum Frame {
    Code(i32),
    Single,
    Double,
    Template,
}

/// Find the byte index of the `}` matching the `{` at `open`.
///
/// Tracks `"`, `'`, and backtick strings, respects backslash escapes, and
/// follows `${ ... }` template interpolation so braces inside literals never
/// unbalance the scan. Returns `None` for malformed input.
fn find_matching_brace(src: &[u8], open: usize) -> Option<usize> {
    if src.get(open) != Some(&b'{') {
        return None;
    }
    let mut stack: Vec<Frame> = vec![Frame::Code(0)];
    let mut i = open;
    while i < src.len() {
        let c = src[i];
        match stack.last_mut() {
            Some(Frame::Code(depth)) => match c {
                b'"' => stack.push(Frame::Double),
                b'\'' => stack.push(Frame::Single),
                b'`' => stack.push(Frame::Template),
                b'{' => *depth += 1,
                b'}' => {
                    *depth -= 1;
                    if *depth < 0 {
                        return None;
                    }
                    if *depth == 0 {
                        if stack.len() == 1 {
                            return Some(i);
                        }
                        // End of a `${ ... }` interpolation — resume the literal.
                        stack.pop();
                    }
                }
                _ => {}
            },
            Some(Frame::Single) => match c {
                b'\\' => i += 1,
                b'\'' => {
                    stack.pop();
                }
                _ => {}
            },
            Some(Frame::Double) => match c {
                b'\\' => i += 1,
                b'"' => {
                    stack.pop();
                }
                _ => {}
            },
            Some(Frame::Template) => match c {
                b'\\' => i += 1,
                b'`' => {
                    stack.pop();
                }
                b'$' if src.get(i + 1) == Some(&b'{') => {
                    stack.push(Frame::Code(1));
                    i += 1;
                }
                _ => {}
            },
            None => return None,
        }
        i += 1;
    }
    None
}

fn line_of_byte(offsets: &[usize], byte: usize) -> u32 {
    // offsets[k] = byte index where line k (0-based) starts.
    match offsets.binary_search(&byte) {
        Ok(k) => k as u32 + 1,
        Err(k) => k as u32,
    }
}

fn line_start_offsets(text: &str) -> Vec<usize> {
    let mut offsets = vec![0usize];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            offsets.push(i + 1);
        }
    }
    offsets
}

fn extract_cfamily_blocks(text: &str) -> Vec<Block> {
    let bytes = text.as_bytes();
    let offsets = line_start_offsets(text);
    let mut blocks: Vec<Block> = Vec::new();

    for (kind, re) in cfamily_patterns() {
        for caps in re.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or("anonymous");

            // The opening brace must appear close to the declaration head;
            // expression-bodied arrows and forward decls have none and are skipped.
            let mut window_end = (whole.start() + BRACE_SEARCH_WINDOW).min(bytes.len());
            while !text.is_char_boundary(window_end) {
                window_end -= 1;
            }
            let Some(rel) = text[whole.start()..window_end].find('{') else {
                continue;
            };
            let open = whole.start() + rel;
            let Some(close) = find_matching_brace(bytes, open) else {
                continue;
            };

            let start_line = line_of_byte(&offsets, whole.start());
            let end_line = line_of_byte(&offsets, close);
            let block_text: String = text
                .lines()
                .skip(start_line as usize - 1)
                .take((end_line - start_line + 1) as usize)
                .collect::<Vec<_>>()
                .join("\n");

            blocks.push(Block {
                label: format!("{kind} {name}"),
                start_line,
                end_line,
                text: block_text,
            });
        }
    }

    blocks
}

// ── Python extraction ────────────────────────────────────────────────────────

fn extract_python_blocks(text: &str) -> Vec<Block> {
    let def_re = Regex::new(r"^(?:async\s+)?(def|class)\s+([A-Za-z_]\w*)").unwrap();
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks: Vec<Block> = Vec::new();

    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i];
        let caps = match def_re.captures(line) {
            Some(c) if !line.starts_with(char::is_whitespace) => c,
            _ => {
                i += 1;
                continue;
            }
        };

        // Expand by indentation: everything blank or indented belongs to the block.
        let mut end = i;
        let mut j = i + 1;
        while j < lines.len() {
            let l = lines[j];
            if l.trim().is_empty() {
                j += 1;
                continue;
            }
            if l.starts_with(char::is_whitespace) {
                end = j;
                j += 1;
            } else {
                break;
            }
        }

        blocks.push(Block {
            label: format!("{} {}", &caps[1], &caps[2]),
            start_line: i as u32 + 1,
            end_line: end as u32 + 1,
            text: lines[i..=end].join("\n"),
        });
        i = end + 1;
    }

    blocks
}

// ── Post-processing ──────────────────────────────────────────────────────────

/// Sort by start line, drop blocks fully contained in an earlier block
/// (class chunks keep their methods inline), drop short blocks.
fn finalize_blocks(mut blocks: Vec<Block>) -> Vec<Block> {
    blocks.sort_by_key(|b| (b.start_line, std::cmp::Reverse(b.end_line)));

    let mut kept: Vec<Block> = Vec::new();
    for b in blocks {
        let contained = kept
            .iter()
            .any(|k| k.start_line <= b.start_line && b.end_line <= k.end_line);
        if contained {
            continue;
        }
        if b.end_line - b.start_line + 1 < MIN_BLOCK_LINES {
            continue;
        }
        kept.push(b);
    }
    kept
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Chunk one source file by extension. Unknown extensions yield nothing.
pub fn chunk_code_file(source_name: &str, path: &Path) -> Vec<Chunk> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return vec![],
    };

    let blocks = match ext.as_str() {
        "ts" | "js" | "mjs" | "mts" => finalize_blocks(extract_cfamily_blocks(&text)),
        "py" => finalize_blocks(extract_python_blocks(&text)),
        _ => return vec![],
    };

    let indexed_at = file_mtime(path);
    blocks
        .into_iter()
        .map(|b| {
            let mut c = Chunk::new(source_name, &b.label, b.text, b.start_line, b.end_line);
            c.indexed_at = indexed_at;
            c
        })
        .collect()
}

fn is_test_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains(".test.")
        || lower.contains(".spec.")
        || lower.starts_with("test_")
        || lower
            .rsplit_once('.')
            .is_some_and(|(stem, _)| stem.ends_with("_test"))
}

/// Recursively scan `dir` for chunkable code files.
///
/// Depth-limited, gitignore-respecting, and skips dependency/build
/// directories, test files, manifests, and anything over 100 KB.
pub fn scan_code_dir(project: &str, dir: &Path, max_depth: usize) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();

    let walker = WalkBuilder::new(dir)
        .max_depth(Some(max_depth))
        .hidden(true)
        .git_ignore(true)
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !SKIP_DIRS.contains(&name.as_ref())
        })
        .build();

    let mut files: Vec<std::path::PathBuf> = Vec::new();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if is_test_file(name) || CONFIG_FILES.contains(&name) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        files.push(path.to_path_buf());
    }
    files.sort();

    for path in files {
        let rel = path.strip_prefix(dir).unwrap_or(&path);
        let source_name = format!("{}/{}", project, rel.to_string_lossy().replace('\\', "/"));
        chunks.extend(chunk_code_file(&source_name, &path));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_balanced_brace_through_strings() {
        let src = br#"function f() { const s = "not } a brace"; return s; }"#;
        let open = src.iter().position(|&b| b == b'{').unwrap();
        let close = find_matching_brace(src, open).unwrap();
        assert_eq!(src[close], b'}');
        assert_eq!(close, src.len() - 1);
    }

    #[test]
    fn template_interpolation_braces_balance() {
        let src = "const t = () => { return `a ${x ? `${y}` : \"}\"} b`; }";
        let open = src.find('{').unwrap();
        let close = find_matching_brace(src.as_bytes(), open).unwrap();
        assert_eq!(close, src.len() - 1);
    }

    #[test]
    fn escaped_quote_does_not_close_string() {
        let src = br#"{ const s = "a \" } b"; }"#;
        let close = find_matching_brace(src, 0).unwrap();
        assert_eq!(close, src.len() - 1);
    }

    #[test]
    fn extracts_top_level_declarations() {
        let src = "export function alpha() {\n  return 1;\n}\n\nconst beta = async (x) => {\n  return x;\n};\n\nclass Gamma {\n  method() {\n    return 2;\n  }\n}\n";
        let blocks = finalize_blocks(extract_cfamily_blocks(src));
        let labels: Vec<&str> = blocks.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["function alpha", "function beta", "class Gamma"]);
    }

    #[test]
    fn methods_are_absorbed_by_their_class() {
        let src = "class Outer {\n  inner() {\n    return 1;\n  }\n}\n";
        let blocks = finalize_blocks(extract_cfamily_blocks(src));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, "class Outer");
        assert!(blocks[0].text.contains("inner()"));
    }

    #[test]
    fn short_blocks_are_dropped() {
        let src = "function one() { return 1; }\nfunction two() {\n  return 2;\n}\n";
        let blocks = finalize_blocks(extract_cfamily_blocks(src));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, "function two");
    }

    #[test]
    fn python_blocks_expand_by_indentation() {
        let src = "import os\n\ndef top():\n    x = 1\n\n    return x\n\nclass Thing:\n    def method(self):\n        pass\n\nVALUE = 3\n";
        let blocks = finalize_blocks(extract_python_blocks(src));
        let labels: Vec<&str> = blocks.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["def top", "class Thing"]);
        assert!(blocks[1].text.contains("def method"));
    }

    #[test]
    fn test_files_are_recognized() {
        assert!(is_test_file("auth.test.ts"));
        assert!(is_test_file("auth.spec.js"));
        assert!(is_test_file("test_auth.py"));
        assert!(is_test_file("auth_test.py"));
        assert!(!is_test_file("auth.ts"));
        assert!(!is_test_file("contest.py"));
    }
}
