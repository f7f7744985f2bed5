use anyhow::{Context, Result};
use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapters::AdapterRegistry;
use crate::chunk::{Chunk, EmbeddedChunk, KnowledgeSource, ProjectDirectory, SourceKind};
use crate::code::{scan_code_dir, DEFAULT_SCAN_DEPTH};
use crate::collectors::{collect_project, collect_system};
use crate::config::{load_config, EngineConfig};
use crate::embedder::{corpus_fingerprint, dense_rank, Embedder, EmbeddingCache};
use crate::firewall::Firewall;
use crate::fuser::{fuse, SearchMode};
use crate::learnings::{LearningCategory, LearningStore};
use crate::markdown::{chunks_from_text, file_mtime};
use crate::ranker::bm25_rank;
use crate::sessions::SessionStore;
use crate::workspace::{discover_projects, discover_sources};

// ---------------------------------------------------------------------------
// Indexer — orchestrates ingestion into one chunk set and answers queries.
//
// Reindex is all-or-nothing: the previous chunk set is dropped wholesale and
// rebuilt in a fixed emission order (markdown, per-project ops, system ops,
// code, learnings, adapters). The cache fingerprint depends on the chunk
// set, so embeddings are only recomputed when content actually changed.
//
// Single-owner discipline: the engine lives behind one Arc<Mutex<_>>; the
// stdio dispatcher and the watch debounce thread take turns. Collector
// subprocesses run concurrently on the engine's tokio runtime and only hand
// finished chunk lists back to the reindex step.
// ---------------------------------------------------------------------------

/// Source label for projected learning chunks, so `read_source("learnings")`
/// and per-source counts work by name.
pub const LEARNINGS_SOURCE: &str = "learnings";

pub const MAX_TOP_K: usize = 30;

const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct IndexState {
    pub chunks: Vec<Chunk>,
    /// Empty when the embedder is unavailable.
    pub embedded: Vec<EmbeddedChunk>,
    pub sources: Vec<KnowledgeSource>,
    pub fingerprint: String,
}

#[derive(Debug, Default, Clone)]
pub struct ReindexSummary {
    pub sources: usize,
    pub projects: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub learnings_imported: usize,
    pub embed_cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub combined: f32,
    pub kw: f32,
    pub sem: f32,
    pub decay: f32,
}

pub struct Engine {
    home: PathBuf,
    pub config: EngineConfig,
    config_dir: Option<PathBuf>,
    /// When set (tests, embedded use), reindex keeps the injected config
    /// instead of re-reading the discovery chain.
    config_locked: bool,
    pub state: IndexState,
    pub projects: Vec<ProjectDirectory>,
    pub learnings: LearningStore,
    pub sessions: SessionStore,
    pub firewall: Firewall,
    pub adapters: AdapterRegistry,
    embedder: Option<Embedder>,
    embedder_probed: bool,
    cache: EmbeddingCache,
    rt: tokio::runtime::Runtime,
}

impl Engine {
    /// Standard construction: stores under `~/.contextengine/`, config from
    /// the discovery chain.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .context("cannot resolve home directory")?
            .join(".contextengine");
        let (config, config_dir) = load_config();
        Self::build(home, config, config_dir, false)
    }

    /// Construction with explicit home and config (tests, embedding hosts).
    pub fn with_home(home: PathBuf, config: EngineConfig, config_dir: Option<PathBuf>) -> Result<Self> {
        Self::build(home, config, config_dir, true)
    }

    fn build(
        home: PathBuf,
        config: EngineConfig,
        config_dir: Option<PathBuf>,
        config_locked: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(&home)
            .with_context(|| format!("creating {}", home.display()))?;
        let learnings = LearningStore::open(&home);
        let sessions = SessionStore::open(&home);
        let firewall = Firewall::open(&home);
        let cache = EmbeddingCache::new(&home);
        let adapters = AdapterRegistry::from_config(&config.adapters);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building collector runtime")?;

        Ok(Self {
            home,
            config,
            config_dir,
            config_locked,
            state: IndexState::default(),
            projects: vec![],
            learnings,
            sessions,
            firewall,
            adapters,
            embedder: None,
            embedder_probed: false,
            cache,
            rt,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    // ── Reindex ──────────────────────────────────────────────────────────

    /// Full rebuild, exactly once per trigger. Never fails the retrieval
    /// path: every per-source problem degrades to "fewer chunks".
    pub fn reindex(&mut self) -> Result<ReindexSummary> {
        // 1. Config + discovery.
        if !self.config_locked {
            let (config, config_dir) = load_config();
            self.config = config;
            self.config_dir = config_dir;
        }
        self.projects = discover_projects(&self.config.workspaces);
        let sources = discover_sources(&self.config, self.config_dir.as_deref());

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut seen_hashes: HashSet<String> = HashSet::new();

        // 2. Markdown ingestion with global content-hash dedup. Reads go
        //    wide; installation stays in discovery order.
        let md_sources: Vec<&KnowledgeSource> = sources
            .iter()
            .filter(|s| s.kind == SourceKind::Markdown)
            .collect();
        let texts: Vec<Option<String>> = md_sources
            .par_iter()
            .map(|s| std::fs::read_to_string(&s.path).ok())
            .collect();
        let mut imported_texts: Vec<(Option<String>, String)> = Vec::new();
        for (source, text) in md_sources.iter().zip(texts) {
            match text {
                Some(text) => {
                    let indexed_at = file_mtime(&source.path);
                    chunks.extend(chunks_from_text(&source.name, &text, indexed_at, &mut seen_hashes));
                    imported_texts.push((source.project.clone(), text));
                }
                None => {
                    eprintln!(
                        "[contextengine] skipping source '{}' ({})",
                        source.name,
                        source.path.display()
                    );
                }
            }
        }

        // 3. Project-scoped collectors, then 4. system collectors. The
        //    subprocesses are async with hard timeouts; results install in
        //    project-enumeration order.
        if self.config.collect_ops {
            let projects = self.projects.clone();
            let ops: Vec<Vec<Chunk>> = self.rt.block_on(async {
                let mut all = Vec::with_capacity(projects.len());
                for p in &projects {
                    all.push(collect_project(p).await);
                }
                all
            });
            for project_chunks in ops {
                chunks.extend(project_chunks);
            }
        }
        if self.config.collect_system_ops {
            chunks.extend(self.rt.block_on(collect_system()));
        }

        // Code directories, per project in enumeration order.
        if !self.config.code_dirs.is_empty() {
            for project in &self.projects {
                for dir in &self.config.code_dirs {
                    let abs = project.path.join(dir);
                    if abs.is_dir() {
                        chunks.extend(scan_code_dir(&project.name, &abs, DEFAULT_SCAN_DEPTH));
                    }
                }
            }
        }
        // Explicit code sources.
        for source in sources.iter().filter(|s| s.kind == SourceKind::Code) {
            chunks.extend(crate::code::chunk_code_file(&source.name, &source.path));
        }

        // 5. Auto-import learnings out of the markdown sources; the store's
        //    dedup key keeps this idempotent across reindexes.
        let mut learnings_imported = 0usize;
        for (project, text) in &imported_texts {
            learnings_imported +=
                self.learnings
                    .import_markdown(text, LearningCategory::Workflow, project.as_deref());
        }

        // 6. Project the store into chunks — only universal learnings and
        //    those scoped to a current workspace project.
        let scope: Vec<String> = self.projects.iter().map(|p| p.name.clone()).collect();
        for learning in self.learnings.list(None, Some(&scope)) {
            let chunk = Chunk::new(
                LEARNINGS_SOURCE,
                &format!("{} · {}", learning.category, learning.rule),
                if learning.context.is_empty() {
                    learning.rule.clone()
                } else {
                    format!("{}\n{}", learning.rule, learning.context)
                },
                1,
                1,
            )
            .with_indexed_at(learning.updated);
            chunks.push(chunk);
        }

        // 7. Plugin adapters, isolated per adapter.
        chunks.extend(self.adapters.collect_all());

        // 8. Embeddings, fingerprint-cached.
        let fingerprint = corpus_fingerprint(&chunks);
        let mut embed_cache_hit = false;
        let embedded = if chunks.is_empty() {
            vec![]
        } else {
            if !self.embedder_probed {
                self.embedder = Embedder::init();
                self.embedder_probed = true;
            }
            match &self.embedder {
                Some(embedder) => match self.cache.load(&fingerprint) {
                    Some(cached) if cached.iter().all(|e| e.chunk_idx < chunks.len()) => {
                        embed_cache_hit = true;
                        cached
                    }
                    _ => {
                        let embedded = embedder.embed_chunks(&chunks);
                        self.cache.store(&fingerprint, &embedded);
                        embedded
                    }
                },
                None => vec![],
            }
        };

        self.state = IndexState {
            sources,
            fingerprint,
            embedded,
            chunks,
        };

        Ok(ReindexSummary {
            sources: self.state.sources.len(),
            projects: self.projects.len(),
            chunks: self.state.chunks.len(),
            embedded: self.state.embedded.len(),
            learnings_imported,
            embed_cache_hit,
        })
    }

    // ── Query ────────────────────────────────────────────────────────────

    /// Ranked retrieval over the current index. Semantic/hybrid requests
    /// fall back to keyword ranking while the dense path is unavailable.
    pub fn search(&self, query: &str, mode: SearchMode, top_k: usize) -> Vec<SearchHit> {
        let k = top_k.clamp(1, MAX_TOP_K);
        let pool = 2 * k;

        let dense_available = self.embedder.is_some() && !self.state.embedded.is_empty();
        let mode = if dense_available { mode } else { SearchMode::Keyword };

        let bm25 = if mode == SearchMode::Semantic {
            vec![]
        } else {
            bm25_rank(query, &self.state.chunks, pool)
        };
        let dense = if mode == SearchMode::Keyword {
            vec![]
        } else {
            match &self.embedder {
                Some(embedder) => {
                    dense_rank(&embedder.embed_query(query), &self.state.embedded, pool)
                }
                None => vec![],
            }
        };

        fuse(mode, &bm25, &dense, &self.state.chunks, Utc::now(), k)
            .into_iter()
            .filter_map(|hit| {
                self.state.chunks.get(hit.chunk_idx).map(|chunk| SearchHit {
                    chunk: chunk.clone(),
                    combined: hit.combined,
                    kw: hit.kw,
                    sem: hit.sem,
                    decay: hit.decay,
                })
            })
            .collect()
    }

    /// Route a tool response through the firewall with the learning store
    /// and workspace scope attached. The firewall reads the store; the store
    /// never sees the firewall — the dependency stays one-directional.
    pub fn wrap_response(&mut self, tool_name: &str, text: String, hint: Option<&str>) -> String {
        self.firewall
            .wrap(tool_name, text, hint, &self.learnings, &self.projects)
    }

    /// Full content of one registered source by exact name, case-insensitive.
    pub fn read_source(&self, name: &str) -> Option<(KnowledgeSource, String)> {
        if name.eq_ignore_ascii_case(LEARNINGS_SOURCE) {
            let body = self
                .state
                .chunks
                .iter()
                .filter(|c| c.source == LEARNINGS_SOURCE)
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let source = KnowledgeSource {
                name: LEARNINGS_SOURCE.to_string(),
                path: self.home.join("learnings.json"),
                kind: SourceKind::Markdown,
                project: None,
            };
            return Some((source, body));
        }
        let source = self
            .state
            .sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))?
            .clone();
        let text = std::fs::read_to_string(&source.path).ok()?;
        Some((source, text))
    }

    /// Per-source chunk and embedded-vector counts for the inventory view.
    pub fn source_inventory(&self) -> Vec<(String, usize, usize)> {
        let mut names: Vec<String> = self.state.sources.iter().map(|s| s.name.clone()).collect();
        names.push(LEARNINGS_SOURCE.to_string());

        names
            .into_iter()
            .map(|name| {
                let idxs: Vec<usize> = self
                    .state
                    .chunks
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.source == name)
                    .map(|(i, _)| i)
                    .collect();
                let embedded = self
                    .state
                    .embedded
                    .iter()
                    .filter(|e| idxs.contains(&e.chunk_idx))
                    .count();
                (name, idxs.len(), embedded)
            })
            .collect()
    }
}

// ── File watching ────────────────────────────────────────────────────────────

/// Watch every discovered source; any change starts (or extends) a 500 ms
/// debounce, then triggers a full reindex. The watcher and its registrations
/// live on the debounce thread and are refreshed after each reindex so new
/// sources get watched and removed ones released.
pub fn spawn_watcher(engine: Arc<Mutex<Engine>>) -> Result<()> {
    let (tx, rx) = mpsc::channel::<()>();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })
    .context("creating file watcher")?;

    let initial: Vec<PathBuf> = engine
        .lock()
        .map(|eng| eng.state.sources.iter().map(|s| s.path.clone()).collect())
        .unwrap_or_default();

    std::thread::spawn(move || {
        let mut watcher = watcher;
        let mut watched: Vec<PathBuf> = Vec::new();
        refresh_watches(&mut watcher, &mut watched, initial);

        while rx.recv().is_ok() {
            // Debounce: every further event within the window restarts it.
            while rx.recv_timeout(WATCH_DEBOUNCE).is_ok() {}

            let next = match engine.lock() {
                Ok(mut eng) => {
                    if let Err(e) = eng.reindex() {
                        crate::debug_log!("[contextengine] watch reindex failed: {e}");
                    }
                    eng.state.sources.iter().map(|s| s.path.clone()).collect()
                }
                Err(_) => break,
            };
            refresh_watches(&mut watcher, &mut watched, next);
        }
    });

    Ok(())
}

fn refresh_watches(
    watcher: &mut notify::RecommendedWatcher,
    watched: &mut Vec<PathBuf>,
    next: Vec<PathBuf>,
) {
    for old in watched.iter() {
        if !next.contains(old) {
            let _ = watcher.unwatch(old);
        }
    }
    for path in &next {
        if !watched.contains(path) {
            let _ = watcher.watch(path, RecursiveMode::NonRecursive);
        }
    }
    *watched = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceEntry;

    fn test_engine(workspace: &Path, home: &Path, sources: Vec<SourceEntry>) -> Engine {
        std::env::set_var(crate::embedder::DISABLE_ENV_VAR, "1");
        let config = EngineConfig {
            sources,
            workspaces: vec![workspace.to_path_buf()],
            collect_ops: false,
            collect_system_ops: false,
            ..EngineConfig::default()
        };
        Engine::with_home(home.to_path_buf(), config, None).unwrap()
    }

    #[test]
    fn reindex_ingests_discovered_and_explicit_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(ws.join("api")).unwrap();
        std::fs::write(ws.join("api/CLAUDE.md"), "# Api\n## Deploy\nuse make deploy").unwrap();
        let extra = tmp.path().join("extra.md");
        std::fs::write(&extra, "# Extra\n## Notes\nremember the cache").unwrap();

        let mut engine = test_engine(
            &ws,
            &tmp.path().join("home"),
            vec![SourceEntry { name: "extra".into(), path: extra }],
        );
        let summary = engine.reindex().unwrap();

        assert_eq!(summary.projects, 1);
        assert_eq!(summary.sources, 2);
        assert!(engine.state.chunks.iter().any(|c| c.source == "api/CLAUDE.md"));
        assert!(engine.state.chunks.iter().any(|c| c.source == "extra"));
        // Learnings are projected into the chunk set too.
        assert!(engine.state.chunks.iter().any(|c| c.source == LEARNINGS_SOURCE));
        assert!(!engine.state.fingerprint.is_empty());
    }

    #[test]
    fn fingerprint_changes_iff_content_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(ws.join("api")).unwrap();
        let doc = ws.join("api/CLAUDE.md");
        std::fs::write(&doc, "# A\n## B\nhello").unwrap();

        let mut engine = test_engine(&ws, &tmp.path().join("home"), vec![]);
        engine.reindex().unwrap();
        let fp1 = engine.state.fingerprint.clone();

        engine.reindex().unwrap();
        assert_eq!(engine.state.fingerprint, fp1, "same content, same fingerprint");

        std::fs::write(&doc, "# A\n## B\nhello changed").unwrap();
        engine.reindex().unwrap();
        assert_ne!(engine.state.fingerprint, fp1);
    }

    #[test]
    fn new_content_is_queryable_after_reindex() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(ws.join("api")).unwrap();
        let doc = ws.join("api/CLAUDE.md");
        std::fs::write(&doc, "# A\n## Deploy\nuse blue-green rollout").unwrap();

        let mut engine = test_engine(&ws, &tmp.path().join("home"), vec![]);
        engine.reindex().unwrap();
        let hits = engine.search("blue-green rollout", SearchMode::Hybrid, 5);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk.source, "api/CLAUDE.md");

        std::fs::write(&doc, "# A\n## Deploy\nswitched to canary releases").unwrap();
        engine.reindex().unwrap();
        let hits = engine.search("canary releases", SearchMode::Hybrid, 5);
        assert!(!hits.is_empty());
        assert!(hits[0].chunk.content.contains("canary"));
    }

    #[test]
    fn learning_projection_respects_project_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(ws.join("api")).unwrap();
        std::fs::write(ws.join("api/CLAUDE.md"), "# Api\n## Ops\nbody").unwrap();

        let mut engine = test_engine(&ws, &tmp.path().join("home"), vec![]);
        engine
            .learnings
            .save_rule(LearningCategory::Git, "in-scope rule", "", Some("api"));
        engine
            .learnings
            .save_rule(LearningCategory::Git, "out-of-scope rule", "", Some("billing"));
        engine.reindex().unwrap();

        let projected: Vec<&Chunk> = engine
            .state
            .chunks
            .iter()
            .filter(|c| c.source == LEARNINGS_SOURCE)
            .collect();
        assert!(projected.iter().any(|c| c.content.contains("in-scope rule")));
        assert!(!projected.iter().any(|c| c.content.contains("out-of-scope rule")));
    }

    #[test]
    fn read_source_is_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(ws.join("api")).unwrap();
        std::fs::write(ws.join("api/CLAUDE.md"), "# Api\n## Ops\nbody").unwrap();

        let mut engine = test_engine(&ws, &tmp.path().join("home"), vec![]);
        engine.reindex().unwrap();

        let (source, text) = engine.read_source("API/claude.MD").unwrap();
        assert_eq!(source.name, "api/CLAUDE.md");
        assert!(text.contains("## Ops"));
        assert!(engine.read_source("nope.md").is_none());
    }

    #[test]
    fn markdown_rules_auto_import_into_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(ws.join("api")).unwrap();
        std::fs::write(
            ws.join("api/CLAUDE.md"),
            "# Api\n## Deployment\n### always run migrations first\nSchema drift broke prod twice.\n",
        )
        .unwrap();

        let mut engine = test_engine(&ws, &tmp.path().join("home"), vec![]);
        let first = engine.reindex().unwrap();
        assert_eq!(first.learnings_imported, 1);
        let second = engine.reindex().unwrap();
        assert_eq!(second.learnings_imported, 0, "auto-import is idempotent");

        let l = engine
            .learnings
            .all()
            .iter()
            .find(|l| l.rule == "always run migrations first")
            .unwrap();
        assert_eq!(l.category, LearningCategory::Deployment);
        assert_eq!(l.project.as_deref(), Some("api"));
    }
}
