use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Learning store — durable operational rules with project scoping.
//
// Flat JSON file at ~/.contextengine/learnings.json, rewritten whole on every
// mutation (atomic temp + rename). Dedup key is (category, normalized rule
// text): re-saving an existing rule updates its context/tags and bumps
// `updated` instead of appending. A small bundled starter set is merged on
// first load and never overwrites user records.
// ---------------------------------------------------------------------------

const STORE_VERSION: u32 = 2;
const STORE_FILE: &str = "learnings.json";

/// Closed category set. Markdown import normalizes free-form headings onto
/// these via the keyword map in `LearningCategory::normalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LearningCategory {
    Deployment,
    Docker,
    Git,
    Database,
    Testing,
    Security,
    Performance,
    Debugging,
    Api,
    Frontend,
    Backend,
    Infrastructure,
    Ci,
    Configuration,
    Dependencies,
    Monitoring,
    Networking,
    Workflow,
}

impl LearningCategory {
    pub const ALL: &'static [LearningCategory] = &[
        Self::Deployment,
        Self::Docker,
        Self::Git,
        Self::Database,
        Self::Testing,
        Self::Security,
        Self::Performance,
        Self::Debugging,
        Self::Api,
        Self::Frontend,
        Self::Backend,
        Self::Infrastructure,
        Self::Ci,
        Self::Configuration,
        Self::Dependencies,
        Self::Monitoring,
        Self::Networking,
        Self::Workflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Docker => "docker",
            Self::Git => "git",
            Self::Database => "database",
            Self::Testing => "testing",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Debugging => "debugging",
            Self::Api => "api",
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Infrastructure => "infrastructure",
            Self::Ci => "ci",
            Self::Configuration => "configuration",
            Self::Dependencies => "dependencies",
            Self::Monitoring => "monitoring",
            Self::Networking => "networking",
            Self::Workflow => "workflow",
        }
    }

    /// Map a free-form heading or CLI string onto the closed set.
    pub fn normalize(raw: &str) -> Option<LearningCategory> {
        let lower = raw.trim().to_lowercase();
        for cat in Self::ALL {
            if lower == cat.as_str() {
                return Some(*cat);
            }
        }
        // "Database stuff", "Deployment notes" — category name anywhere in the heading.
        for cat in Self::ALL {
            if lower.contains(cat.as_str()) {
                return Some(*cat);
            }
        }
        // Keyword map for common synonyms in imported docs.
        let pairs: &[(&str, LearningCategory)] = &[
            ("deploy", Self::Deployment),
            ("release", Self::Deployment),
            ("container", Self::Docker),
            ("compose", Self::Docker),
            ("version control", Self::Git),
            ("branch", Self::Git),
            ("db", Self::Database),
            ("sql", Self::Database),
            ("migration", Self::Database),
            ("test", Self::Testing),
            ("qa", Self::Testing),
            ("auth", Self::Security),
            ("vulnerab", Self::Security),
            ("perf", Self::Performance),
            ("optimiz", Self::Performance),
            ("debug", Self::Debugging),
            ("troubleshoot", Self::Debugging),
            ("endpoint", Self::Api),
            ("rest", Self::Api),
            ("ui", Self::Frontend),
            ("css", Self::Frontend),
            ("server-side", Self::Backend),
            ("infra", Self::Infrastructure),
            ("provision", Self::Infrastructure),
            ("pipeline", Self::Ci),
            ("ci/cd", Self::Ci),
            ("config", Self::Configuration),
            ("setting", Self::Configuration),
            ("dependen", Self::Dependencies),
            ("package", Self::Dependencies),
            ("monitor", Self::Monitoring),
            ("alert", Self::Monitoring),
            ("network", Self::Networking),
            ("dns", Self::Networking),
            ("process", Self::Workflow),
            ("habit", Self::Workflow),
        ];
        pairs
            .iter()
            .find(|(kw, _)| lower.contains(kw))
            .map(|(_, cat)| *cat)
    }
}

impl std::fmt::Display for LearningCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tech keywords scanned out of rule + context to derive the tag set.
const TECH_KEYWORDS: &[&str] = &[
    "docker", "kubernetes", "nginx", "redis", "postgres", "mysql", "mongodb", "node", "php",
    "laravel", "react", "vue", "typescript", "python", "rust", "git", "aws", "linux", "pm2",
    "composer", "npm", "vite", "webpack", "stripe", "graphql",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Learning {
    pub id: String,
    pub category: LearningCategory,
    /// Concise imperative, e.g. "pin node version".
    pub rule: String,
    pub context: String,
    /// Empty/absent means universal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    count: usize,
    learnings: Vec<Learning>,
}

/// Starter rules seeded on first load. Routed through `save_rule`, so a user
/// record with the same dedup key always wins.
const STARTER_SET: &[(LearningCategory, &str, &str)] = &[
    (
        LearningCategory::Git,
        "commit in small focused units",
        "One logical change per commit keeps history bisectable.",
    ),
    (
        LearningCategory::Deployment,
        "verify health endpoints after every deploy",
        "A deploy is not done until the service answers.",
    ),
    (
        LearningCategory::Testing,
        "run the affected test suite before pushing",
        "Catch regressions locally where iteration is cheapest.",
    ),
    (
        LearningCategory::Workflow,
        "save session state before long running tasks",
        "Persist intent and partial results so a restart can resume.",
    ),
];

fn base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out: Vec<u8> = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Base36 time plus base36 randomness, always >= 8 chars.
fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let mut id = format!("{}{}", base36(millis), base36(rand::random::<u32>() as u128));
    while id.len() < 8 {
        id.push('0');
    }
    id
}

fn normalize_rule(rule: &str) -> String {
    rule.trim().to_lowercase()
}

fn derive_tags(category: LearningCategory, rule: &str, context: &str) -> Vec<String> {
    let haystack = format!("{} {}", rule, context).to_lowercase();
    let mut tags = vec![category.as_str().to_string()];
    for kw in TECH_KEYWORDS {
        if haystack.contains(kw) && !tags.iter().any(|t| t == kw) {
            tags.push(kw.to_string());
        }
    }
    tags
}

fn tokenize_query(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

pub struct LearningStore {
    path: PathBuf,
    learnings: Vec<Learning>,
}

impl LearningStore {
    /// Open (or create) the store under `dir`. First creation seeds the
    /// starter set; an existing file is loaded as-is, corrupted files reset
    /// to empty with a warning rather than blocking startup.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(STORE_FILE);
        let existed = path.exists();
        let learnings = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<StoreFile>(&text) {
                Ok(file) => file.learnings,
                Err(e) => {
                    eprintln!("[contextengine] learnings store unreadable ({e}); starting empty");
                    vec![]
                }
            },
            Err(_) => vec![],
        };

        let mut store = Self { path, learnings };
        if !existed {
            for (cat, rule, ctx) in STARTER_SET {
                store.upsert(*cat, rule, ctx, None);
            }
            store.persist();
        }
        store
    }

    pub fn all(&self) -> &[Learning] {
        &self.learnings
    }

    /// Save or dedup-update a rule. Returns the record id and whether an
    /// existing record was updated.
    pub fn save_rule(
        &mut self,
        category: LearningCategory,
        rule: &str,
        context: &str,
        project: Option<&str>,
    ) -> (String, bool) {
        let result = self.upsert(category, rule, context, project);
        self.persist();
        result
    }

    fn upsert(
        &mut self,
        category: LearningCategory,
        rule: &str,
        context: &str,
        project: Option<&str>,
    ) -> (String, bool) {
        let key = normalize_rule(rule);
        let now = Utc::now();

        if let Some(existing) = self
            .learnings
            .iter_mut()
            .find(|l| l.category == category && normalize_rule(&l.rule) == key)
        {
            existing.context = context.to_string();
            existing.tags = derive_tags(category, &existing.rule, context);
            if let Some(p) = project {
                existing.project = Some(p.to_string());
            }
            existing.updated = now;
            return (existing.id.clone(), true);
        }

        let id = generate_id();
        self.learnings.push(Learning {
            id: id.clone(),
            category,
            rule: rule.trim().to_string(),
            context: context.to_string(),
            project: project.map(str::to_string),
            tags: derive_tags(category, rule, context),
            created: now,
            updated: now,
        });
        (id, false)
    }

    fn in_scope(learning: &Learning, scope: Option<&[String]>) -> bool {
        match (&learning.project, scope) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(p), Some(names)) => names.iter().any(|n| n.eq_ignore_ascii_case(p)),
        }
    }

    /// List learnings, optionally filtered by category and project scope.
    /// Scoped listing returns universal records plus records whose project
    /// matches a name in `scope` (case-insensitive).
    pub fn list(&self, category: Option<LearningCategory>, scope: Option<&[String]>) -> Vec<&Learning> {
        self.learnings
            .iter()
            .filter(|l| category.map(|c| l.category == c).unwrap_or(true))
            .filter(|l| Self::in_scope(l, scope))
            .collect()
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.learnings.len();
        self.learnings.retain(|l| l.id != id);
        let removed = self.learnings.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    /// Token-overlap search with bonuses for rule-text and category hits.
    pub fn search(&self, query: &str, scope: Option<&[String]>, limit: usize) -> Vec<&Learning> {
        let tokens = tokenize_query(query);
        if tokens.is_empty() {
            return vec![];
        }

        let mut scored: Vec<(i32, &Learning)> = self
            .learnings
            .iter()
            .filter(|l| Self::in_scope(l, scope))
            .filter_map(|l| {
                let rule = l.rule.to_lowercase();
                let context = l.context.to_lowercase();
                let mut score = 0i32;
                for t in &tokens {
                    if rule.contains(t.as_str()) {
                        score += 3;
                    } else if context.contains(t.as_str()) {
                        score += 1;
                    }
                    if t == l.category.as_str() || l.tags.iter().any(|tag| tag == t) {
                        score += 2;
                    }
                }
                (score > 0).then_some((score, l))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.rule.cmp(&b.1.rule)));
        scored.into_iter().take(limit).map(|(_, l)| l).collect()
    }

    // ── Import ───────────────────────────────────────────────────────────

    /// Import learnings from a Markdown or JSON file. Every parsed entry is
    /// routed through the dedup upsert; returns the number of *new* records.
    pub fn import_from_file(
        &mut self,
        path: &Path,
        default_category: LearningCategory,
        project: Option<&str>,
    ) -> Result<usize> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let created = if is_json {
            self.import_json(&text, default_category, project)?
        } else {
            self.import_markdown(&text, default_category, project)
        };
        self.persist();
        Ok(created)
    }

    fn import_json(
        &mut self,
        text: &str,
        default_category: LearningCategory,
        project: Option<&str>,
    ) -> Result<usize> {
        #[derive(Deserialize)]
        struct Entry {
            category: Option<String>,
            rule: String,
            #[serde(default)]
            context: String,
            project: Option<String>,
        }
        let entries: Vec<Entry> = serde_json::from_str(text).context("parsing learning JSON")?;
        let mut created = 0usize;
        for e in entries {
            let cat = e
                .category
                .as_deref()
                .and_then(LearningCategory::normalize)
                .unwrap_or(default_category);
            let proj = e.project.as_deref().or(project);
            let (_, updated) = self.upsert(cat, &e.rule, &e.context, proj);
            if !updated {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Markdown grammar: H2 introduces a category, H3 a rule, H4 and
    /// bullets/tables accumulate context. The inline bullet form
    /// `- [category] rule → context` is accepted anywhere.
    pub fn import_markdown(
        &mut self,
        text: &str,
        default_category: LearningCategory,
        project: Option<&str>,
    ) -> usize {
        let inline_re =
            regex::Regex::new(r"^\s*[-*]\s*\[([^\]]+)\]\s*(.+?)(?:\s*(?:→|->)\s*(.*))?$").unwrap();

        let mut category = default_category;
        let mut rule: Option<String> = None;
        let mut context_lines: Vec<String> = Vec::new();
        let mut created = 0usize;

        let flush = |store: &mut Self,
                     cat: LearningCategory,
                     rule: &mut Option<String>,
                     ctx: &mut Vec<String>|
         -> usize {
            let mut new = 0usize;
            if let Some(r) = rule.take() {
                let (_, updated) = store.upsert(cat, &r, ctx.join("\n").trim(), project);
                if !updated {
                    new = 1;
                }
            }
            ctx.clear();
            new
        };

        for line in text.lines() {
            let trimmed = line.trim_end();

            if let Some(title) = trimmed.strip_prefix("## ") {
                created += flush(self, category, &mut rule, &mut context_lines);
                category = LearningCategory::normalize(title).unwrap_or(default_category);
            } else if let Some(title) = trimmed.strip_prefix("### ") {
                created += flush(self, category, &mut rule, &mut context_lines);
                rule = Some(title.trim().to_string());
            } else if let Some(title) = trimmed.strip_prefix("#### ") {
                context_lines.push(title.trim().to_string());
            } else if let Some(caps) = inline_re.captures(trimmed) {
                match LearningCategory::normalize(&caps[1]) {
                    Some(cat) => {
                        let inline_rule = caps[2].trim().to_string();
                        let inline_ctx = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");
                        let (_, updated) = self.upsert(cat, &inline_rule, inline_ctx, project);
                        if !updated {
                            created += 1;
                        }
                    }
                    // Task-list checkboxes and other bracketed bullets are
                    // context for the current rule, not entries.
                    None => {
                        if rule.is_some() {
                            context_lines.push(trimmed.trim().to_string());
                        }
                    }
                }
            } else if trimmed.trim_start().starts_with(['-', '*', '|']) && rule.is_some() {
                context_lines.push(trimmed.trim().to_string());
            }
        }
        created += flush(self, category, &mut rule, &mut context_lines);

        created
    }

    // ── Persistence ──────────────────────────────────────────────────────

    fn persist(&self) {
        let file = StoreFile {
            version: STORE_VERSION,
            count: self.learnings.len(),
            learnings: self.learnings.clone(),
        };
        let Ok(text) = serde_json::to_string_pretty(&file) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("json.tmp");
        if std::fs::write(&tmp, text).and_then(|_| std::fs::rename(&tmp, &self.path)).is_err() {
            eprintln!("[contextengine] failed to persist learnings store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_store() -> (tempfile::TempDir, LearningStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LearningStore::open(tmp.path());
        (tmp, store)
    }

    #[test]
    fn first_open_seeds_starter_set() {
        let (_tmp, store) = fresh_store();
        assert_eq!(store.all().len(), STARTER_SET.len());
        assert!(store.all().iter().all(|l| l.id.len() >= 8));
    }

    #[test]
    fn resave_updates_in_place_keeping_id() {
        let (_tmp, mut store) = fresh_store();
        let (id1, updated1) =
            store.save_rule(LearningCategory::Deployment, "pin node version", "ctx1", None);
        let (id2, updated2) =
            store.save_rule(LearningCategory::Deployment, "Pin Node Version", "ctx2", None);
        assert!(!updated1);
        assert!(updated2);
        assert_eq!(id1, id2);

        let matches: Vec<_> = store
            .all()
            .iter()
            .filter(|l| normalize_rule(&l.rule) == "pin node version")
            .collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].context, "ctx2");
    }

    #[test]
    fn same_rule_in_other_category_is_a_new_record() {
        let (_tmp, mut store) = fresh_store();
        store.save_rule(LearningCategory::Deployment, "pin node version", "a", None);
        store.save_rule(LearningCategory::Ci, "pin node version", "b", None);
        let hits = store
            .all()
            .iter()
            .filter(|l| normalize_rule(&l.rule) == "pin node version")
            .count();
        assert_eq!(hits, 2);
    }

    #[test]
    fn scoped_list_unions_universal_and_matching_projects() {
        let (_tmp, mut store) = fresh_store();
        store.save_rule(LearningCategory::Git, "universal rule", "", None);
        store.save_rule(LearningCategory::Git, "api rule", "", Some("api"));
        store.save_rule(LearningCategory::Git, "other rule", "", Some("billing"));

        let scope = vec!["API".to_string(), "web".to_string()];
        let listed = store.list(Some(LearningCategory::Git), Some(&scope));
        let rules: Vec<&str> = listed.iter().map(|l| l.rule.as_str()).collect();
        assert!(rules.contains(&"universal rule"));
        assert!(rules.contains(&"api rule"), "case-insensitive project match");
        assert!(!rules.contains(&"other rule"));
    }

    #[test]
    fn tags_include_category_and_detected_tech() {
        let (_tmp, mut store) = fresh_store();
        store.save_rule(
            LearningCategory::Docker,
            "rebuild images after base bump",
            "nginx and redis images lag otherwise",
            None,
        );
        let l = store
            .all()
            .iter()
            .find(|l| l.rule.starts_with("rebuild"))
            .unwrap();
        assert!(l.tags.contains(&"docker".to_string()));
        assert!(l.tags.contains(&"nginx".to_string()));
        assert!(l.tags.contains(&"redis".to_string()));
    }

    #[test]
    fn search_prefers_rule_hits_over_context_hits() {
        let (_tmp, mut store) = fresh_store();
        store.save_rule(LearningCategory::Database, "backup postgres nightly", "", None);
        store.save_rule(
            LearningCategory::Workflow,
            "write a runbook",
            "covers postgres recovery too",
            None,
        );
        let hits = store.search("postgres", None, 10);
        assert_eq!(hits[0].rule, "backup postgres nightly");
    }

    #[test]
    fn markdown_import_is_idempotent() {
        let (_tmp, mut store) = fresh_store();
        let doc = "## Deployment\n### pin node version\nUse the version in .nvmrc.\n- CI images must match\n### warm caches after deploy\n\n## Database stuff\n### vacuum weekly\n";
        let first = store.import_markdown(doc, LearningCategory::Workflow, None);
        let count_after_first = store.all().len();
        let second = store.import_markdown(doc, LearningCategory::Workflow, None);
        assert_eq!(first, 3);
        assert_eq!(second, 0, "second import must create nothing");
        assert_eq!(store.all().len(), count_after_first);
    }

    #[test]
    fn markdown_import_reads_categories_rules_and_context() {
        let (_tmp, mut store) = fresh_store();
        let doc = "## Deployment\n### pin node version\nUse the version in .nvmrc.\n- CI images must match\n";
        store.import_markdown(doc, LearningCategory::Workflow, Some("api"));
        let l = store
            .all()
            .iter()
            .find(|l| l.rule == "pin node version")
            .unwrap();
        assert_eq!(l.category, LearningCategory::Deployment);
        assert!(l.context.contains("CI images must match"));
        assert_eq!(l.project.as_deref(), Some("api"));
    }

    #[test]
    fn inline_bullet_form_parses_category_rule_context() {
        let (_tmp, mut store) = fresh_store();
        store.import_markdown(
            "- [docker] prune volumes monthly → disk filled twice in prod\n",
            LearningCategory::Workflow,
            None,
        );
        let l = store
            .all()
            .iter()
            .find(|l| l.rule == "prune volumes monthly")
            .unwrap();
        assert_eq!(l.category, LearningCategory::Docker);
        assert_eq!(l.context, "disk filled twice in prod");
    }

    #[test]
    fn delete_removes_by_id() {
        let (_tmp, mut store) = fresh_store();
        let (id, _) = store.save_rule(LearningCategory::Git, "doomed", "", None);
        assert!(store.delete(&id));
        assert!(!store.delete(&id));
    }

    #[test]
    fn store_roundtrips_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let before = {
            let mut store = LearningStore::open(tmp.path());
            store.save_rule(LearningCategory::Security, "rotate api tokens", "quarterly", None);
            store.all().len()
        };
        let store = LearningStore::open(tmp.path());
        assert_eq!(store.all().len(), before);
        assert!(store.all().iter().any(|l| l.rule == "rotate api tokens"));
    }
}
