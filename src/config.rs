use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Engine configuration.
//
// Discovery order (first hit wins):
//   1. $CONTEXTENGINE_CONFIG — explicit path
//   2. ./contextengine.config.json — project-local
//   3. ~/.contextengine/config.json — user-global
//
// A missing or unparseable file falls back to defaults; configuration
// problems must never take the engine down.
// ---------------------------------------------------------------------------

pub const CONFIG_ENV_VAR: &str = "CONTEXTENGINE_CONFIG";
pub const CONFIG_FILE_NAME: &str = "contextengine.config.json";

/// Instruction-file names sought under each workspace project by default.
pub const DEFAULT_PATTERNS: &[&str] = &[
    ".github/copilot-instructions.md",
    ".github/SKILLS.md",
    "CLAUDE.md",
    ".cursorrules",
    ".cursor/rules",
    "AGENTS.md",
];

/// An explicitly declared source: `{name, path}`. Relative paths resolve
/// against the directory the config file was found in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub path: PathBuf,
}

/// One plugin adapter declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterEntry {
    pub name: String,
    pub module: String,
    pub config: serde_json::Value,
    pub enabled: bool,
}

impl Default for AdapterEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            module: String::new(),
            config: serde_json::Value::Null,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Explicit `{name, path}` source entries.
    pub sources: Vec<SourceEntry>,
    /// Workspace roots to auto-discover projects under.
    pub workspaces: Vec<PathBuf>,
    /// Filenames (glob-capable) sought under each workspace project.
    pub patterns: Vec<String>,
    /// Per-project relative directories to scan for code.
    pub code_dirs: Vec<String>,
    /// Run project-scoped operational collectors.
    pub collect_ops: bool,
    /// Run system-scoped operational collectors.
    pub collect_system_ops: bool,
    pub adapters: Vec<AdapterEntry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: vec![],
            workspaces: vec![],
            patterns: DEFAULT_PATTERNS.iter().map(|s| s.to_string()).collect(),
            code_dirs: vec![],
            collect_ops: true,
            collect_system_ops: true,
            adapters: vec![],
        }
    }
}

/// Load the config. Returns the parsed config plus the directory it was
/// found in (for resolving relative source paths).
pub fn load_config() -> (EngineConfig, Option<PathBuf>) {
    for candidate in candidate_paths() {
        let Ok(text) = std::fs::read_to_string(&candidate) else {
            continue;
        };
        match serde_json::from_str::<EngineConfig>(&text) {
            Ok(cfg) => {
                let dir = candidate.parent().map(Path::to_path_buf);
                return (cfg, dir);
            }
            Err(e) => {
                eprintln!(
                    "[contextengine] malformed config {} ({e}); using defaults",
                    candidate.display()
                );
                return (EngineConfig::default(), None);
            }
        }
    }
    (EngineConfig::default(), None)
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    if let Ok(p) = std::env::var(CONFIG_ENV_VAR) {
        if !p.trim().is_empty() {
            out.push(PathBuf::from(p.trim()));
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        out.push(cwd.join(CONFIG_FILE_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(".contextengine").join("config.json"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_collectors_and_standard_patterns() {
        let cfg = EngineConfig::default();
        assert!(cfg.collect_ops);
        assert!(cfg.collect_system_ops);
        assert!(cfg.patterns.iter().any(|p| p == "CLAUDE.md"));
        assert!(cfg.patterns.iter().any(|p| p.ends_with("copilot-instructions.md")));
    }

    #[test]
    fn parses_camel_case_fields() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{
                "sources": [{"name": "deploy-guide", "path": "docs/deploy.md"}],
                "workspaces": ["/srv/projects"],
                "codeDirs": ["src", "app"],
                "collectOps": false,
                "adapters": [{"name": "jira", "module": "./jira.so", "config": {"url": "x"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.code_dirs, vec!["src", "app"]);
        assert!(!cfg.collect_ops);
        assert!(cfg.collect_system_ops, "unset field keeps its default");
        assert!(cfg.adapters[0].enabled, "adapter enabled defaults true");
    }
}
