use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::chunk::{KnowledgeSource, ProjectDirectory, SourceKind};
use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// Workspace resolution — projects and declarative source discovery.
//
// A "project" is a first-level directory under a declared workspace root;
// its directory name is the scoping identity for learnings and collectors.
// ---------------------------------------------------------------------------

/// Enumerate first-level project directories under the configured roots.
/// Hidden directories are skipped; order is root order, then name order.
pub fn discover_projects(workspaces: &[PathBuf]) -> Vec<ProjectDirectory> {
    let mut projects: Vec<ProjectDirectory> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for root in workspaces {
        let Ok(entries) = std::fs::read_dir(root) else {
            eprintln!("[contextengine] workspace root not readable: {}", root.display());
            continue;
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('.'))
                    .unwrap_or(false)
            })
            .collect();
        dirs.sort();

        for dir in dirs {
            if !seen.insert(dir.clone()) {
                continue;
            }
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            projects.push(ProjectDirectory { name, path: dir });
        }
    }

    projects
}

fn kind_for_path(path: &Path) -> SourceKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ts" | "js" | "mjs" | "mts" | "py") => SourceKind::Code,
        _ => SourceKind::Markdown,
    }
}

/// Resolve the full source list: explicit config entries first (paths
/// relative to the config file), then pattern matches under every workspace
/// project. Duplicate paths keep their first registration.
pub fn discover_sources(cfg: &EngineConfig, config_dir: Option<&Path>) -> Vec<KnowledgeSource> {
    let mut sources: Vec<KnowledgeSource> = Vec::new();
    let mut seen_paths: HashSet<PathBuf> = HashSet::new();

    for entry in &cfg.sources {
        let path = if entry.path.is_absolute() {
            entry.path.clone()
        } else {
            config_dir.unwrap_or(Path::new(".")).join(&entry.path)
        };
        if seen_paths.insert(path.clone()) {
            sources.push(KnowledgeSource {
                name: entry.name.clone(),
                kind: kind_for_path(&path),
                path,
                project: None,
            });
        }
    }

    for root in &cfg.workspaces {
        for pattern in &cfg.patterns {
            // `<root>/*/<pattern>` — one candidate per first-level project.
            // The pattern itself may carry glob syntax (e.g. ".cursor/rules").
            let glob_expr = root.join("*").join(pattern);
            let Ok(paths) = glob::glob(&glob_expr.to_string_lossy()) else {
                continue;
            };
            let mut found: Vec<PathBuf> = paths.flatten().filter(|p| p.is_file()).collect();
            found.sort();

            for path in found {
                if !seen_paths.insert(path.clone()) {
                    continue;
                }
                let project = path
                    .strip_prefix(root)
                    .ok()
                    .and_then(|rel| rel.components().next())
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .unwrap_or_default();
                let file = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                sources.push(KnowledgeSource {
                    name: format!("{project}/{file}"),
                    kind: kind_for_path(&path),
                    path,
                    project: Some(project),
                });
            }
        }
    }

    sources
}
