use chrono::Utc;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use crate::chunk::{Chunk, ProjectDirectory};

// ---------------------------------------------------------------------------
// Operational collectors — read-only snapshots of git, manifests, env, and
// the host process table.
//
// Contract: a collector never fails. Missing tools, permission errors,
// timeouts, and non-zero exits all collapse to "no chunks". The retrieval
// path must stay available no matter how broken the host is.
// ---------------------------------------------------------------------------

const SHELL_TIMEOUT: Duration = Duration::from_secs(10);
const GIT_LOG_LIMIT: usize = 50;
const GIT_LOG_BATCH: usize = 10;
const HISTORY_LIMIT: usize = 200;

/// Run a command, capture stdout. Any failure (spawn error, timeout,
/// non-zero exit) yields an empty string.
pub async fn sh(cwd: Option<&Path>, program: &str, args: &[&str]) -> String {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    match tokio::time::timeout(SHELL_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        _ => String::new(),
    }
}

// ── Secret redaction ─────────────────────────────────────────────────────────

/// Replace values of secret-looking keys with `[REDACTED]`. Applied to every
/// collector output before it becomes a chunk: `.env` and compose files
/// verbatim, shell-history lines, anything else that might carry credentials.
pub fn redact_secrets(text: &str) -> String {
    let re = Regex::new(
        r#"(?i)([A-Za-z0-9_]*(?:PASSWORD|SECRET|KEY|TOKEN|CREDENTIAL|AUTH|PRIVATE|API_KEY|DB_PASSWORD|MAIL_PASSWORD|JWT_SECRET|APP_KEY|ENCRYPT)[A-Za-z0-9_]*\s*[=:]\s*)("[^"]*"|'[^']*'|\S+)"#,
    )
    .unwrap();
    re.replace_all(text, "${1}[REDACTED]").into_owned()
}

fn stamped(source: &str, section: &str, content: String) -> Option<Chunk> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(Chunk::new(source, section, trimmed.to_string(), 1, 1).with_indexed_at(Utc::now()))
}

// ── Project-scoped collectors ────────────────────────────────────────────────

async fn collect_git(project: &ProjectDirectory) -> Vec<Chunk> {
    let dir = Some(project.path.as_path());
    let source = format!("git:{}", project.name);
    let mut chunks: Vec<Chunk> = Vec::new();

    let branch = sh(dir, "git", &["branch", "--show-current"]).await;
    if branch.trim().is_empty() {
        // Not a git repo (or git missing) — nothing to report.
        return chunks;
    }
    let remotes = sh(dir, "git", &["remote", "-v"]).await;
    let diff_stat = sh(dir, "git", &["diff", "--stat"]).await;
    let header = format!(
        "branch: {}\nremotes:\n{}\nuncommitted:\n{}",
        branch.trim(),
        remotes.trim(),
        diff_stat.trim()
    );
    chunks.extend(stamped(&source, "status", header));

    let log = sh(
        dir,
        "git",
        &[
            "log",
            "--pretty=format:%h %ad %an %s",
            "--date=short",
            &format!("-{GIT_LOG_LIMIT}"),
        ],
    )
    .await;
    let lines: Vec<&str> = log.lines().filter(|l| !l.trim().is_empty()).collect();
    for (i, batch) in lines.chunks(GIT_LOG_BATCH).enumerate() {
        let first = i * GIT_LOG_BATCH + 1;
        let last = first + batch.len() - 1;
        chunks.extend(stamped(
            &source,
            &format!("commits {first}-{last}"),
            batch.join("\n"),
        ));
    }

    chunks
}

fn json_section(value: &serde_json::Value, key: &str) -> Option<String> {
    let v = value.get(key)?;
    if v.is_null() {
        return None;
    }
    serde_json::to_string_pretty(v).ok()
}

fn collect_manifests(project: &ProjectDirectory) -> Vec<Chunk> {
    let source = format!("manifest:{}", project.name);
    let mut chunks: Vec<Chunk> = Vec::new();

    // package.json
    if let Ok(text) = std::fs::read_to_string(project.path.join("package.json")) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
            let name = v.get("name").and_then(|n| n.as_str()).unwrap_or("unnamed");
            let version = v.get("version").and_then(|n| n.as_str()).unwrap_or("0.0.0");
            let desc = v.get("description").and_then(|n| n.as_str()).unwrap_or("");
            chunks.extend(stamped(
                &source,
                "package.json",
                format!("{name} {version}\n{desc}"),
            ));
            for key in ["scripts", "dependencies", "devDependencies"] {
                if let Some(body) = json_section(&v, key) {
                    chunks.extend(stamped(&source, &format!("package.json {key}"), body));
                }
            }
        }
    }

    // composer.json
    if let Ok(text) = std::fs::read_to_string(project.path.join("composer.json")) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
            let name = v.get("name").and_then(|n| n.as_str()).unwrap_or("unnamed");
            chunks.extend(stamped(&source, "composer.json", name.to_string()));
            for key in ["require", "require-dev", "scripts"] {
                if let Some(body) = json_section(&v, key) {
                    chunks.extend(stamped(&source, &format!("composer.json {key}"), body));
                }
            }
        }
    }

    // Cargo.toml
    if let Ok(text) = std::fs::read_to_string(project.path.join("Cargo.toml")) {
        if let Ok(v) = text.parse::<toml::Value>() {
            if let Some(pkg) = v.get("package") {
                let name = pkg.get("name").and_then(|n| n.as_str()).unwrap_or("unnamed");
                let version = pkg.get("version").and_then(|n| n.as_str()).unwrap_or("0.0.0");
                chunks.extend(stamped(&source, "Cargo.toml", format!("{name} {version}")));
            }
            for key in ["dependencies", "dev-dependencies"] {
                if let Some(deps) = v.get(key).and_then(|d| d.as_table()) {
                    let body = deps
                        .iter()
                        .map(|(k, val)| match val.as_str() {
                            Some(ver) => format!("{k} = {ver}"),
                            None => k.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    chunks.extend(stamped(&source, &format!("Cargo.toml {key}"), body));
                }
            }
        }
    }

    chunks
}

fn collect_env_file(project: &ProjectDirectory) -> Vec<Chunk> {
    let Ok(text) = std::fs::read_to_string(project.path.join(".env")) else {
        return vec![];
    };
    let body: String = text
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    stamped(
        &format!("env:{}", project.name),
        "environment",
        redact_secrets(&body),
    )
    .into_iter()
    .collect()
}

fn collect_compose_files(project: &ProjectDirectory) -> Vec<Chunk> {
    let source = format!("compose:{}", project.name);
    let mut chunks: Vec<Chunk> = Vec::new();
    for name in [
        "docker-compose.yml",
        "docker-compose.yaml",
        "compose.yml",
        "compose.yaml",
    ] {
        if let Ok(text) = std::fs::read_to_string(project.path.join(name)) {
            chunks.extend(stamped(&source, name, redact_secrets(&text)));
        }
    }
    chunks
}

fn collect_ecosystem_files(project: &ProjectDirectory) -> Vec<Chunk> {
    let source = format!("pm2:{}", project.name);
    let mut chunks: Vec<Chunk> = Vec::new();
    for name in ["ecosystem.config.js", "ecosystem.config.cjs"] {
        if let Ok(text) = std::fs::read_to_string(project.path.join(name)) {
            chunks.extend(stamped(&source, name, redact_secrets(&text)));
        }
    }
    chunks
}

/// All project-scoped collectors for one workspace project, in a fixed order.
pub async fn collect_project(project: &ProjectDirectory) -> Vec<Chunk> {
    let mut chunks = collect_git(project).await;
    chunks.extend(collect_manifests(project));
    chunks.extend(collect_env_file(project));
    chunks.extend(collect_compose_files(project));
    chunks.extend(collect_ecosystem_files(project));
    chunks
}

// ── System-scoped collectors ─────────────────────────────────────────────────

fn history_lines(raw: &str) -> Vec<String> {
    let mut recent: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    // Newest last in the file; walk backwards so dedup keeps the most recent
    // occurrence, then restore chronological order.
    for line in raw.lines().rev() {
        // zsh extended history: ": 1700000000:0;command"
        let cmd = match line.split_once(';') {
            Some((meta, rest)) if meta.starts_with(": ") => rest,
            _ => line,
        };
        let cmd = cmd.trim();
        if cmd.is_empty() || !seen.insert(cmd.to_string()) {
            continue;
        }
        recent.push(redact_secrets(cmd));
        if recent.len() >= HISTORY_LIMIT {
            break;
        }
    }
    recent.reverse();
    recent
}

fn collect_shell_history() -> Vec<Chunk> {
    let Some(home) = dirs::home_dir() else {
        return vec![];
    };
    for name in [".zsh_history", ".bash_history"] {
        if let Ok(raw) = std::fs::read_to_string(home.join(name)) {
            let lines = history_lines(&raw);
            if lines.is_empty() {
                continue;
            }
            return stamped("shell-history", name, lines.join("\n"))
                .into_iter()
                .collect();
        }
    }
    vec![]
}

async fn collect_docker() -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let ps = sh(
        None,
        "docker",
        &["ps", "--format", "{{.Names}} {{.Image}} {{.Status}} {{.Ports}}"],
    )
    .await;
    chunks.extend(stamped("docker", "containers", ps));
    let images = sh(
        None,
        "docker",
        &["images", "--format", "{{.Repository}}:{{.Tag}} {{.Size}}"],
    )
    .await;
    chunks.extend(stamped("docker", "images", images));
    chunks
}

async fn collect_process_manager() -> Vec<Chunk> {
    let raw = sh(None, "pm2", &["jlist"]).await;
    if raw.trim().is_empty() {
        return vec![];
    }
    // Compact the JSON to the fields that matter for retrieval.
    let body = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Array(apps)) => apps
            .iter()
            .map(|a| {
                let name = a.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                let status = a
                    .pointer("/pm2_env/status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?");
                let cwd = a
                    .pointer("/pm2_env/pm_cwd")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                format!("{name} {status} {cwd}")
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => raw,
    };
    stamped("pm2", "processes", body).into_iter().collect()
}

fn vhost_directives(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| {
            l.starts_with("server_name")
                || l.starts_with("listen")
                || l.starts_with("root")
                || l.starts_with("proxy_pass")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_nginx() -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    for conf_dir in ["/etc/nginx/sites-enabled", "/etc/nginx/conf.d"] {
        let Ok(entries) = std::fs::read_dir(conf_dir) else {
            continue;
        };
        let mut paths: Vec<std::path::PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            chunks.extend(stamped("nginx", &name, vhost_directives(&text)));
        }
    }
    chunks
}

async fn collect_cron() -> Vec<Chunk> {
    let raw = sh(None, "crontab", &["-l"]).await;
    let body: String = raw
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    stamped("cron", "scheduled jobs", body).into_iter().collect()
}

/// System-scoped collectors, run once per reindex.
pub async fn collect_system() -> Vec<Chunk> {
    let mut chunks = collect_shell_history();
    chunks.extend(collect_docker().await);
    chunks.extend(collect_process_manager().await);
    chunks.extend(collect_nginx());
    chunks.extend(collect_cron().await);
    chunks
}
