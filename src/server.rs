use anyhow::Result;
use serde_json::json;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use crate::firewall::ObligationStatus;
use crate::fuser::SearchMode;
use crate::indexer::{spawn_watcher, Engine, MAX_TOP_K};
use crate::learnings::LearningCategory;

// ---------------------------------------------------------------------------
// Tool dispatcher — named operations over a line-framed JSON-RPC stdio
// transport. Every tool response leaves through the compliance firewall.
// ---------------------------------------------------------------------------

/// Operations that require an activated license. The activation server is
/// external; locally we only gate and instruct.
const PREMIUM_TOOLS: &[&str] = &["list_projects", "check_ports", "run_audit", "score_project"];

pub trait LicenseGate: Send {
    fn is_unlocked(&self, tool: &str) -> bool;
}

/// Default gate: nothing premium is unlocked until the activation flow
/// (external) provisions a profile.
pub struct LockedGate;

impl LicenseGate for LockedGate {
    fn is_unlocked(&self, _tool: &str) -> bool {
        false
    }
}

pub struct ServerState {
    engine: Arc<Mutex<Engine>>,
    gate: Box<dyn LicenseGate>,
}

/// A tool outcome before firewall wrapping.
struct ToolOutcome {
    text: String,
    is_error: bool,
    hint: Option<String>,
}

impl ToolOutcome {
    fn ok(text: String) -> Self {
        Self { text, is_error: false, hint: None }
    }

    fn ok_with_hint(text: String, hint: &str) -> Self {
        Self { text, is_error: false, hint: Some(hint.to_string()) }
    }

    fn err(text: String) -> Self {
        Self { text, is_error: true, hint: None }
    }
}

fn arg_str<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).map(str::trim).filter(|s| !s.is_empty())
}

impl ServerState {
    pub fn new(engine: Arc<Mutex<Engine>>) -> Self {
        Self { engine, gate: Box::new(LockedGate) }
    }

    pub fn with_gate(engine: Arc<Mutex<Engine>>, gate: Box<dyn LicenseGate>) -> Self {
        Self { engine, gate }
    }

    fn tool_list(&self, id: serde_json::Value) -> serde_json::Value {
        let categories: Vec<&str> = LearningCategory::ALL.iter().map(|c| c.as_str()).collect();
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [
                    {
                        "name": "search_context",
                        "description": "Ranked hybrid retrieval over the workspace knowledge index: instruction docs, code blocks, git history, manifests, env, process state, and saved learnings. ALWAYS search here before reading files manually — the answer is usually already indexed. Modes: 'hybrid' (default, BM25 + dense vectors + recency), 'keyword' (pure lexical), 'semantic' (pure dense).",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "query": { "type": "string", "description": "Natural-language or keyword query." },
                                "top_k": { "type": "integer", "description": "Max results (default 8, cap 30)." },
                                "mode": { "type": "string", "enum": ["hybrid", "keyword", "semantic"], "description": "Ranking mode (default hybrid)." }
                            },
                            "required": ["query"]
                        }
                    },
                    {
                        "name": "list_sources",
                        "description": "Inventory of all indexed sources with chunk and embedded-vector counts, plus the current corpus fingerprint.",
                        "inputSchema": { "type": "object", "properties": {} }
                    },
                    {
                        "name": "read_source",
                        "description": "Full content of one source by exact name (case-insensitive). Use list_sources first to see valid names.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "name": { "type": "string" } },
                            "required": ["name"]
                        }
                    },
                    {
                        "name": "reindex",
                        "description": "Force a full index rebuild. Normally unnecessary — file changes reindex automatically within a second.",
                        "inputSchema": { "type": "object", "properties": {} }
                    },
                    {
                        "name": "save_learning",
                        "description": "Persist an operational rule for future sessions. Call this whenever you discover something durable about this workspace (a failing pattern, a fixed pitfall, a convention). Duplicate (category, rule) pairs update in place.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "category": { "type": "string", "enum": categories.clone(), "description": "Domain tag." },
                                "rule": { "type": "string", "description": "Concise imperative, e.g. 'pin node version'." },
                                "context": { "type": "string", "description": "Why the rule exists." },
                                "project": { "type": "string", "description": "Optional workspace project scope; omit for universal." }
                            },
                            "required": ["category", "rule"]
                        }
                    },
                    {
                        "name": "list_learnings",
                        "description": "List saved learnings, optionally filtered by category. Scoped to the current workspace projects.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "category": { "type": "string", "enum": categories.clone() } }
                        }
                    },
                    {
                        "name": "import_learnings",
                        "description": "Bulk-import learnings from a Markdown file (H2 category / H3 rule grammar, or '- [category] rule → context' bullets) or a JSON array of {category, rule, context, project}.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" },
                                "category": { "type": "string", "enum": categories, "description": "Default category for entries without one." },
                                "project": { "type": "string" }
                            },
                            "required": ["path"]
                        }
                    },
                    {
                        "name": "delete_learning",
                        "description": "Delete one learning by id.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "id": { "type": "string" } },
                            "required": ["id"]
                        }
                    },
                    {
                        "name": "save_session",
                        "description": "Persist a key/value entry into a named session so the next agent session can resume. Save early, save often — compliance escalates when sessions go unsaved.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "key": { "type": "string" },
                                "value": { "type": "string" }
                            },
                            "required": ["name", "key", "value"]
                        }
                    },
                    {
                        "name": "load_session",
                        "description": "Load all entries of a named session.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "name": { "type": "string" } },
                            "required": ["name"]
                        }
                    },
                    {
                        "name": "list_sessions",
                        "description": "List saved sessions, newest first.",
                        "inputSchema": { "type": "object", "properties": {} }
                    },
                    {
                        "name": "end_session",
                        "description": "Run the end-of-session compliance check (learnings, session persistence, git hygiene, doc freshness) and report the verdict.",
                        "inputSchema": { "type": "object", "properties": {} }
                    },
                    {
                        "name": "list_projects",
                        "description": "(premium) Workspace project inventory with health summary.",
                        "inputSchema": { "type": "object", "properties": {} }
                    },
                    {
                        "name": "check_ports",
                        "description": "(premium) Listening-port audit across workspace services.",
                        "inputSchema": { "type": "object", "properties": {} }
                    },
                    {
                        "name": "run_audit",
                        "description": "(premium) Full workspace compliance audit.",
                        "inputSchema": { "type": "object", "properties": {} }
                    },
                    {
                        "name": "score_project",
                        "description": "(premium) Score one project against operational best practices.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "project": { "type": "string" } }
                        }
                    }
                ]
            }
        })
    }

    fn tool_call(&mut self, id: serde_json::Value, params: &serde_json::Value) -> serde_json::Value {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let Ok(mut engine) = self.engine.lock() else {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type": "text", "text": "engine unavailable"}], "isError": true }
            });
        };

        let outcome = if PREMIUM_TOOLS.contains(&name) && !self.gate.is_unlocked(name) {
            ToolOutcome::err(format!(
                "'{name}' is a premium operation and this install is not activated. \
                Run the activation flow from your dashboard, then restart the server. \
                All retrieval tools (search_context, read_source, learnings, sessions) stay free."
            ))
        } else {
            dispatch(&mut engine, name, &args)
        };

        let wrapped = engine.wrap_response(name, outcome.text, outcome.hint.as_deref());

        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "content": [{"type": "text", "text": wrapped}], "isError": outcome.is_error }
        })
    }
}

fn dispatch(engine: &mut Engine, name: &str, args: &serde_json::Value) -> ToolOutcome {
    match name {
        "search_context" => {
            let Some(query) = arg_str(args, "query") else {
                return ToolOutcome::err(
                    "search_context requires a non-empty 'query' parameter.".to_string(),
                );
            };
            let top_k = args
                .get("top_k")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
                .unwrap_or(8)
                .min(MAX_TOP_K);
            let mode = match arg_str(args, "mode") {
                None => SearchMode::Hybrid,
                Some(raw) => match SearchMode::parse(raw) {
                    Some(m) => m,
                    None => {
                        return ToolOutcome::err(format!(
                            "Unknown mode '{raw}'. Choose one of: hybrid, keyword, semantic."
                        ))
                    }
                },
            };

            let hits = engine.search(query, mode, top_k);
            if hits.is_empty() {
                return ToolOutcome::ok_with_hint(
                    format!("No results for \"{query}\" ({} chunks indexed). Try broader terms or run reindex.", engine.state.chunks.len()),
                    query,
                );
            }

            let mut out = format!("Results for \"{query}\" ({}): {}\n", mode.as_str(), hits.len());
            for (rank, hit) in hits.iter().enumerate() {
                let preview: String = hit.chunk.content.chars().take(400).collect();
                out.push_str(&format!(
                    "\n{}. [{:.3}] {} · {} (lines {}-{})\n   kw {:.2} · sem {:.2} · age {:.2}\n   {}\n",
                    rank + 1,
                    hit.combined,
                    hit.chunk.source,
                    hit.chunk.section,
                    hit.chunk.start_line,
                    hit.chunk.end_line,
                    hit.kw,
                    hit.sem,
                    hit.decay,
                    preview.replace('\n', "\n   "),
                ));
            }
            ToolOutcome::ok_with_hint(out, query)
        }

        "list_sources" => {
            let mut out = String::from("Indexed sources:\n");
            for (name, chunks, embedded) in engine.source_inventory() {
                out.push_str(&format!("- {name}: {chunks} chunks, {embedded} embedded\n"));
            }
            out.push_str(&format!(
                "\ntotal: {} chunks, {} embedded · fingerprint {}",
                engine.state.chunks.len(),
                engine.state.embedded.len(),
                engine.state.fingerprint,
            ));
            ToolOutcome::ok(out)
        }

        "read_source" => {
            let Some(name) = arg_str(args, "name") else {
                return ToolOutcome::err("read_source requires 'name'. Use list_sources to see valid names.".to_string());
            };
            match engine.read_source(name) {
                Some((source, text)) => ToolOutcome::ok(format!(
                    "# {} ({})\n\n{}",
                    source.name,
                    source.path.display(),
                    text
                )),
                None => {
                    let mut known: Vec<String> =
                        engine.state.sources.iter().map(|s| s.name.clone()).collect();
                    known.sort();
                    known.truncate(10);
                    ToolOutcome::err(format!(
                        "Unknown source '{name}'. Known sources include: {}",
                        known.join(", ")
                    ))
                }
            }
        }

        "reindex" => match engine.reindex() {
            Ok(summary) => ToolOutcome::ok(format!(
                "Reindexed: {} sources, {} projects, {} chunks ({} embedded{}), {} learnings imported.",
                summary.sources,
                summary.projects,
                summary.chunks,
                summary.embedded,
                if summary.embed_cache_hit { ", cache hit" } else { "" },
                summary.learnings_imported,
            )),
            Err(e) => ToolOutcome::err(format!("reindex failed: {e}")),
        },

        "save_learning" => {
            let Some(raw_cat) = arg_str(args, "category") else {
                return ToolOutcome::err(category_help("save_learning requires 'category'."));
            };
            let Some(category) = LearningCategory::normalize(raw_cat) else {
                return ToolOutcome::err(category_help(&format!("Unknown category '{raw_cat}'.")));
            };
            let Some(rule) = arg_str(args, "rule") else {
                return ToolOutcome::err(
                    "save_learning requires 'rule' (a concise imperative, e.g. 'pin node version').".to_string(),
                );
            };
            let context = arg_str(args, "context").unwrap_or("");
            let project = arg_str(args, "project");
            let (id, updated) = engine.learnings.save_rule(category, rule, context, project);
            ToolOutcome::ok(format!(
                "{} learning {id} [{category}] {rule}",
                if updated { "Updated" } else { "Saved" }
            ))
        }

        "list_learnings" => {
            let category = match arg_str(args, "category") {
                None => None,
                Some(raw) => match LearningCategory::normalize(raw) {
                    Some(c) => Some(c),
                    None => return ToolOutcome::err(category_help(&format!("Unknown category '{raw}'."))),
                },
            };
            let scope: Vec<String> = engine.projects.iter().map(|p| p.name.clone()).collect();
            let listed = engine.learnings.list(category, Some(&scope));
            if listed.is_empty() {
                return ToolOutcome::ok("No learnings saved yet.".to_string());
            }
            let mut out = format!("{} learnings:\n", listed.len());
            for l in listed {
                let scope_label = l.project.as_deref().unwrap_or("universal");
                out.push_str(&format!("- {} [{}] ({}) {}\n", l.id, l.category, scope_label, l.rule));
            }
            ToolOutcome::ok(out)
        }

        "import_learnings" => {
            let Some(path) = arg_str(args, "path") else {
                return ToolOutcome::err("import_learnings requires 'path'.".to_string());
            };
            let category = arg_str(args, "category")
                .and_then(LearningCategory::normalize)
                .unwrap_or(LearningCategory::Workflow);
            let project = arg_str(args, "project");
            match engine
                .learnings
                .import_from_file(std::path::Path::new(path), category, project)
            {
                Ok(created) => ToolOutcome::ok(format!("Imported {created} new learnings from {path}.")),
                Err(e) => ToolOutcome::err(format!("import failed: {e}")),
            }
        }

        "delete_learning" => {
            let Some(learning_id) = arg_str(args, "id") else {
                return ToolOutcome::err("delete_learning requires 'id'.".to_string());
            };
            if engine.learnings.delete(learning_id) {
                ToolOutcome::ok(format!("Deleted learning {learning_id}."))
            } else {
                ToolOutcome::err(format!("No learning with id '{learning_id}'."))
            }
        }

        "save_session" => {
            let (Some(name), Some(key), Some(value)) = (
                arg_str(args, "name"),
                arg_str(args, "key"),
                args.get("value").and_then(|v| v.as_str()),
            ) else {
                return ToolOutcome::err("save_session requires 'name', 'key', and 'value'.".to_string());
            };
            let session = engine.sessions.save(name, key, value);
            ToolOutcome::ok(format!(
                "Session '{}' saved ({} entries).",
                session.name,
                session.entries.len()
            ))
        }

        "load_session" => {
            let Some(name) = arg_str(args, "name") else {
                return ToolOutcome::err("load_session requires 'name'.".to_string());
            };
            match engine.sessions.load(name) {
                Some(session) => {
                    let mut out = format!(
                        "Session '{}' (updated {}):\n",
                        session.name,
                        session.updated.to_rfc3339()
                    );
                    for e in &session.entries {
                        out.push_str(&format!("- {}: {}\n", e.key, e.value));
                    }
                    ToolOutcome::ok(out)
                }
                None => ToolOutcome::err(format!("No session named '{name}'.")),
            }
        }

        "list_sessions" => {
            let sessions = engine.sessions.list();
            if sessions.is_empty() {
                return ToolOutcome::ok("No sessions saved yet.".to_string());
            }
            let mut out = format!("{} sessions:\n", sessions.len());
            for (name, updated, entries) in sessions {
                out.push_str(&format!("- {name} ({entries} entries, updated {})\n", updated.to_rfc3339()));
            }
            ToolOutcome::ok(out)
        }

        "end_session" => {
            let projects = engine.projects.clone();
            let obligations = engine
                .firewall
                .evaluate_obligations(chrono::Utc::now(), &projects);
            let failed = obligations.iter().any(|o| o.status == ObligationStatus::Fail);
            let mut out = String::from("End-of-session check:\n");
            for ob in &obligations {
                out.push_str(&format!("{} {}: {}\n", ob.status.glyph(), ob.name, ob.detail));
            }
            out.push_str(if failed {
                "\nverdict: FAIL — address the ✗ items before ending the session."
            } else {
                "\nverdict: PASS"
            });
            engine.firewall.flush_stats(true);
            ToolOutcome::ok(out)
        }

        _ => ToolOutcome::err(format!(
            "Unknown tool '{name}'. Call tools/list for the available operations."
        )),
    }
}

fn category_help(prefix: &str) -> String {
    let names: Vec<&str> = LearningCategory::ALL.iter().map(|c| c.as_str()).collect();
    format!("{prefix} Valid categories: {}.", names.join(", "))
}

/// Run the stdio JSON-RPC server: initial reindex, file watcher, then the
/// line loop. Notifications (no id) are ignored; unknown methods get a
/// standard -32601.
pub fn run_stdio_server() -> Result<()> {
    let mut engine = Engine::new()?;
    match engine.reindex() {
        Ok(summary) => eprintln!(
            "[contextengine] index ready: {} chunks from {} sources",
            summary.chunks, summary.sources
        ),
        Err(e) => eprintln!("[contextengine] initial reindex failed: {e}"),
    }

    let engine = Arc::new(Mutex::new(engine));
    if let Err(e) = spawn_watcher(Arc::clone(&engine)) {
        eprintln!("[contextengine] file watching disabled: {e}");
    }

    let mut state = ServerState::new(engine);
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // JSON-RPC notifications have no "id" — don't respond.
        let Some(id) = msg.get("id").cloned() else {
            continue;
        };
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": msg.get("params").and_then(|p| p.get("protocolVersion")).cloned().unwrap_or(json!("2024-11-05")),
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "contextengine", "version": env!("CARGO_PKG_VERSION") }
                }
            }),
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => state.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                state.tool_call(id, &params)
            }
            "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] } }),
            "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };

        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }

    Ok(())
}
