use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use contextengine::fuser::SearchMode;
use contextengine::indexer::Engine;
use contextengine::learnings::LearningCategory;
use contextengine::server::run_stdio_server;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Read;

#[derive(Debug, Parser)]
#[command(name = "contextengine")]
#[command(version)]
#[command(about = "Workspace knowledge indexer and retrieval engine for AI coding agents")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Query the index (hybrid BM25 + dense + recency by default)
    Search {
        query: String,
        /// Max results
        #[arg(short = 'n', long, default_value_t = 8)]
        top_k: usize,
        /// hybrid | keyword | semantic
        #[arg(long, default_value = "hybrid")]
        mode: String,
    },
    /// Show every indexed source with chunk/embedded counts
    ListSources,
    /// Force a full index rebuild
    Reindex,
    /// Save one operational learning
    SaveLearning {
        /// The rule text (concise imperative)
        rule: String,
        /// Category (deployment, docker, git, ...)
        #[arg(short = 'c', long)]
        category: String,
        /// Optional workspace project scope
        #[arg(short = 'p', long)]
        project: Option<String>,
        /// Why the rule exists
        #[arg(long, default_value = "")]
        context: String,
    },
    /// List saved learnings, optionally one category
    ListLearnings { category: Option<String> },
    /// Save a key/value entry into a named session
    SaveSession {
        name: String,
        key: String,
        /// Value text; omit together with --stdin to read from stdin
        value: Option<String>,
        /// Read the value from stdin
        #[arg(long)]
        stdin: bool,
    },
    /// Print a named session
    LoadSession { name: String },
    /// Run the compliance check; exits non-zero when any obligation fails
    EndSession,
    /// Start the stdio JSON-RPC server
    Serve,
}

fn spinner(msg: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.set_message(msg.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.cmd, Command::Serve) {
        return run_stdio_server();
    }

    let mut engine = Engine::new()?;

    match cli.cmd {
        Command::Search { query, top_k, mode } => {
            let mode = SearchMode::parse(&mode)
                .with_context(|| format!("unknown mode '{mode}' (hybrid|keyword|semantic)"))?;
            let bar = spinner("indexing workspace...");
            let summary = engine.reindex()?;
            bar.finish_with_message(format!(
                "indexed {} chunks from {} sources",
                summary.chunks, summary.sources
            ));

            let hits = engine.search(&query, mode, top_k);
            if hits.is_empty() {
                println!("no results for \"{query}\"");
                return Ok(());
            }
            for (rank, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} · {} (lines {}-{})",
                    rank + 1,
                    hit.combined,
                    hit.chunk.source,
                    hit.chunk.section,
                    hit.chunk.start_line,
                    hit.chunk.end_line
                );
                let preview: String = hit.chunk.content.chars().take(240).collect();
                println!("   {}", preview.replace('\n', "\n   "));
            }
        }

        Command::ListSources => {
            let bar = spinner("indexing workspace...");
            engine.reindex()?;
            bar.finish_and_clear();
            for (name, chunks, embedded) in engine.source_inventory() {
                println!("{name}: {chunks} chunks, {embedded} embedded");
            }
            println!(
                "total: {} chunks · fingerprint {}",
                engine.state.chunks.len(),
                engine.state.fingerprint
            );
        }

        Command::Reindex => {
            let bar = spinner("rebuilding index...");
            let summary = engine.reindex()?;
            bar.finish_and_clear();
            println!(
                "{} sources, {} projects, {} chunks ({} embedded{}), {} learnings imported",
                summary.sources,
                summary.projects,
                summary.chunks,
                summary.embedded,
                if summary.embed_cache_hit { ", cache hit" } else { "" },
                summary.learnings_imported
            );
        }

        Command::SaveLearning { rule, category, project, context } => {
            let category = LearningCategory::normalize(&category)
                .with_context(|| format!("unknown category '{category}'"))?;
            let (id, updated) =
                engine
                    .learnings
                    .save_rule(category, &rule, &context, project.as_deref());
            println!("{} {id} [{category}] {rule}", if updated { "updated" } else { "saved" });
        }

        Command::ListLearnings { category } => {
            let category = match category {
                None => None,
                Some(raw) => Some(
                    LearningCategory::normalize(&raw)
                        .with_context(|| format!("unknown category '{raw}'"))?,
                ),
            };
            for l in engine.learnings.list(category, None) {
                let scope = l.project.as_deref().unwrap_or("universal");
                println!("{} [{}] ({scope}) {}", l.id, l.category, l.rule);
            }
        }

        Command::SaveSession { name, key, value, stdin } => {
            let value = match (value, stdin) {
                (Some(v), false) => v,
                (None, true) => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
                    buf
                }
                _ => anyhow::bail!("provide either a value argument or --stdin"),
            };
            let session = engine.sessions.save(&name, &key, &value);
            println!("session '{}' saved ({} entries)", session.name, session.entries.len());
        }

        Command::LoadSession { name } => {
            let session = engine
                .sessions
                .load(&name)
                .with_context(|| format!("no session named '{name}'"))?;
            println!("session '{}' (updated {})", session.name, session.updated.to_rfc3339());
            for e in &session.entries {
                println!("{}: {}", e.key, e.value);
            }
        }

        Command::EndSession => {
            engine.reindex()?;
            let projects = engine.projects.clone();
            let obligations = engine
                .firewall
                .evaluate_obligations(chrono::Utc::now(), &projects);
            let mut failed = false;
            for ob in &obligations {
                println!("{} {}: {}", ob.status.glyph(), ob.name, ob.detail);
                failed |= ob.status == contextengine::firewall::ObligationStatus::Fail;
            }
            engine.firewall.flush_stats(true);
            if failed {
                eprintln!("end-session: FAIL");
                std::process::exit(1);
            }
            println!("end-session: PASS");
        }

        Command::Serve => unreachable!("handled above"),
    }

    Ok(())
}
