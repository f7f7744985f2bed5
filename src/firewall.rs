use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::chunk::ProjectDirectory;
use crate::learnings::LearningStore;

// ---------------------------------------------------------------------------
// Compliance firewall — the stateful wrapper around every tool response.
//
// Non-exempt tool calls advance counters and rounds; four obligations are
// evaluated on each call and the response is decorated (footer, header) or
// truncated (degraded) according to the escalation level. The remedy tools
// themselves (save_learning, save_session, ...) are exempt: they record
// their compliance effect and pass through byte-identical.
//
// All counters flush to ~/.contextengine/session-stats.json, debounced to at
// most one write per 10 s, with a one-shot catch-up timer so the file is
// never more than 10 s behind. A restart within 5 minutes restores round
// state from the previous process, so editor reloads don't reset enforcement.
// ---------------------------------------------------------------------------

/// Tools that are remedies rather than work: never decorated, never counted
/// as tool calls.
pub const EXEMPT_TOOLS: &[&str] = &[
    "save_learning",
    "save_session",
    "end_session",
    "list_learnings",
    "delete_learning",
    "import_learnings",
    "load_session",
    "list_sessions",
    "delete_session",
    "activate",
];

const ROUND_GAP_SECS: i64 = 30;
const STATS_FLUSH_SECS: i64 = 10;
const RESUME_WINDOW_SECS: i64 = 300;
const GIT_CACHE_SECS: i64 = 60;
const DOCS_CACHE_SECS: i64 = 120;
const INJECT_MAX: usize = 3;
const HINT_PREFIX_CHARS: usize = 200;
const DEGRADED_MAX_CHARS: usize = 500;
const MAX_GIT_PROJECTS: usize = 5;
const MAX_DOCS_PROJECTS: usize = 3;
const DOC_FRESHNESS_FILE: &str = ".github/copilot-instructions.md";

pub const STATS_FILE: &str = "session-stats.json";

/// Live metrics, exactly the shape external pollers (editor plugins) read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tool_calls: u64,
    pub learnings_saved: u64,
    pub session_saved: bool,
    pub uptime_minutes: i64,
    pub nudges_issued: u64,
    pub search_recalls: u64,
    pub truncations: u64,
    pub time_saved_minutes: u64,
    pub round: u32,
    pub rounds_since_session_save: u32,
    pub learnings_injected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationStatus {
    Ok,
    Warn,
    Fail,
}

impl ObligationStatus {
    pub fn glyph(&self) -> &'static str {
        match self {
            Self::Ok => "✓",
            Self::Warn => "⚠",
            Self::Fail => "✗",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Obligation {
    pub name: &'static str,
    pub status: ObligationStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationLevel {
    Silent,
    Footer,
    Header,
    Degraded,
}

type NowFn = Box<dyn Fn() -> DateTime<Utc> + Send>;

pub struct Firewall {
    stats_path: PathBuf,
    now_fn: NowFn,
    pid: u32,
    started_at: DateTime<Utc>,

    tool_calls: u64,
    learnings_saved: u64,
    session_saved: bool,
    nudges_issued: u64,
    search_recalls: u64,
    truncations: u64,
    learnings_injected: u64,

    round: u32,
    round_at_last_save: u32,
    rounds_since_session_save: u32,
    last_nonexempt_at: Option<DateTime<Utc>>,

    git_cache: Option<(DateTime<Utc>, (usize, String))>,
    docs_cache: Option<(DateTime<Utc>, (u32, String))>,
    inject_cache: HashMap<String, Option<String>>,

    last_flush: Option<DateTime<Utc>>,
    pending_flush: Arc<Mutex<Option<(PathBuf, SessionStats)>>>,
    flush_timer_scheduled: Arc<AtomicBool>,
}

impl Firewall {
    pub fn open(base: &Path) -> Self {
        Self::with_clock(base, Box::new(Utc::now))
    }

    /// Construct with an injectable clock (tests drive rounds and TTLs
    /// without sleeping).
    pub fn with_clock(base: &Path, now_fn: NowFn) -> Self {
        let stats_path = base.join(STATS_FILE);
        let now = now_fn();
        let mut fw = Self {
            stats_path,
            now_fn,
            pid: std::process::id(),
            started_at: now,
            tool_calls: 0,
            learnings_saved: 0,
            session_saved: false,
            nudges_issued: 0,
            search_recalls: 0,
            truncations: 0,
            learnings_injected: 0,
            round: 0,
            round_at_last_save: 0,
            rounds_since_session_save: 0,
            last_nonexempt_at: None,
            git_cache: None,
            docs_cache: None,
            inject_cache: HashMap::new(),
            last_flush: None,
            pending_flush: Arc::new(Mutex::new(None)),
            flush_timer_scheduled: Arc::new(AtomicBool::new(false)),
        };
        fw.try_resume(now);
        fw
    }

    /// Restore enforcement state from a previous process that died less than
    /// 5 minutes ago. Without this, restarting the editor would reset rounds.
    fn try_resume(&mut self, now: DateTime<Utc>) {
        let Ok(text) = std::fs::read_to_string(&self.stats_path) else {
            return;
        };
        let Ok(prev) = serde_json::from_str::<SessionStats>(&text) else {
            return;
        };
        if prev.pid == self.pid {
            return;
        }
        if (now - prev.updated_at).num_seconds() >= RESUME_WINDOW_SECS {
            return;
        }
        self.round = prev.round;
        self.rounds_since_session_save = prev.rounds_since_session_save;
        self.round_at_last_save = prev.round.saturating_sub(prev.rounds_since_session_save);
        self.session_saved = prev.session_saved;
        self.search_recalls = prev.search_recalls;
        crate::debug_log!(
            "[contextengine] resumed compliance state from pid {} (round {})",
            prev.pid,
            prev.round
        );
    }

    // ── Public surface ───────────────────────────────────────────────────

    /// Wrap a tool response. This is the only way responses leave the
    /// process; exempt tools pass through unchanged after recording their
    /// compliance effect.
    pub fn wrap(
        &mut self,
        tool_name: &str,
        response: String,
        query_hint: Option<&str>,
        learnings: &LearningStore,
        projects: &[ProjectDirectory],
    ) -> String {
        if EXEMPT_TOOLS.contains(&tool_name) {
            self.record_exempt(tool_name);
            self.flush_stats(false);
            return response;
        }

        let now = (self.now_fn)();
        if let Some(prev) = self.last_nonexempt_at {
            if (now - prev).num_seconds() > ROUND_GAP_SECS {
                self.round += 1;
                self.rounds_since_session_save = self.round - self.round_at_last_save;
                self.inject_cache.clear();
            }
        }
        self.last_nonexempt_at = Some(now);
        self.tool_calls += 1;

        let injection = query_hint.and_then(|h| self.injection_block(h, learnings, projects));

        let obligations = self.evaluate_obligations(now, projects);
        let score = compliance_score(&obligations);
        let level = self.escalation_level(score);

        let mut out = String::new();
        if let Some(inj) = &injection {
            out.push_str(inj);
            out.push_str("\n\n");
        }

        match level {
            EscalationLevel::Silent => out.push_str(&response),
            EscalationLevel::Footer => {
                self.nudges_issued += 1;
                out.push_str(&response);
                out.push_str("\n\n");
                out.push_str(&self.status_block(now, score, &obligations, level));
            }
            EscalationLevel::Header => {
                self.nudges_issued += 1;
                out.push_str(&self.status_block(now, score, &obligations, level));
                out.push_str("\n\n");
                out.push_str(&response);
            }
            EscalationLevel::Degraded => {
                self.nudges_issued += 1;
                out.push_str(&self.status_block(now, score, &obligations, level));
                out.push_str("\n\n");
                if response.len() > DEGRADED_MAX_CHARS {
                    self.truncations += 1;
                    let mut cut = DEGRADED_MAX_CHARS;
                    while cut > 0 && !response.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    out.push_str(&response[..cut]);
                    out.push_str(
                        "\n\n✂ [output truncated at 500 chars — call save_session and save_learning to restore full responses]",
                    );
                } else {
                    out.push_str(&response);
                }
            }
        }

        self.flush_stats(false);
        out
    }

    fn record_exempt(&mut self, tool_name: &str) {
        match tool_name {
            "save_learning" => self.learnings_saved += 1,
            "save_session" | "end_session" => {
                self.session_saved = true;
                self.round_at_last_save = self.round;
                self.rounds_since_session_save = 0;
            }
            _ => {}
        }
    }

    /// Evaluate the four obligations (used by `wrap` and by the end-session
    /// check). Git and docs results are cached on their own TTLs.
    pub fn evaluate_obligations(
        &mut self,
        now: DateTime<Utc>,
        projects: &[ProjectDirectory],
    ) -> Vec<Obligation> {
        let mut out = Vec::with_capacity(4);

        // 1. Learnings: roughly one save expected per five calls.
        let expected = std::cmp::max(1, self.tool_calls / 5);
        let (status, detail) = if self.tool_calls < 5 {
            (ObligationStatus::Ok, "warmup".to_string())
        } else if self.learnings_saved >= expected {
            (ObligationStatus::Ok, format!("{}/{} saved", self.learnings_saved, expected))
        } else if self.learnings_saved > 0 {
            (ObligationStatus::Warn, format!("{}/{} saved", self.learnings_saved, expected))
        } else {
            (ObligationStatus::Fail, format!("0/{} saved", expected))
        };
        out.push(Obligation { name: "learnings", status, detail });

        // 2. Session: three strikes, counted in rounds.
        let (status, detail) = match self.rounds_since_session_save {
            0 | 1 => (ObligationStatus::Ok, "current".to_string()),
            2 => (ObligationStatus::Warn, "2 rounds unsaved".to_string()),
            n => (ObligationStatus::Fail, format!("{n} rounds unsaved")),
        };
        out.push(Obligation { name: "session", status, detail });

        // 3. Git hygiene across the workspace.
        let (dirty, detail) = self.git_dirty_counts(now, projects);
        let status = if dirty == 0 {
            ObligationStatus::Ok
        } else if dirty > 5 {
            ObligationStatus::Fail
        } else {
            ObligationStatus::Warn
        };
        out.push(Obligation { name: "git", status, detail });

        // 4. Instruction-doc freshness.
        let (behind, detail) = self.docs_freshness(now, projects);
        let status = if behind <= 1 {
            ObligationStatus::Ok
        } else if behind <= 3 {
            ObligationStatus::Warn
        } else {
            ObligationStatus::Fail
        };
        out.push(Obligation { name: "docs", status, detail });

        out
    }

    // ── Escalation ───────────────────────────────────────────────────────

    fn escalation_level(&self, score: u32) -> EscalationLevel {
        if score == 0 {
            EscalationLevel::Silent
        } else if self.rounds_since_session_save >= 4 || score >= 80 {
            EscalationLevel::Degraded
        } else if self.rounds_since_session_save >= 3 || score >= 50 {
            EscalationLevel::Header
        } else if self.rounds_since_session_save >= 2 || self.tool_calls >= 5 {
            EscalationLevel::Footer
        } else {
            EscalationLevel::Silent
        }
    }

    fn status_block(
        &self,
        now: DateTime<Utc>,
        score: u32,
        obligations: &[Obligation],
        level: EscalationLevel,
    ) -> String {
        let uptime_min = (now - self.started_at).num_minutes();
        let mut block = String::new();
        block.push_str("╭─ contextengine ───────────────────────────\n");
        block.push_str(&format!(
            "│ uptime {uptime_min}m · calls {} · compliance {}%\n",
            self.tool_calls,
            100 - score
        ));
        for ob in obligations {
            block.push_str(&format!("│ {} {}: {}\n", ob.status.glyph(), ob.name, ob.detail));
        }
        if level == EscalationLevel::Degraded {
            block.push_str("│ ✂ degraded: responses truncated until session is saved\n");
        }
        block.push_str("╰───────────────────────────────────────────");
        block
    }

    // ── Learning auto-injection ──────────────────────────────────────────

    fn injection_block(
        &mut self,
        hint: &str,
        learnings: &LearningStore,
        projects: &[ProjectDirectory],
    ) -> Option<String> {
        let prefix: String = hint.chars().take(HINT_PREFIX_CHARS).collect::<String>().to_lowercase();
        let key = format!("{}:{}", self.round, prefix);

        if let Some(cached) = self.inject_cache.get(&key) {
            if cached.is_some() {
                self.search_recalls += 1;
            }
            return cached.clone();
        }

        let scope: Vec<String> = projects.iter().map(|p| p.name.clone()).collect();
        let hits = learnings.search(hint, Some(&scope), INJECT_MAX);
        let block = if hits.is_empty() {
            None
        } else {
            let mut b = String::from("◈ relevant learnings:\n");
            for l in &hits {
                b.push_str(&format!("- [{}] {}\n", l.category, l.rule));
            }
            self.learnings_injected += hits.len() as u64;
            self.search_recalls += 1;
            Some(b.trim_end().to_string())
        };
        self.inject_cache.insert(key, block.clone());
        block
    }

    // ── Git / docs probes ────────────────────────────────────────────────

    fn git_dirty_counts(
        &mut self,
        now: DateTime<Utc>,
        projects: &[ProjectDirectory],
    ) -> (usize, String) {
        if let Some((at, cached)) = &self.git_cache {
            if (now - *at).num_seconds() < GIT_CACHE_SECS {
                return cached.clone();
            }
        }

        let mut total = 0usize;
        let mut parts: Vec<String> = Vec::new();
        for p in projects.iter().take(MAX_GIT_PROJECTS) {
            let Ok(out) = std::process::Command::new("git")
                .args(["status", "--porcelain"])
                .current_dir(&p.path)
                .output()
            else {
                continue;
            };
            if !out.status.success() {
                continue;
            }
            let n = String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count();
            if n > 0 {
                parts.push(format!("{} {n}", p.name));
                total += n;
            }
        }

        let detail = if parts.is_empty() {
            "clean".to_string()
        } else {
            format!("{total} uncommitted ({})", parts.join(", "))
        };
        let result = (total, detail);
        self.git_cache = Some((now, result.clone()));
        result
    }

    fn docs_freshness(
        &mut self,
        now: DateTime<Utc>,
        projects: &[ProjectDirectory],
    ) -> (u32, String) {
        if let Some((at, cached)) = &self.docs_cache {
            if (now - *at).num_seconds() < DOCS_CACHE_SECS {
                return cached.clone();
            }
        }

        let mut worst = 0u32;
        let mut worst_project = String::new();
        for p in projects.iter().take(MAX_DOCS_PROJECTS) {
            let doc = p.path.join(DOC_FRESHNESS_FILE);
            let Some(mtime) = std::fs::metadata(&doc)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
            else {
                continue;
            };
            let Ok(out) = std::process::Command::new("git")
                .args([
                    "rev-list",
                    "--count",
                    &format!("--since={}", mtime.to_rfc3339()),
                    "HEAD",
                ])
                .current_dir(&p.path)
                .output()
            else {
                continue;
            };
            if !out.status.success() {
                continue;
            }
            let behind = String::from_utf8_lossy(&out.stdout)
                .trim()
                .parse::<u32>()
                .unwrap_or(0);
            if behind > worst {
                worst = behind;
                worst_project = p.name.clone();
            }
        }

        let detail = if worst == 0 {
            "fresh".to_string()
        } else {
            format!("{worst} commits behind in {worst_project}")
        };
        let result = (worst, detail);
        self.docs_cache = Some((now, result.clone()));
        result
    }

    // ── Stats persistence ────────────────────────────────────────────────

    fn snapshot(&self, now: DateTime<Utc>) -> SessionStats {
        SessionStats {
            pid: self.pid,
            started_at: self.started_at,
            updated_at: now,
            tool_calls: self.tool_calls,
            learnings_saved: self.learnings_saved,
            session_saved: self.session_saved,
            uptime_minutes: (now - self.started_at).num_minutes(),
            nudges_issued: self.nudges_issued,
            search_recalls: self.search_recalls,
            truncations: self.truncations,
            time_saved_minutes: self.search_recalls * 2 + self.learnings_saved * 5,
            round: self.round,
            rounds_since_session_save: self.rounds_since_session_save,
            learnings_injected: self.learnings_injected,
        }
    }

    /// Debounced flush: immediate when the 10 s window is open, otherwise the
    /// snapshot is parked and a single one-shot timer writes the latest
    /// parked snapshot when the window closes. A flush failure never fails
    /// the wrapped response.
    pub fn flush_stats(&mut self, force: bool) {
        let now = (self.now_fn)();
        let stats = self.snapshot(now);

        let window_open = force
            || self
                .last_flush
                .map(|l| (now - l).num_seconds() >= STATS_FLUSH_SECS)
                .unwrap_or(true);

        if window_open {
            write_stats_file(&self.stats_path, &stats);
            self.last_flush = Some(now);
            return;
        }

        if let Ok(mut pending) = self.pending_flush.lock() {
            *pending = Some((self.stats_path.clone(), stats));
        }
        if !self.flush_timer_scheduled.swap(true, Ordering::SeqCst) {
            let pending = Arc::clone(&self.pending_flush);
            let scheduled = Arc::clone(&self.flush_timer_scheduled);
            let wait = self
                .last_flush
                .map(|l| STATS_FLUSH_SECS - (now - l).num_seconds())
                .unwrap_or(STATS_FLUSH_SECS)
                .clamp(1, STATS_FLUSH_SECS) as u64;
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(wait));
                scheduled.store(false, Ordering::SeqCst);
                if let Ok(mut guard) = pending.lock() {
                    if let Some((path, stats)) = guard.take() {
                        write_stats_file(&path, &stats);
                    }
                }
            });
        }
    }
}

fn compliance_score(obligations: &[Obligation]) -> u32 {
    let fails = obligations.iter().filter(|o| o.status == ObligationStatus::Fail).count() as u32;
    let warns = obligations.iter().filter(|o| o.status == ObligationStatus::Warn).count() as u32;
    (30 * fails + 10 * warns).min(100)
}

fn write_stats_file(path: &Path, stats: &SessionStats) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_string_pretty(stats) {
        Ok(text) => {
            if std::fs::write(path, text).is_err() {
                crate::debug_log!("[contextengine] stats flush failed (non-fatal)");
            }
        }
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learnings::LearningCategory;
    use chrono::Duration;

    struct Harness {
        _tmp: tempfile::TempDir,
        clock: Arc<Mutex<DateTime<Utc>>>,
        fw: Firewall,
        learnings: LearningStore,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(Mutex::new(Utc::now()));
        let c = Arc::clone(&clock);
        let fw = Firewall::with_clock(tmp.path(), Box::new(move || *c.lock().unwrap()));
        let learnings = LearningStore::open(&tmp.path().join("store"));
        Harness { _tmp: tmp, clock, fw, learnings }
    }

    impl Harness {
        fn tick(&self, secs: i64) {
            *self.clock.lock().unwrap() += Duration::seconds(secs);
        }

        fn call(&mut self, tool: &str, body: &str) -> String {
            self.fw
                .wrap(tool, body.to_string(), None, &self.learnings, &[])
        }
    }

    #[test]
    fn exempt_tools_pass_through_byte_identical() {
        let mut h = harness();
        let body = "saved ✓ — emoji and all";
        for tool in ["save_learning", "save_session", "list_sessions", "end_session"] {
            assert_eq!(h.call(tool, body), body);
        }
    }

    #[test]
    fn compliant_session_wraps_are_identity() {
        let mut h = harness();
        h.call("save_session", "ok");
        // Under 5 calls everything is warmup/ok; score 0 means silent.
        for _ in 0..3 {
            let out = h.call("search_context", "the response");
            assert_eq!(out, "the response");
        }
    }

    #[test]
    fn escalates_to_footer_by_fifth_back_to_back_call() {
        let mut h = harness();
        let first = h.call("search_context", "r1");
        assert_eq!(first, "r1", "warmup call is silent");

        let mut last = String::new();
        for i in 2..=5 {
            last = h.call("search_context", &format!("r{i}"));
        }
        assert!(last.starts_with("r5"), "footer appends, never prepends");
        assert!(last.contains("compliance"), "status block attached by 5th call");
        assert!(last.contains("✗ learnings"));
    }

    #[test]
    fn four_idle_rounds_without_save_degrade_and_truncate() {
        let mut h = harness();
        h.call("search_context", "warm");
        for _ in 0..4 {
            h.tick(31);
            h.call("search_context", "tick");
        }
        // Round is now 4 with no save; the next call must be degraded.
        let long_body = "z".repeat(600);
        let out = h.call("search_context", &long_body);

        assert!(out.contains("degraded"));
        assert!(out.contains("truncated"));
        let body_part: String = out.chars().filter(|c| *c == 'z').collect();
        assert!(body_part.len() <= DEGRADED_MAX_CHARS);
        assert_eq!(h.fw.truncations, 1);
    }

    #[test]
    fn save_session_resets_session_obligation() {
        let mut h = harness();
        h.call("search_context", "warm");
        for _ in 0..4 {
            h.tick(31);
            h.call("search_context", "tick");
        }
        h.call("save_session", "saved");
        assert_eq!(h.fw.rounds_since_session_save, 0);

        let out = h.call("search_context", "after save");
        // Learnings may still warn/fail, but session is ok again: no
        // degradation, no truncation.
        assert!(!out.contains("degraded"));
        assert!(out.contains("after save"));
        assert_eq!(h.fw.truncations, 0);
    }

    #[test]
    fn short_responses_are_not_truncated_when_degraded() {
        let mut h = harness();
        h.call("search_context", "warm");
        for _ in 0..4 {
            h.tick(31);
            h.call("search_context", "tick");
        }
        let out = h.call("search_context", "short");
        assert!(out.contains("short"));
        assert_eq!(h.fw.truncations, 0, "under 500 chars nothing is cut");
    }

    #[test]
    fn rounds_advance_only_after_thirty_second_gaps() {
        let mut h = harness();
        h.call("search_context", "a");
        h.tick(10);
        h.call("search_context", "b");
        assert_eq!(h.fw.round, 0, "10 s gap stays in the same round");
        h.tick(31);
        h.call("search_context", "c");
        assert_eq!(h.fw.round, 1);
    }

    #[test]
    fn injection_prepends_scoped_learnings_and_bumps_recalls() {
        let mut h = harness();
        h.learnings
            .save_rule(LearningCategory::Docker, "prune volumes monthly", "", None);
        let out = h.fw.wrap(
            "search_context",
            "the answer".to_string(),
            Some("docker volumes keep filling up"),
            &h.learnings,
            &[],
        );
        assert!(out.contains("relevant learnings"));
        assert!(out.contains("prune volumes monthly"));
        assert!(out.ends_with("the answer"));
        assert_eq!(h.fw.search_recalls, 1);
        assert!(h.fw.learnings_injected >= 1);

        // Same hint in the same round hits the cache but still counts.
        let again = h.fw.wrap(
            "search_context",
            "more".to_string(),
            Some("docker volumes keep filling up"),
            &h.learnings,
            &[],
        );
        assert!(again.contains("prune volumes monthly"));
        assert_eq!(h.fw.search_recalls, 2);
        assert_eq!(h.fw.learnings_injected, 1, "cached injection embeds no new learnings");
    }

    #[test]
    fn stats_file_tracks_tool_calls() {
        let mut h = harness();
        h.call("search_context", "a");
        let text = std::fs::read_to_string(&h.fw.stats_path).unwrap();
        let stats: SessionStats = serde_json::from_str(&text).unwrap();
        assert_eq!(stats.tool_calls, 1);
        assert_eq!(stats.pid, std::process::id());

        // Force the window open and check monotonic updatedAt.
        h.tick(11);
        h.call("search_context", "b");
        let stats2: SessionStats =
            serde_json::from_str(&std::fs::read_to_string(&h.fw.stats_path).unwrap()).unwrap();
        assert_eq!(stats2.tool_calls, 2);
        assert!(stats2.updated_at > stats.updated_at);
    }

    #[test]
    fn recent_stats_from_another_pid_resume_round_state() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let prev = SessionStats {
            pid: std::process::id() + 1,
            started_at: now - Duration::minutes(30),
            updated_at: now - Duration::seconds(60),
            tool_calls: 40,
            learnings_saved: 2,
            session_saved: true,
            uptime_minutes: 30,
            nudges_issued: 3,
            search_recalls: 7,
            truncations: 1,
            time_saved_minutes: 24,
            round: 6,
            rounds_since_session_save: 2,
            learnings_injected: 4,
        };
        std::fs::write(
            tmp.path().join(STATS_FILE),
            serde_json::to_string(&prev).unwrap(),
        )
        .unwrap();

        let fw = Firewall::open(tmp.path());
        assert_eq!(fw.round, 6);
        assert_eq!(fw.rounds_since_session_save, 2);
        assert!(fw.session_saved);
        assert_eq!(fw.search_recalls, 7);
    }

    #[test]
    fn stale_stats_do_not_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let prev = SessionStats {
            pid: std::process::id() + 1,
            started_at: now - Duration::hours(2),
            updated_at: now - Duration::minutes(10),
            tool_calls: 40,
            learnings_saved: 2,
            session_saved: true,
            uptime_minutes: 120,
            nudges_issued: 3,
            search_recalls: 7,
            truncations: 1,
            time_saved_minutes: 24,
            round: 6,
            rounds_since_session_save: 2,
            learnings_injected: 4,
        };
        std::fs::write(
            tmp.path().join(STATS_FILE),
            serde_json::to_string(&prev).unwrap(),
        )
        .unwrap();

        let fw = Firewall::open(tmp.path());
        assert_eq!(fw.round, 0, "older than 5 minutes must not resume");
    }
}
