use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Session store — named key/value conversations persisted across processes.
// One JSON file per session under ~/.contextengine/sessions/.
// ---------------------------------------------------------------------------

const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub key: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Ordered by first insert; save-by-key updates in place.
    pub entries: Vec<SessionEntry>,
}

/// Restrict names to `[A-Za-z0-9_.\-]`, capped at 100 chars, so any session
/// name is a safe filename on every platform.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn open(base: &Path) -> Self {
        let dir = base.join("sessions");
        let _ = std::fs::create_dir_all(&dir);
        Self { dir }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_name(name)))
    }

    /// Upsert one entry. Creates the session on first save.
    pub fn save(&self, name: &str, key: &str, value: &str) -> Session {
        let now = Utc::now();
        let mut session = self.load(name).unwrap_or_else(|| Session {
            name: sanitize_name(name),
            created: now,
            updated: now,
            entries: vec![],
        });

        match session.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value.to_string();
                entry.timestamp = now;
            }
            None => session.entries.push(SessionEntry {
                key: key.to_string(),
                value: value.to_string(),
                timestamp: now,
            }),
        }
        session.updated = now;

        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        let write = serde_json::to_string_pretty(&session)
            .map_err(std::io::Error::other)
            .and_then(|text| std::fs::write(&tmp, text))
            .and_then(|_| std::fs::rename(&tmp, &path));
        if write.is_err() {
            eprintln!("[contextengine] failed to persist session '{}'", session.name);
        }
        session
    }

    pub fn load(&self, name: &str) -> Option<Session> {
        let text = std::fs::read_to_string(self.path_for(name)).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// All sessions as `(name, updated, entry count)`, newest first.
    pub fn list(&self) -> Vec<(String, DateTime<Utc>, usize)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return vec![];
        };
        let mut out: Vec<(String, DateTime<Utc>, usize)> = entries
            .flatten()
            .filter_map(|e| {
                let text = std::fs::read_to_string(e.path()).ok()?;
                let s: Session = serde_json::from_str(&text).ok()?;
                Some((s.name, s.updated, s.entries.len()))
            })
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    pub fn delete(&self, name: &str) -> bool {
        std::fs::remove_file(self.path_for(name)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_chars_and_caps_length() {
        assert_eq!(sanitize_name("fix auth/v2"), "fix_auth_v2");
        assert_eq!(sanitize_name("a.b-c_9"), "a.b-c_9");
        assert_eq!(sanitize_name(""), "unnamed");
        assert_eq!(sanitize_name(&"x".repeat(300)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn save_by_key_updates_in_place_preserving_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path());
        store.save("task", "goal", "ship search");
        store.save("task", "progress", "half done");
        store.save("task", "goal", "ship hybrid search");

        let session = store.load("task").unwrap();
        assert_eq!(session.entries.len(), 2);
        assert_eq!(session.entries[0].key, "goal");
        assert_eq!(session.entries[0].value, "ship hybrid search");
        assert_eq!(session.entries[1].key, "progress");
    }

    #[test]
    fn sessions_survive_reopen_and_delete_removes() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::open(tmp.path());
            store.save("alpha", "k", "v");
        }
        let store = SessionStore::open(tmp.path());
        assert!(store.load("alpha").is_some());
        assert_eq!(store.list().len(), 1);
        assert!(store.delete("alpha"));
        assert!(store.load("alpha").is_none());
    }
}
