//! On-disk transcript store.
//!
//! The durable session store is the assistant CLI's own layout:
//! `<root>/<escaped-project-path>/<session-id>.jsonl`, where the escaping
//! replaces `/` with `-`. The root defaults to `~/.claude/projects` and is
//! injectable so tests can point it at a temporary directory.

use crate::session::{SessionKey, SessionSummary};
use crate::time;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Escape a project path for use as a store directory name.
///
/// Example: `/Users/dev/project` -> `-Users-dev-project`
pub fn escape_path(path: &str) -> String {
    path.replace('/', "-")
}

/// Unescape a store directory name back to a project path.
///
/// Example: `-Users-dev-project` -> `/Users/dev/project`
pub fn unescape_path(escaped: &str) -> String {
    if let Some(stripped) = escaped.strip_prefix('-') {
        // Leading `-` represents the root `/`
        format!("/{}", stripped.replace('-', "/"))
    } else {
        escaped.replace('-', "/")
    }
}

/// Get the home directory, with fallback to the current directory.
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Read-side view of the transcript store.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    root: PathBuf,
}

impl TranscriptStore {
    /// Store rooted at the default location, `~/.claude/projects`.
    pub fn new() -> Self {
        Self {
            root: home_dir().join(".claude").join("projects"),
        }
    }

    /// Store rooted at an explicit directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a project's transcripts.
    pub fn project_dir(&self, project_path: &str) -> PathBuf {
        self.root.join(escape_path(project_path))
    }

    /// Transcript file for a session key.
    pub fn transcript_path(&self, key: &SessionKey) -> PathBuf {
        self.project_dir(&key.project_path)
            .join(format!("{}.jsonl", key.session_id))
    }

    /// Summaries for every session recorded under a project.
    ///
    /// Unreadable files are skipped; a missing project directory yields an
    /// empty list. Order is unspecified; callers sort.
    pub fn project_sessions(&self, project_path: &str) -> Vec<SessionSummary> {
        let dir = self.project_dir(project_path);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let last_activity = last_event_unix_secs(&path)
                .or_else(|| {
                    entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .map(time::system_time_unix_secs)
                })
                .unwrap_or(0);

            sessions.push(SessionSummary {
                project_path: project_path.to_string(),
                session_id: session_id.to_string(),
                last_activity,
            });
        }
        sessions
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan a transcript for the timestamp of its last event.
///
/// Unparsable lines are skipped, not fatal.
fn last_event_unix_secs(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    let mut last = None;

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if let Some(secs) = value
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(time::rfc3339_unix_secs)
        {
            last = Some(secs);
        }
    }
    last
}
