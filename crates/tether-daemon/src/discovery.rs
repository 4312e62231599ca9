//! Session discovery - resolves working directories and projects to sessions
//!
//! Pure reads over the transcript store. Misses are empty results, never
//! errors. Scans run on the blocking pool under a timeout so a slow or huge
//! store cannot hang a client connection.

use std::path::Path;
use std::time::Duration;
use tether_common::SessionSummary;
use tether_common::store::TranscriptStore;
use tether_common::time;
use tracing::warn;

/// How recently a session must have been active to count as live
pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(600);

/// Upper bound on one discovery scan
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionDiscovery {
    store: TranscriptStore,
    active_window: Duration,
    query_timeout: Duration,
}

impl SessionDiscovery {
    pub fn new(store: TranscriptStore) -> Self {
        Self {
            store,
            active_window: DEFAULT_ACTIVE_WINDOW,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_active_window(mut self, window: Duration) -> Self {
        self.active_window = window;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// The live session a viewer in `working_directory` most plausibly
    /// means: the most recently active one recorded for that directory or
    /// any of its ancestors. `None` means "nothing to subscribe to".
    pub async fn current_session(&self, working_directory: &str) -> Option<SessionSummary> {
        let store = self.store.clone();
        let directory = working_directory.to_string();
        let window = self.active_window;

        let scan = tokio::task::spawn_blocking(move || current_session_in(&store, &directory, window));
        match tokio::time::timeout(self.query_timeout, scan).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(%err, "current-session scan failed");
                None
            }
            Err(_) => {
                warn!("current-session scan timed out");
                None
            }
        }
    }

    /// All live sessions for a project, most recent first.
    pub async fn active_sessions(&self, project_path: &str) -> Vec<SessionSummary> {
        let store = self.store.clone();
        let project = project_path.to_string();
        let window = self.active_window;

        let scan = tokio::task::spawn_blocking(move || active_sessions_in(&store, &project, window));
        match tokio::time::timeout(self.query_timeout, scan).await {
            Ok(Ok(sessions)) => sessions,
            Ok(Err(err)) => {
                warn!(%err, "session-list scan failed");
                Vec::new()
            }
            Err(_) => {
                warn!("session-list scan timed out");
                Vec::new()
            }
        }
    }
}

fn current_session_in(
    store: &TranscriptStore,
    working_directory: &str,
    window: Duration,
) -> Option<SessionSummary> {
    let now = time::unix_now_secs();
    let mut best: Option<SessionSummary> = None;

    for project in candidate_projects(working_directory) {
        for candidate in store.project_sessions(&project) {
            if !is_live(&candidate, now, window) {
                continue;
            }
            if best.as_ref().is_none_or(|current| prefers(&candidate, current)) {
                best = Some(candidate);
            }
        }
    }
    best
}

fn active_sessions_in(
    store: &TranscriptStore,
    project_path: &str,
    window: Duration,
) -> Vec<SessionSummary> {
    let now = time::unix_now_secs();
    let mut sessions: Vec<SessionSummary> = store
        .project_sessions(project_path)
        .into_iter()
        .filter(|summary| is_live(summary, now, window))
        .collect();

    sessions.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    sessions
}

/// The working directory and each of its ancestors, as project-path
/// candidates. A session recorded for `/a` matches a viewer in `/a/sub`.
fn candidate_projects(working_directory: &str) -> Vec<String> {
    Path::new(working_directory)
        .ancestors()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_live(summary: &SessionSummary, now: u64, window: Duration) -> bool {
    now.saturating_sub(summary.last_activity) <= window.as_secs()
}

/// Ordering for current-session resolution: most recent activity wins;
/// equal timestamps prefer the deeper project path, then lexicographic
/// order, so the result is deterministic.
fn prefers(candidate: &SessionSummary, current: &SessionSummary) -> bool {
    if candidate.last_activity != current.last_activity {
        return candidate.last_activity > current.last_activity;
    }
    if candidate.project_path.len() != current.project_path.len() {
        return candidate.project_path.len() > current.project_path.len();
    }
    if candidate.project_path != current.project_path {
        return candidate.project_path < current.project_path;
    }
    candidate.session_id < current.session_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use std::io::Write;

    fn rfc3339_secs_ago(secs: i64) -> String {
        (Utc::now() - TimeDelta::seconds(secs)).to_rfc3339()
    }

    fn write_session(store: &TranscriptStore, project: &str, session: &str, last_ts: &str) {
        let dir = store.project_dir(project);
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = std::fs::File::create(dir.join(format!("{session}.jsonl"))).unwrap();
        writeln!(
            file,
            r#"{{"type":"user","message":{{"role":"user","content":"hi"}},"timestamp":"{last_ts}"}}"#
        )
        .unwrap();
    }

    fn discovery(root: &Path) -> SessionDiscovery {
        SessionDiscovery::new(TranscriptStore::with_root(root))
    }

    #[tokio::test]
    async fn current_session_picks_most_recent() {
        let root = tempfile::tempdir().unwrap();
        let store = TranscriptStore::with_root(root.path());
        write_session(&store, "/a", "older", &rfc3339_secs_ago(120));
        write_session(&store, "/a", "newer", &rfc3339_secs_ago(10));

        let found = discovery(root.path()).current_session("/a").await.unwrap();
        assert_eq!(found.session_id, "newer");
    }

    #[tokio::test]
    async fn current_session_matches_ancestor_project() {
        let root = tempfile::tempdir().unwrap();
        let store = TranscriptStore::with_root(root.path());
        write_session(&store, "/a", "s1", &rfc3339_secs_ago(10));

        let found = discovery(root.path())
            .current_session("/a/sub/dir")
            .await
            .unwrap();
        assert_eq!(found.project_path, "/a");
        assert_eq!(found.session_id, "s1");
    }

    #[tokio::test]
    async fn current_session_prefers_deeper_project_on_tie() {
        let root = tempfile::tempdir().unwrap();
        let store = TranscriptStore::with_root(root.path());
        let ts = rfc3339_secs_ago(10);
        write_session(&store, "/a", "shallow", &ts);
        write_session(&store, "/a/sub", "deep", &ts);

        let found = discovery(root.path())
            .current_session("/a/sub")
            .await
            .unwrap();
        assert_eq!(found.session_id, "deep");
    }

    #[tokio::test]
    async fn current_session_none_when_nothing_matches() {
        let root = tempfile::tempdir().unwrap();
        assert!(discovery(root.path()).current_session("/nowhere").await.is_none());
    }

    #[tokio::test]
    async fn current_session_ignores_stale_sessions() {
        let root = tempfile::tempdir().unwrap();
        let store = TranscriptStore::with_root(root.path());
        write_session(&store, "/a", "stale", &rfc3339_secs_ago(3600));

        let result = discovery(root.path())
            .with_active_window(Duration::from_secs(600))
            .current_session("/a")
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn active_sessions_ordered_by_recency() {
        let root = tempfile::tempdir().unwrap();
        let store = TranscriptStore::with_root(root.path());
        write_session(&store, "/a", "s-mid", &rfc3339_secs_ago(60));
        write_session(&store, "/a", "s-new", &rfc3339_secs_ago(5));
        write_session(&store, "/a", "s-old", &rfc3339_secs_ago(300));

        let sessions = discovery(root.path()).active_sessions("/a").await;
        let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s-new", "s-mid", "s-old"]);
    }

    #[tokio::test]
    async fn active_sessions_excludes_stale() {
        let root = tempfile::tempdir().unwrap();
        let store = TranscriptStore::with_root(root.path());
        write_session(&store, "/a", "live", &rfc3339_secs_ago(10));
        write_session(&store, "/a", "dead", &rfc3339_secs_ago(3600));

        let sessions = discovery(root.path()).active_sessions("/a").await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "live");
    }

    #[tokio::test]
    async fn active_sessions_empty_project_is_empty() {
        let root = tempfile::tempdir().unwrap();
        assert!(discovery(root.path()).active_sessions("/nowhere").await.is_empty());
    }

    #[tokio::test]
    async fn mtime_fallback_drives_liveness() {
        // A transcript with no parsable timestamps falls back to mtime,
        // which filetime pins far in the past here.
        let root = tempfile::tempdir().unwrap();
        let store = TranscriptStore::with_root(root.path());
        let dir = store.project_dir("/a");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("s1.jsonl");
        std::fs::write(&path, "{\"type\":\"summary\"}\n").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();

        let sessions = discovery(root.path()).active_sessions("/a").await;
        assert!(sessions.is_empty());
    }

    #[test]
    fn candidate_projects_walks_ancestors() {
        let projects = candidate_projects("/a/b/c");
        assert_eq!(projects, vec!["/a/b/c", "/a/b", "/a", "/"]);
    }
}
