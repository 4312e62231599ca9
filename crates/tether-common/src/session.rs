//! Session identity and discovery snapshots

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one assistant session: the project it runs in plus its id.
///
/// All session-scoped broker state is keyed by this pair; at most one live
/// watch exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub project_path: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(project_path: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_path, self.session_id)
    }
}

/// Point-in-time discovery result. Never mutated after creation.
///
/// `last_activity` is Unix seconds, taken from the transcript's last event
/// timestamp when one parses, otherwise from file modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub project_path: String,
    pub session_id: String,
    pub last_activity: u64,
}

impl SessionSummary {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.project_path.clone(), self.session_id.clone())
    }
}
