//! Wire protocol between viewer clients and the daemon
//!
//! Newline-delimited JSON over a Unix domain socket. The broker itself never
//! parses framing; the socket server does, and hands it typed intents.

use crate::session::SessionSummary;
use crate::transcript::TranscriptEntry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Socket name for client connections
pub const SOCKET_NAME: &str = "tether.sock";

/// Get the default socket path.
///
/// Uses XDG_RUNTIME_DIR if available, falls back to the temp dir.
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    runtime_dir.join(SOCKET_NAME)
}

/// Request from a viewer client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientIntent {
    /// Attach this connection to a specific session
    Subscribe {
        project_path: String,
        session_id: String,
    },
    /// Resolve the current session for a working directory, then attach
    SubscribeCurrent { working_directory: String },
    /// List live sessions for a project
    ListSessions { project_path: String },
    /// Detach from whatever session this connection is attached to
    Unsubscribe,
    /// Liveness check
    Ping,
    /// Broker-wide counters
    Status,
}

/// Message from the daemon to a viewer client.
///
/// Everything except `Transcript` is a direct response to a request (or the
/// greeting sent when the connection opens); `Transcript` is pushed
/// asynchronously as the watched session's transcript grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent once when a connection is accepted
    Connected,
    Subscribed {
        project_path: String,
        session_id: String,
    },
    Unsubscribed,
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    Pong,
    Status {
        active_watches: usize,
        subscribers: usize,
    },
    Error {
        message: String,
    },
    /// A new transcript entry for the subscribed session
    Transcript {
        project_path: String,
        session_id: String,
        entry: TranscriptEntry,
    },
}
