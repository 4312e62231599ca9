//! Transcript line parsing.
//!
//! Session transcripts are append-only JSONL. Lines of type `user` and
//! `assistant` become [`TranscriptEntry`] values that ride the wire inside
//! `transcript` pushes; every other line type (progress, system,
//! file-history snapshots) is skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A transcript line that is not valid JSON.
#[derive(Debug, Error)]
#[error("invalid transcript line: {message}")]
pub struct ParseLineError {
    pub message: String,
}

/// Role of a message in the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A single user or assistant entry from a transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// ISO timestamp string, as recorded in the transcript
    #[serde(default)]
    pub timestamp: Option<String>,
    pub role: MessageRole,
    /// Text content of the message (if any)
    #[serde(default)]
    pub text: Option<String>,
    /// Names of tools used in this entry
    #[serde(default)]
    pub tool_names: Vec<String>,
    /// IDs of tool uses in this entry
    #[serde(default)]
    pub tool_ids: Vec<String>,
}

/// Parse a single transcript line.
///
/// Returns `Ok(Some(entry))` for user/assistant messages, `Ok(None)` for
/// other line types, or an error if the line is invalid JSON.
pub fn parse_line(line: &str) -> Result<Option<TranscriptEntry>, ParseLineError> {
    let value: Value = serde_json::from_str(line).map_err(|err| ParseLineError {
        message: err.to_string(),
    })?;

    let timestamp = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .map(String::from);

    match value.get("type").and_then(|v| v.as_str()) {
        Some("user") => {
            let text = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .map(String::from);

            Ok(Some(TranscriptEntry {
                timestamp,
                role: MessageRole::User,
                text,
                tool_names: Vec::new(),
                tool_ids: Vec::new(),
            }))
        }
        Some("assistant") => {
            let mut tool_names = Vec::new();
            let mut tool_ids = Vec::new();
            let mut text = None;

            if let Some(content) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for item in content {
                    match item.get("type").and_then(|v| v.as_str()) {
                        Some("tool_use") => {
                            if let Some(name) = item.get("name").and_then(|v| v.as_str()) {
                                tool_names.push(name.to_string());
                            }
                            if let Some(id) = item.get("id").and_then(|v| v.as_str()) {
                                tool_ids.push(id.to_string());
                            }
                        }
                        Some("text") => {
                            if let Some(t) = item.get("text").and_then(|v| v.as_str()) {
                                text = Some(t.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }

            Ok(Some(TranscriptEntry {
                timestamp,
                role: MessageRole::Assistant,
                text,
                tool_names,
                tool_ids,
            }))
        }
        _ => Ok(None),
    }
}
