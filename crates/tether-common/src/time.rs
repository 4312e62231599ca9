//! Timestamp helpers.
//!
//! Transcripts carry RFC 3339 timestamps; summaries and liveness checks
//! compare at second granularity, so everything normalizes to Unix seconds.

use chrono::DateTime;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parse an RFC 3339 timestamp string into Unix seconds.
///
/// Examples:
/// - "2026-01-31T12:45:31.053Z"
/// - "2026-01-31T12:45:31Z"
/// - "2026-01-31T12:45:31.053+00:00"
pub fn rfc3339_unix_secs(ts: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(ts).ok()?;
    let secs = parsed.timestamp();
    if secs < 0 {
        return None;
    }
    Some(secs as u64)
}

/// Current time as Unix seconds.
pub fn unix_now_secs() -> u64 {
    system_time_unix_secs(SystemTime::now())
}

/// Convert a `SystemTime` to Unix seconds (0 for pre-epoch times).
pub fn system_time_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
