//! Transcript tail tasks - one background task per watched session
//!
//! A tail starts at the transcript's current end (or a supplied byte
//! offset) and never replays history older than that point. The task wakes
//! on `notify` events for its file and on a poll interval; each wake reads
//! the newly appended bytes, splits complete lines (a partial trailing line
//! is carried to the next read), and fans one push per user/assistant entry
//! out to the key's subscribers, in append order.
//!
//! Transient read errors retry with bounded backoff. A file that stays
//! unreadable is terminal: the state flips to `Stopped`, one error is
//! reported to subscribers, and the registry entry is torn down.

use crate::registry::SubscriptionRegistry;
use notify::{RecursiveMode, Watcher};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tether_common::transcript;
use tether_common::{ServerMessage, SessionKey};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Ticks between forced reads when no file event arrived. Catches appends
/// the platform watcher missed, the way the directory watcher's periodic
/// full scan does.
const SAFETY_READ_TICKS: u32 = 10;

const STATE_STARTING: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Watch lifecycle, observable through [`WatchHandle::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Starting,
    Active,
    Stopped,
}

impl WatchState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_STARTING => Self::Starting,
            STATE_ACTIVE => Self::Active,
            _ => Self::Stopped,
        }
    }
}

/// Tuning for tail tasks
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Wake-up interval; also bounds how promptly a stop takes effect
    pub poll_interval: Duration,
    /// Consecutive read failures tolerated before the watch turns terminal
    pub retry_limit: u32,
    /// Base backoff between read retries (multiplied by the attempt number)
    pub retry_backoff: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            retry_limit: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("watch init failed: {0}")]
    Notify(notify::Error),
}

/// Handle to a running tail task, owned by the registry entry for its key.
///
/// Stopping discards the cursor; a later watch on the same key starts a
/// fresh tail from the file's then-current end.
pub struct WatchHandle {
    task: JoinHandle<()>,
    state: Arc<AtomicU8>,
}

impl WatchHandle {
    pub fn state(&self) -> WatchState {
        WatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Stop the tail. Prompt: the task parks only on its poll interval, so
    /// cancellation lands within one tick.
    pub fn stop(&self) {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a tail task for one session key.
///
/// `from` is a byte offset into the transcript; `None` starts at the
/// current end. On terminal failure the task reports once through
/// `registry.fail`, which tears the entry down.
pub fn spawn(
    key: SessionKey,
    path: PathBuf,
    from: Option<u64>,
    registry: Arc<SubscriptionRegistry>,
    config: TailConfig,
) -> WatchHandle {
    let state = Arc::new(AtomicU8::new(STATE_STARTING));
    let task_state = Arc::clone(&state);

    let task = tokio::spawn(async move {
        if let Err(err) = run(&key, &path, from, &registry, &config, &task_state).await {
            task_state.store(STATE_STOPPED, Ordering::SeqCst);
            info!(%key, %err, "watch terminated");
            registry.fail(
                &key,
                ServerMessage::Error {
                    message: format!("session no longer readable: {err}"),
                },
            );
        }
    });

    WatchHandle { task, state }
}

async fn run(
    key: &SessionKey,
    path: &Path,
    from: Option<u64>,
    registry: &SubscriptionRegistry,
    config: &TailConfig,
    state: &AtomicU8,
) -> Result<(), TailError> {
    // File events only serve as wakeup hints; reads are offset-driven, so a
    // missed or spurious event never produces gaps or duplicates.
    let (fs_tx, fs_rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = fs_tx.send(res);
    })
    .map_err(TailError::Notify)?;

    if let Some(parent) = path.parent()
        && let Err(err) = watcher.watch(parent, RecursiveMode::NonRecursive)
    {
        debug!(%key, %err, "file watch unavailable, falling back to polling");
    }

    let mut offset = match from {
        Some(offset) => offset,
        None => tokio::fs::metadata(path).await?.len(),
    };
    state.store(STATE_ACTIVE, Ordering::SeqCst);
    debug!(%key, offset, "watch active");

    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut remainder = Vec::new();
    let mut failures: u32 = 0;
    let mut ticks_since_read = SAFETY_READ_TICKS;

    loop {
        interval.tick().await;
        ticks_since_read += 1;

        if !drain_file_events(&fs_rx, path) && ticks_since_read < SAFETY_READ_TICKS {
            continue;
        }
        ticks_since_read = 0;

        match read_appended(path, &mut offset, &mut remainder).await {
            Ok(lines) => {
                failures = 0;
                for line in &lines {
                    match transcript::parse_line(line) {
                        Ok(Some(entry)) => {
                            trace!(%key, role = ?entry.role, "transcript entry");
                            registry.fanout(
                                key,
                                &ServerMessage::Transcript {
                                    project_path: key.project_path.clone(),
                                    session_id: key.session_id.clone(),
                                    entry,
                                },
                            );
                        }
                        Ok(None) => {}
                        Err(err) => trace!(%key, %err, "skipping unparsable line"),
                    }
                }
            }
            Err(err) if failures < config.retry_limit => {
                failures += 1;
                warn!(%key, %err, attempt = failures, "transcript read failed, retrying");
                tokio::time::sleep(config.retry_backoff * failures).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Drain pending file events, reporting whether any touched our transcript.
fn drain_file_events(rx: &Receiver<notify::Result<notify::Event>>, path: &Path) -> bool {
    let mut dirty = false;
    while let Ok(result) = rx.try_recv() {
        match result {
            Ok(event) => {
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == path.file_name())
                {
                    dirty = true;
                }
            }
            Err(err) => {
                warn!(%err, "file watch error");
                dirty = true;
            }
        }
    }
    dirty
}

/// Read bytes appended since `offset`, returning the complete lines they
/// form. A trailing partial line stays in `remainder` (as raw bytes, so a
/// character split across reads survives) until its newline arrives.
async fn read_appended(
    path: &Path,
    offset: &mut u64,
    remainder: &mut Vec<u8>,
) -> io::Result<Vec<String>> {
    let len = tokio::fs::metadata(path).await?.len();
    if len < *offset {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "transcript truncated",
        ));
    }
    if len == *offset {
        return Ok(Vec::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(*offset)).await?;
    let mut buf = vec![0u8; (len - *offset) as usize];
    file.read_exact(&mut buf).await?;
    *offset = len;

    remainder.extend_from_slice(&buf);

    let mut lines = Vec::new();
    while let Some(pos) = remainder.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = remainder.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

#[cfg(test)]
pub(crate) fn idle_watch() -> (WatchHandle, Arc<AtomicU8>) {
    let state = Arc::new(AtomicU8::new(STATE_ACTIVE));
    let task = tokio::spawn(std::future::pending::<()>());
    let handle = WatchHandle {
        task,
        state: Arc::clone(&state),
    };
    (handle, state)
}

#[cfg(test)]
pub(crate) fn probe_state(state: &AtomicU8) -> WatchState {
    WatchState::from_u8(state.load(Ordering::SeqCst))
}
