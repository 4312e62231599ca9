//! Unix socket server - the transport boundary
//!
//! Clients connect to the socket and exchange newline-delimited JSON.
//! Each connection gets a bounded outbound queue drained by a writer task,
//! so a slow reader never blocks fanout; the per-connection adapter
//! implementing [`Connection`] just try-sends into that queue.

use crate::broker::SyncBroker;
use crate::registry::{Connection, ConnectionId, SendOutcome};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_common::{ClientIntent, ServerMessage, SessionKey};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Outbound queue depth per connection. When the queue is full further
/// events are dropped for that subscriber; when it is closed the
/// subscriber is detached.
const OUTBOUND_QUEUE: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection adapter handed to the broker.
pub struct SocketConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<ServerMessage>,
}

impl SocketConnection {
    fn new(outbound: mpsc::Sender<ServerMessage>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            outbound,
        })
    }
}

impl Connection for SocketConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: ServerMessage) -> SendOutcome {
        match self.outbound.try_send(message) {
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// Bind the listener, removing a stale socket file first.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Accept loop. Each connection is served by its own task.
pub async fn run(listener: UnixListener, broker: Arc<SyncBroker>) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    handle_connection(stream, broker).await;
                });
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, broker: Arc<SyncBroker>) {
    let (reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let connection = SocketConnection::new(outbound_tx);
    let id = connection.id();
    info!(connection = id, "client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!(%err, "failed to encode message");
                    continue;
                }
            };
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let _ = connection.send(ServerMessage::Connected);

    let subscriber: Arc<dyn Connection> = connection.clone();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ClientIntent>(&line) {
            Ok(intent) => handle_intent(intent, &subscriber, &broker).await,
            Err(err) => ServerMessage::Error {
                message: format!("invalid message: {err}"),
            },
        };
        if connection.send(reply) == SendOutcome::Closed {
            break;
        }
    }

    broker.connection_closed(id);
    info!(connection = id, "client disconnected");

    // Dropping our sender halves closes the outbound channel once the
    // broker has let go of the adapter; the writer drains and exits.
    drop(subscriber);
    drop(connection);
    if writer_task.await.is_err() {
        debug!("writer task aborted");
    }
}

async fn handle_intent(
    intent: ClientIntent,
    connection: &Arc<dyn Connection>,
    broker: &SyncBroker,
) -> ServerMessage {
    match intent {
        ClientIntent::Subscribe {
            project_path,
            session_id,
        } => subscribe_reply(broker, SessionKey::new(project_path, session_id), connection),

        ClientIntent::SubscribeCurrent { working_directory } => {
            match broker.current_session(&working_directory).await {
                Some(summary) => subscribe_reply(broker, summary.key(), connection),
                None => ServerMessage::Error {
                    message: "No active session found".into(),
                },
            }
        }

        ClientIntent::ListSessions { project_path } => ServerMessage::SessionsList {
            sessions: broker.active_sessions(&project_path).await,
        },

        ClientIntent::Unsubscribe => {
            broker.unsubscribe_current(connection.id());
            ServerMessage::Unsubscribed
        }

        ClientIntent::Ping => ServerMessage::Pong,

        ClientIntent::Status => {
            let status = broker.status();
            ServerMessage::Status {
                active_watches: status.active_watches,
                subscribers: status.subscribers,
            }
        }
    }
}

fn subscribe_reply(
    broker: &SyncBroker,
    key: SessionKey,
    connection: &Arc<dyn Connection>,
) -> ServerMessage {
    match broker.subscribe(key.clone(), Arc::clone(connection)) {
        Ok(()) => ServerMessage::Subscribed {
            project_path: key.project_path,
            session_id: key.session_id,
        },
        Err(err) => ServerMessage::Error {
            message: err.to_string(),
        },
    }
}
