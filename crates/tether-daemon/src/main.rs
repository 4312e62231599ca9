//! tether - streams coding-assistant session transcripts to viewers
//!
//! Binds the client socket, serves subscribe/list requests, and tears all
//! watches down on ctrl-c.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_common::socket_path;
use tether_common::store::TranscriptStore;
use tether_daemon::broker::SyncBroker;
use tether_daemon::discovery::SessionDiscovery;
use tether_daemon::server;
use tether_daemon::tailer::TailConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tether",
    about = "Session synchronization broker for coding-assistant transcripts"
)]
struct Args {
    /// Socket to listen on (defaults to $XDG_RUNTIME_DIR/tether.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Transcript store root (defaults to ~/.claude/projects)
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Maximum number of concurrently watched sessions
    #[arg(long, default_value_t = 64)]
    max_watches: usize,

    /// Seconds without activity before a session stops counting as live
    #[arg(long, default_value_t = 600)]
    active_threshold: u64,
}

#[tokio::main]
async fn main() {
    let Args {
        socket,
        store_root,
        max_watches,
        active_threshold,
    } = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = match store_root {
        Some(root) => TranscriptStore::with_root(root),
        None => TranscriptStore::new(),
    };
    info!("transcript store at {}", store.root().display());

    let discovery = SessionDiscovery::new(store.clone())
        .with_active_window(Duration::from_secs(active_threshold));
    let broker = Arc::new(SyncBroker::new(
        store,
        discovery,
        max_watches,
        TailConfig::default(),
    ));

    let socket = socket.unwrap_or_else(socket_path);
    let listener = match server::bind(&socket) {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", socket.display());
            return;
        }
    };
    info!("listening on {}", socket.display());

    tokio::select! {
        result = server::run(listener, Arc::clone(&broker)) => {
            if let Err(err) = result {
                error!("server error: {err}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    broker.shutdown();
}
