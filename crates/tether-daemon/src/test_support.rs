//! Shared helpers for unit tests.

use crate::registry::{Connection, ConnectionId, SendOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_common::ServerMessage;

/// In-memory connection: collects everything sent to it, and can be closed
/// to simulate a dropped transport.
pub(crate) struct TestConnection {
    id: ConnectionId,
    closed: AtomicBool,
    sent: Mutex<Vec<ServerMessage>>,
}

impl TestConnection {
    pub(crate) fn new(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<ServerMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Connection for TestConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: ServerMessage) -> SendOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return SendOutcome::Closed;
        }
        self.sent.lock().unwrap().push(message);
        SendOutcome::Sent
    }
}

/// Poll a condition until it holds, panicking after ~2 seconds.
pub(crate) async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within timeout");
}
