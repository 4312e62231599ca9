//! Synchronization broker - the public operations over registry, discovery
//! and watch lifecycle
//!
//! A connection is attached to at most one session key at a time;
//! re-subscribing moves it (an explicit detach from the old key, then an
//! attach to the new one). Connection close is the only implicit
//! transition: it detaches the connection exactly like an explicit
//! unsubscribe.

use crate::discovery::SessionDiscovery;
use crate::registry::{Connection, ConnectionId, SubscriptionRegistry};
use crate::tailer::{self, TailConfig};
use dashmap::DashMap;
use std::sync::Arc;
use tether_common::store::TranscriptStore;
use tether_common::{SessionKey, SessionSummary};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("Too many active watches")]
    Capacity,
}

/// Broker-wide counters, reported to clients on request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStatus {
    pub active_watches: usize,
    pub subscribers: usize,
}

pub struct SyncBroker {
    registry: Arc<SubscriptionRegistry>,
    discovery: SessionDiscovery,
    store: TranscriptStore,
    /// Which key each connection is currently attached to
    attachments: DashMap<ConnectionId, SessionKey>,
    tail_config: TailConfig,
}

impl SyncBroker {
    pub fn new(
        store: TranscriptStore,
        discovery: SessionDiscovery,
        max_watches: usize,
        tail_config: TailConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SubscriptionRegistry::new(max_watches)),
            discovery,
            store,
            attachments: DashMap::new(),
            tail_config,
        }
    }

    /// Attach a connection to a session; it starts receiving fanout events
    /// for that key. If the connection was attached to a different key, it
    /// is detached from the old one first.
    pub fn subscribe(
        &self,
        key: SessionKey,
        connection: Arc<dyn Connection>,
    ) -> Result<(), SubscribeError> {
        let id = connection.id();
        if let Some((_, previous)) = self.attachments.remove_if(&id, |_, attached| *attached != key)
        {
            debug!(connection = id, %previous, %key, "moving subscription");
            self.registry.detach(&previous, id);
        }

        let path = self.store.transcript_path(&key);
        let registry = Arc::clone(&self.registry);
        let config = self.tail_config.clone();
        let watch_key = key.clone();

        match self.registry.attach(&key, connection, move || {
            tailer::spawn(watch_key, path, None, registry, config)
        }) {
            Ok(outcome) => {
                info!(connection = id, %key, ?outcome, "subscribed");
                self.attachments.insert(id, key);
                Ok(())
            }
            Err(_) => Err(SubscribeError::Capacity),
        }
    }

    /// Detach a connection from a specific key. Safe to call when it was
    /// never attached.
    pub fn unsubscribe(&self, key: &SessionKey, id: ConnectionId) {
        self.registry.detach(key, id);
        self.attachments.remove_if(&id, |_, attached| attached == key);
    }

    /// Detach a connection from whatever key it is attached to. Returns
    /// whether it was attached at all.
    pub fn unsubscribe_current(&self, id: ConnectionId) -> bool {
        match self.attachments.remove(&id) {
            Some((_, key)) => {
                self.registry.detach(&key, id);
                true
            }
            None => false,
        }
    }

    /// Transport-layer close signal: identical to an explicit unsubscribe.
    pub fn connection_closed(&self, id: ConnectionId) {
        if self.unsubscribe_current(id) {
            debug!(connection = id, "detached on close");
        }
    }

    /// The current session for a working directory. Does not subscribe.
    pub async fn current_session(&self, working_directory: &str) -> Option<SessionSummary> {
        self.discovery.current_session(working_directory).await
    }

    /// Live sessions for a project, most recent first. Pure read.
    pub async fn active_sessions(&self, project_path: &str) -> Vec<SessionSummary> {
        self.discovery.active_sessions(project_path).await
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            active_watches: self.registry.watch_count(),
            subscribers: self.registry.subscriber_count(),
        }
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Stop every watch and forget all attachments. Called at shutdown.
    pub fn shutdown(&self) {
        info!(watches = self.registry.watch_count(), "broker shutting down");
        self.registry.shutdown();
        self.attachments.clear();
    }
}
