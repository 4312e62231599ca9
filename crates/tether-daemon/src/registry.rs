//! Subscription registry - maps session keys to subscriber sets and watches
//!
//! The registry is the only shared mutable structure in the broker. Entries
//! live in a sharded map so operations on unrelated keys never contend;
//! everything touching one key serializes through its shard.
//!
//! Invariant: an entry exists iff its subscriber set is non-empty. The entry
//! and its watch are created on first attach and removed together when the
//! last subscriber detaches.

use crate::tailer::WatchHandle;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tether_common::{ServerMessage, SessionKey};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Process-local identifier for a client connection
pub type ConnectionId = u64;

/// Result of pushing one message to one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for delivery
    Sent,
    /// Subscriber's queue is full; this message was dropped for it
    Dropped,
    /// Transport is closed; the subscriber should be detached
    Closed,
}

/// Connection abstraction the broker requires from the transport layer.
///
/// `send` must never block: the socket adapter backs it with a bounded
/// queue, tests back it with a collector.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;
    fn send(&self, message: ServerMessage) -> SendOutcome;
}

/// Whether an attach created the key's watch or joined an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    Started,
    Joined,
}

#[derive(Debug, Error)]
#[error("Too many active watches")]
pub struct CapacityExceeded;

struct SessionEntry {
    subscribers: HashMap<ConnectionId, Arc<dyn Connection>>,
    watch: WatchHandle,
}

pub struct SubscriptionRegistry {
    entries: DashMap<SessionKey, SessionEntry>,
    max_watches: usize,
}

impl SubscriptionRegistry {
    pub fn new(max_watches: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_watches,
        }
    }

    /// Add a subscriber to a key, starting a watch if this is the first one.
    ///
    /// `start_watch` is invoked inside the per-key critical section, so a
    /// concurrent attach on the same key cannot start a second watch.
    /// Idempotent per connection id. Rejects new entries past the watch
    /// capacity; joining an existing entry always succeeds.
    pub fn attach(
        &self,
        key: &SessionKey,
        subscriber: Arc<dyn Connection>,
        start_watch: impl FnOnce() -> WatchHandle,
    ) -> Result<Attach, CapacityExceeded> {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_watches {
            warn!(%key, max = self.max_watches, "watch capacity reached");
            return Err(CapacityExceeded);
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied
                    .get_mut()
                    .subscribers
                    .insert(subscriber.id(), subscriber);
                Ok(Attach::Joined)
            }
            Entry::Vacant(vacant) => {
                info!(%key, "starting watch");
                let mut subscribers: HashMap<ConnectionId, Arc<dyn Connection>> = HashMap::new();
                subscribers.insert(subscriber.id(), subscriber);
                vacant.insert(SessionEntry {
                    subscribers,
                    watch: start_watch(),
                });
                Ok(Attach::Started)
            }
        }
    }

    /// Remove a subscriber from a key.
    ///
    /// Returns whether this removal emptied the set; if it did, the entry
    /// and its watch are gone by the time this returns. Detaching a
    /// subscriber that was never attached is a no-op.
    pub fn detach(&self, key: &SessionKey, id: ConnectionId) -> bool {
        let emptied = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.subscribers.remove(&id).is_none() {
                    return false;
                }
                debug!(%key, connection = id, "detached");
                entry.subscribers.is_empty()
            }
            None => return false,
        };

        if emptied {
            self.remove_if_empty(key);
        }
        emptied
    }

    /// Deliver a message to every current subscriber of a key.
    ///
    /// Best-effort per subscriber: a closed transport detaches that
    /// subscriber without affecting delivery to the others, and if that
    /// empties the set the entry is torn down like a normal last detach.
    pub fn fanout(&self, key: &SessionKey, message: &ServerMessage) {
        let emptied = match self.entries.get_mut(key) {
            Some(mut entry) => {
                let closed: Vec<ConnectionId> = entry
                    .subscribers
                    .iter()
                    .filter_map(|(id, connection)| match connection.send(message.clone()) {
                        SendOutcome::Sent => None,
                        SendOutcome::Dropped => {
                            warn!(%key, connection = *id, "subscriber queue full, event dropped");
                            None
                        }
                        SendOutcome::Closed => Some(*id),
                    })
                    .collect();

                for id in closed {
                    debug!(%key, connection = id, "subscriber transport closed, detaching");
                    entry.subscribers.remove(&id);
                }
                entry.subscribers.is_empty()
            }
            None => false,
        };

        if emptied {
            self.remove_if_empty(key);
        }
    }

    /// Terminal-error path for a watch: report the error once to all
    /// current subscribers, then tear the entry down as if they had all
    /// detached.
    pub fn fail(&self, key: &SessionKey, message: ServerMessage) {
        if let Some((_, entry)) = self.entries.remove(key) {
            for connection in entry.subscribers.values() {
                let _ = connection.send(message.clone());
            }
            entry.watch.stop();
            info!(%key, "entry torn down after watch failure");
        }
    }

    /// Stop every watch and drop all entries. Called at process shutdown.
    pub fn shutdown(&self) {
        self.entries.retain(|key, entry| {
            entry.watch.stop();
            debug!(%key, "watch stopped at shutdown");
            false
        });
    }

    pub fn watch_count(&self) -> usize {
        self.entries.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.entries.iter().map(|e| e.subscribers.len()).sum()
    }

    pub fn is_watching(&self, key: &SessionKey) -> bool {
        self.entries.contains_key(key)
    }

    fn remove_if_empty(&self, key: &SessionKey) {
        if let Some((_, entry)) = self.entries.remove_if(key, |_, e| e.subscribers.is_empty()) {
            entry.watch.stop();
            debug!(%key, "last subscriber gone, watch stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer;
    use crate::test_support::TestConnection;
    use tether_common::transcript::{MessageRole, TranscriptEntry};

    fn push(text: &str) -> ServerMessage {
        ServerMessage::Transcript {
            project_path: "/p".into(),
            session_id: "s1".into(),
            entry: TranscriptEntry {
                timestamp: None,
                role: MessageRole::User,
                text: Some(text.into()),
                tool_names: Vec::new(),
                tool_ids: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn entry_exists_iff_subscribers() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");
        let conn = TestConnection::new(1);

        assert!(!registry.is_watching(&key));

        let (watch, _) = tailer::idle_watch();
        let outcome = registry.attach(&key, conn.clone(), || watch).unwrap();
        assert_eq!(outcome, Attach::Started);
        assert!(registry.is_watching(&key));
        assert_eq!(registry.subscriber_count(), 1);

        assert!(registry.detach(&key, 1));
        assert!(!registry.is_watching(&key));
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn attach_is_idempotent_per_connection() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");
        let conn = TestConnection::new(1);

        let (watch, _) = tailer::idle_watch();
        registry.attach(&key, conn.clone(), || watch).unwrap();
        let outcome = registry
            .attach(&key, conn.clone(), || unreachable!("watch already running"))
            .unwrap();
        assert_eq!(outcome, Attach::Joined);
        assert_eq!(registry.subscriber_count(), 1);

        registry.fanout(&key, &push("E"));
        assert_eq!(conn.sent().len(), 1);
    }

    #[tokio::test]
    async fn detach_last_subscriber_stops_watch() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");
        let conn = TestConnection::new(1);

        let (watch, state) = tailer::idle_watch();
        registry.attach(&key, conn, || watch).unwrap();
        assert_eq!(tailer::probe_state(&state), tailer::WatchState::Active);

        assert!(registry.detach(&key, 1));
        assert_eq!(tailer::probe_state(&state), tailer::WatchState::Stopped);
    }

    #[tokio::test]
    async fn detach_keeps_watch_while_subscribers_remain() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");
        let a = TestConnection::new(1);
        let b = TestConnection::new(2);

        let (watch, state) = tailer::idle_watch();
        registry.attach(&key, a, || watch).unwrap();
        registry
            .attach(&key, b, || unreachable!("watch already running"))
            .unwrap();

        assert!(!registry.detach(&key, 1));
        assert!(registry.is_watching(&key));
        assert_eq!(tailer::probe_state(&state), tailer::WatchState::Active);
    }

    #[tokio::test]
    async fn detach_unknown_subscriber_is_noop() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");

        assert!(!registry.detach(&key, 99));

        let (watch, _) = tailer::idle_watch();
        registry.attach(&key, TestConnection::new(1), || watch).unwrap();
        assert!(!registry.detach(&key, 99));
        assert!(registry.is_watching(&key));
    }

    #[tokio::test]
    async fn fanout_detaches_closed_subscriber_only() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");
        let open = TestConnection::new(1);
        let closed = TestConnection::new(2);

        let (watch, _) = tailer::idle_watch();
        registry.attach(&key, open.clone(), || watch).unwrap();
        registry
            .attach(&key, closed.clone(), || unreachable!())
            .unwrap();
        closed.close();

        registry.fanout(&key, &push("E1"));
        assert_eq!(registry.subscriber_count(), 1);
        assert_eq!(open.sent().len(), 1);

        registry.fanout(&key, &push("E2"));
        assert_eq!(open.sent().len(), 2);
        assert!(closed.sent().is_empty());
    }

    #[tokio::test]
    async fn fanout_to_last_closed_subscriber_tears_down() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");
        let conn = TestConnection::new(1);

        let (watch, state) = tailer::idle_watch();
        registry.attach(&key, conn.clone(), || watch).unwrap();
        conn.close();

        registry.fanout(&key, &push("E"));
        assert!(!registry.is_watching(&key));
        assert_eq!(tailer::probe_state(&state), tailer::WatchState::Stopped);
    }

    #[tokio::test]
    async fn fanout_to_unknown_key_is_noop() {
        let registry = SubscriptionRegistry::new(8);
        registry.fanout(&SessionKey::new("/p", "nope"), &push("E"));
    }

    #[tokio::test]
    async fn capacity_rejects_new_watches_not_joins() {
        let registry = SubscriptionRegistry::new(1);
        let k1 = SessionKey::new("/p", "s1");
        let k2 = SessionKey::new("/p", "s2");

        let (watch, _) = tailer::idle_watch();
        registry.attach(&k1, TestConnection::new(1), || watch).unwrap();

        let result = registry.attach(&k2, TestConnection::new(2), || unreachable!());
        assert!(result.is_err());
        assert!(!registry.is_watching(&k2));

        // Joining the existing entry is still allowed at capacity
        let outcome = registry
            .attach(&k1, TestConnection::new(3), || unreachable!())
            .unwrap();
        assert_eq!(outcome, Attach::Joined);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let registry = SubscriptionRegistry::new(8);
        let k1 = SessionKey::new("/p", "s1");
        let k2 = SessionKey::new("/q", "s2");
        let a = TestConnection::new(1);
        let b = TestConnection::new(2);

        let (w1, _) = tailer::idle_watch();
        let (w2, state2) = tailer::idle_watch();
        registry.attach(&k1, a.clone(), || w1).unwrap();
        registry.attach(&k2, b.clone(), || w2).unwrap();

        registry.detach(&k1, 1);
        assert!(!registry.is_watching(&k1));
        assert!(registry.is_watching(&k2));
        assert_eq!(tailer::probe_state(&state2), tailer::WatchState::Active);

        registry.fanout(&k2, &push("E"));
        assert_eq!(b.sent().len(), 1);
        assert!(a.sent().is_empty());
    }

    #[tokio::test]
    async fn fail_reports_once_and_tears_down() {
        let registry = SubscriptionRegistry::new(8);
        let key = SessionKey::new("/p", "s1");
        let conn = TestConnection::new(1);

        let (watch, state) = tailer::idle_watch();
        registry.attach(&key, conn.clone(), || watch).unwrap();

        registry.fail(
            &key,
            ServerMessage::Error {
                message: "session no longer readable".into(),
            },
        );

        assert!(!registry.is_watching(&key));
        assert_eq!(tailer::probe_state(&state), tailer::WatchState::Stopped);
        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let registry = SubscriptionRegistry::new(8);
        let (w1, state1) = tailer::idle_watch();
        let (w2, state2) = tailer::idle_watch();
        registry
            .attach(&SessionKey::new("/p", "s1"), TestConnection::new(1), || w1)
            .unwrap();
        registry
            .attach(&SessionKey::new("/q", "s2"), TestConnection::new(2), || w2)
            .unwrap();

        registry.shutdown();
        assert_eq!(registry.watch_count(), 0);
        assert_eq!(tailer::probe_state(&state1), tailer::WatchState::Stopped);
        assert_eq!(tailer::probe_state(&state2), tailer::WatchState::Stopped);
    }
}
