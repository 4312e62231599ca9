//! Session synchronization broker.
//!
//! Keeps any number of viewer clients in sync with ongoing coding-assistant
//! sessions: clients subscribe to a session key, the daemon tails that
//! session's transcript, and every new entry is fanned out to all current
//! subscribers of the key.
//!
//! - [`registry`]: session key -> subscriber set + watch, the only shared
//!   mutable state
//! - [`discovery`]: resolves "current session for a directory" and "live
//!   sessions for a project" from the transcript store
//! - [`tailer`]: one background task per watched session
//! - [`broker`]: orchestrates the above behind the public operations
//! - [`server`]: Unix-socket transport boundary

pub mod broker;
pub mod discovery;
pub mod registry;
pub mod server;
pub mod tailer;

#[cfg(test)]
pub(crate) mod test_support;
