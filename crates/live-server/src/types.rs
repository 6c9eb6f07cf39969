//! Shared types for the live server.
//!
//! This module defines:
//! - `SessionId` / `SocketId`: identities of a browser session and its socket
//! - `LiveState`: bounds every application state type must meet
//! - channel aliases between sockets, the engine and the connection loop

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use live_protocol::Event;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LiveError;

/// Application state ("assigns") owned by a socket.
///
/// Serializable so it can be parked in the state store between the
/// HTTP render and the realtime attach.
pub trait LiveState: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> LiveState for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Opaque session identifier, shared by the HTTP load and the later
/// realtime attach of the same browser tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    /// Fresh id, unique within this process.
    pub fn generate() -> Self {
        let seq = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        SessionId(format!("{nanos:x}-{seq:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a socket. A session has at most one live socket, so
/// the socket id is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketId(pub String);

impl SocketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&SessionId> for SocketId {
    fn from(session: &SessionId) -> Self {
        SocketId(session.0.clone())
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events queued for one connection's writer.
pub type OutboundTx = mpsc::Sender<Event>;
pub type OutboundRx = mpsc::Receiver<Event>;

/// A server-originated event waiting for dispatch. `target: None`
/// means every socket of the engine.
#[derive(Debug)]
pub struct SelfRequest {
    pub target: Option<SocketId>,
    pub event: Event,
}

/// Channel from sockets and broadcasts → engine self-event loop.
pub type SelfTx = mpsc::UnboundedSender<SelfRequest>;
pub type SelfRx = mpsc::UnboundedReceiver<SelfRequest>;

/// Replacement for an engine's local broadcast, installed by `PubSub::subscribe`.
pub type BroadcastHook = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), LiveError>> + Send + Sync>;
