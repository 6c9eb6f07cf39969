//! Ephemeral state store.
//!
//! Parks a socket's last render and assigns between the HTTP load and
//! the realtime attach, and across quick reconnects. The in-memory
//! store is a single task owning the map: callers talk to it through a
//! request/response mailbox and a janitor tick evicts expired entries.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::shutdown::Shutdown;
use crate::types::SocketId;

const MAILBOX_CAPACITY: usize = 256;
const MIN_JANITOR_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Missing or expired. Callers treat both the same: start fresh.
    #[error("no state")]
    NoState,

    #[error("state store closed")]
    Closed,
}

/// What gets parked for a socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Serialized last render, as the client has it.
    pub render: String,
    pub assigns: Value,
}

pub trait StateStore: Send + Sync {
    fn get(&self, id: SocketId) -> BoxFuture<'_, Result<StoredState, StoreError>>;

    fn set(&self, id: SocketId, state: StoredState, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>>;

    fn delete(&self, id: SocketId) -> BoxFuture<'_, Result<(), StoreError>>;
}

enum StoreOp {
    Get {
        id: SocketId,
        reply: oneshot::Sender<Result<StoredState, StoreError>>,
    },
    Set {
        id: SocketId,
        state: StoredState,
        ttl: Duration,
        reply: oneshot::Sender<()>,
    },
    Delete {
        id: SocketId,
        reply: oneshot::Sender<()>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

struct Entry {
    state: StoredState,
    expires: Instant,
}

/// Handle to the in-memory store task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    ops: mpsc::Sender<StoreOp>,
}

impl std::fmt::Debug for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreOp::Get { id, .. } => write!(f, "Get({id})"),
            StoreOp::Set { id, .. } => write!(f, "Set({id})"),
            StoreOp::Delete { id, .. } => write!(f, "Delete({id})"),
            StoreOp::Len { .. } => f.write_str("Len"),
        }
    }
}

impl MemoryStateStore {
    /// Spawn the store task. It stops when `shutdown` fires or every
    /// handle is dropped.
    pub fn spawn(janitor_interval: Duration, shutdown: Shutdown) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(run_store(rx, janitor_interval.max(MIN_JANITOR_INTERVAL), shutdown));
        MemoryStateStore { ops: tx }
    }

    /// Number of entries held, including expired ones not yet swept.
    pub async fn len(&self) -> Result<usize, StoreError> {
        self.request(|reply| StoreOp::Len { reply }).await
    }

    async fn request<T>(&self, op: impl FnOnce(oneshot::Sender<T>) -> StoreOp) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.ops.send(op(tx)).await.map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, id: SocketId) -> BoxFuture<'_, Result<StoredState, StoreError>> {
        async move { self.request(|reply| StoreOp::Get { id, reply }).await? }.boxed()
    }

    fn set(&self, id: SocketId, state: StoredState, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>> {
        async move {
            self.request(|reply| StoreOp::Set {
                id,
                state,
                ttl,
                reply,
            })
            .await
        }
        .boxed()
    }

    fn delete(&self, id: SocketId) -> BoxFuture<'_, Result<(), StoreError>> {
        async move { self.request(|reply| StoreOp::Delete { id, reply }).await }.boxed()
    }
}

async fn run_store(mut rx: mpsc::Receiver<StoreOp>, janitor_interval: Duration, mut shutdown: Shutdown) {
    let mut entries: HashMap<SocketId, Entry> = HashMap::new();
    let mut janitor = tokio::time::interval(janitor_interval);
    janitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = janitor.tick() => sweep(&mut entries, Instant::now()),
            op = rx.recv() => match op {
                Some(op) => apply(&mut entries, op),
                None => break,
            },
        }
    }
    debug!(entries = entries.len(), "state store stopped");
}

fn apply(entries: &mut HashMap<SocketId, Entry>, op: StoreOp) {
    let now = Instant::now();
    match op {
        StoreOp::Get { id, reply } => {
            let live = entries
                .get(&id)
                .filter(|entry| entry.expires > now)
                .map(|entry| entry.state.clone());
            let found = match live {
                Some(state) => Ok(state),
                None => {
                    entries.remove(&id);
                    Err(StoreError::NoState)
                }
            };
            let _ = reply.send(found);
        }
        StoreOp::Set { id, state, ttl, reply } => {
            entries.insert(
                id,
                Entry {
                    state,
                    expires: now + ttl,
                },
            );
            let _ = reply.send(());
        }
        StoreOp::Delete { id, reply } => {
            entries.remove(&id);
            let _ = reply.send(());
        }
        StoreOp::Len { reply } => {
            let _ = reply.send(entries.len());
        }
    }
}

fn sweep(entries: &mut HashMap<SocketId, Entry>, now: Instant) {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires > now);
    let evicted = before - entries.len();
    if evicted > 0 {
        debug!(evicted, "state store sweep");
    }
}
