//! One browser session's live state.
//!
//! A socket owns:
//! - the assigns and the last rendered tree, behind one async mutex so
//!   that mutate → render → diff → enqueue never interleaves for the
//!   same socket;
//! - the sending side of the bounded outbound queue, drained by the
//!   connection writer;
//! - upload configuration and the latest validated upload descriptors;
//! - effects queued by handlers (redirects, URL patches), flushed after
//!   the render that follows the handler.

use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use live_core::upload::UPLOADS_KEY;
use live_core::{validate_uploads, Node, Params, Upload, UploadConfig, UploadContext};
use live_protocol::Event;
use serde_json::Value;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::error::LiveError;
use crate::handler::{scoped_event_name, SelfHandlers};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::types::{LiveState, OutboundTx, SelfRequest, SelfTx, SessionId, SocketId};

/// Assigns plus the tree the client currently shows.
pub struct SocketState<S> {
    pub assigns: S,
    pub latest_render: Option<Node>,
}

struct UploadState {
    configs: Vec<UploadConfig>,
    context: UploadContext,
    ceiling: u64,
    staging_dir: PathBuf,
}

pub(crate) struct SocketParts<S> {
    pub session: SessionId,
    pub connected: bool,
    pub assigns: S,
    pub latest_render: Option<Node>,
    pub outbound: Option<OutboundTx>,
    pub send_budget: Duration,
    pub self_tx: SelfTx,
    pub self_handlers: Arc<SelfHandlers<S>>,
    pub upload_ceiling: u64,
    pub staging_root: PathBuf,
}

pub struct Socket<S> {
    id: SocketId,
    session: SessionId,
    connected: bool,
    state: tokio::sync::Mutex<SocketState<S>>,
    uploads: Mutex<UploadState>,
    pending: Mutex<Vec<Event>>,
    outbound: Option<OutboundTx>,
    send_budget: Duration,
    self_tx: SelfTx,
    self_handlers: Arc<SelfHandlers<S>>,
    closer: ShutdownTrigger,
    closed: Shutdown,
}

impl<S> fmt::Debug for Socket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("connected", &self.connected)
            .field("closed", &self.closed.is_triggered())
            .finish()
    }
}

impl<S: LiveState> Socket<S> {
    pub(crate) fn new(parts: SocketParts<S>) -> Self {
        let (closer, closed) = shutdown::channel();
        let staging_dir = parts.staging_root.join(format!("live-{}", parts.session));
        Socket {
            id: SocketId::from(&parts.session),
            session: parts.session,
            connected: parts.connected,
            state: tokio::sync::Mutex::new(SocketState {
                assigns: parts.assigns,
                latest_render: parts.latest_render,
            }),
            uploads: Mutex::new(UploadState {
                configs: Vec::new(),
                context: UploadContext::default(),
                ceiling: parts.upload_ceiling,
                staging_dir,
            }),
            pending: Mutex::new(Vec::new()),
            outbound: parts.outbound,
            send_budget: parts.send_budget,
            self_tx: parts.self_tx,
            self_handlers: parts.self_handlers,
            closer,
            closed,
        }
    }

    pub fn id(&self) -> &SocketId {
        &self.id
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// `false` during the HTTP render, `true` once the realtime channel
    /// is attached.
    pub fn connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn state(&self) -> &tokio::sync::Mutex<SocketState<S>> {
        &self.state
    }

    /// Read the current assigns.
    pub async fn with_assigns<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.assigns)
    }

    pub async fn has_rendered(&self) -> bool {
        self.state.lock().await.latest_render.is_some()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue an event for the client.
    ///
    /// Waits at most the send budget for queue space. A client that
    /// cannot take the event in time is closed and `SlowClient` returned.
    /// Sockets without a realtime channel drop the event.
    pub async fn send(&self, event: Event) -> Result<(), LiveError> {
        let Some(tx) = &self.outbound else {
            debug!(socket = %self.id, event = %event.kind, "no realtime channel, dropping event");
            return Ok(());
        };
        if self.is_closed() {
            return Err(LiveError::Closed);
        }

        let mut closed = self.closed.clone();
        tokio::select! {
            sent = tx.send_timeout(event, self.send_budget) => match sent {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        socket = %self.id,
                        budget_ms = self.send_budget.as_millis() as u64,
                        "outbound queue full, closing slow client"
                    );
                    self.close();
                    Err(LiveError::SlowClient)
                }
                Err(SendTimeoutError::Closed(_)) => Err(LiveError::Closed),
            },
            _ = closed.recv() => Err(LiveError::Closed),
        }
    }

    /// Ask the client to navigate to `url` once the current handler
    /// finishes.
    pub fn redirect(&self, url: impl Into<String>) {
        self.push_pending(Event::redirect(url));
    }

    /// Ask the client to replace its URL query with `params`. The client
    /// answers with a `params` event, which runs the params handlers.
    pub fn patch_url(&self, params: &Params) {
        self.push_pending(Event::params_event(params));
    }

    fn push_pending(&self, event: Event) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub(crate) fn discard_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) async fn flush_pending(&self) -> Result<(), LiveError> {
        let events = mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        for event in events {
            self.send(event).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Self events
    // ------------------------------------------------------------------

    /// Deliver a server-originated event to this socket only.
    pub fn self_event(&self, kind: impl Into<String>, payload: impl Into<Value>) -> Result<(), LiveError> {
        self.self_tx
            .send(SelfRequest {
                target: Some(self.id.clone()),
                event: Event::self_event(kind, payload),
            })
            .map_err(|_| LiveError::Closed)
    }

    /// Register a self handler scoped to this session and `component`.
    /// Dropped when the socket unmounts.
    pub fn handle_component_self<F>(&self, component: &str, event: &str, f: F)
    where
        F: Fn(&Socket<S>, &S, Value) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let name = scoped_event_name(&self.session, component, event);
        self.self_handlers.insert(name, Arc::new(f));
    }

    /// Send to a handler registered with `handle_component_self`.
    pub fn component_self(
        &self,
        component: &str,
        event: &str,
        payload: impl Into<Value>,
    ) -> Result<(), LiveError> {
        self.self_event(scoped_event_name(&self.session, component, event), payload)
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    /// Accept uploads for a field. `max_size` is clamped to the engine
    /// ceiling. Re-registering a field replaces its config.
    pub fn allow_upload(&self, mut config: UploadConfig) {
        let mut uploads = self.lock_uploads();
        config.max_size = config.max_size.min(uploads.ceiling);
        match uploads.configs.iter_mut().find(|c| c.name == config.name) {
            Some(existing) => *existing = config,
            None => uploads.configs.push(config),
        }
    }

    pub fn upload_configs(&self) -> Vec<UploadConfig> {
        self.lock_uploads().configs.clone()
    }

    /// Re-validate announced uploads if `params` carries any.
    pub(crate) fn validate_uploads(&self, params: &Params) {
        if !params.contains_key(UPLOADS_KEY) {
            return;
        }
        let mut uploads = self.lock_uploads();
        uploads.context = validate_uploads(&uploads.configs, params);
    }

    /// Snapshot of the current upload descriptors.
    pub fn uploads(&self) -> UploadContext {
        self.lock_uploads().context.clone()
    }

    /// Where this session's upload bytes are staged.
    pub fn staging_dir(&self) -> PathBuf {
        self.lock_uploads().staging_dir.clone()
    }

    /// Hand every valid upload of `name` to `f` along with the staging
    /// directory, then forget the field's descriptors. Returns the
    /// errors `f` produced.
    pub fn consume_uploads<F>(&self, name: &str, mut f: F) -> Vec<anyhow::Error>
    where
        F: FnMut(&Upload, &Path) -> anyhow::Result<()>,
    {
        let (uploads, dir) = {
            let mut state = self.lock_uploads();
            (state.context.remove(name), state.staging_dir.clone())
        };
        uploads
            .iter()
            .filter(|u| u.is_valid())
            .filter_map(|u| f(u, &dir).err())
            .collect()
    }

    pub fn clear_uploads(&self) {
        self.lock_uploads().context.clear();
    }

    fn lock_uploads(&self) -> std::sync::MutexGuard<'_, UploadState> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Mark closed. Pending and future sends fail with `Closed` and the
    /// connection loop exits.
    pub fn close(&self) {
        self.closer.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }

    pub fn closed_signal(&self) -> Shutdown {
        self.closed.clone()
    }
}
