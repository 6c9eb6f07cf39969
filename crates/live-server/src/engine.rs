//! Event engine.
//!
//! Owns the handler table, the registry of attached sockets and the
//! self-event loop. Locking:
//! - the registry mutex is held only for map operations, never across a
//!   handler or a render;
//! - self-event dispatch is serialized by its own lock, so client
//!   events for other sockets still run alongside it;
//! - each socket's state mutex serializes mutate → render → enqueue for
//!   that socket.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use futures::FutureExt;

use live_core::{parse, to_html, Node, Params, Patch};
use live_protocol::{wire_types, Event};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::LiveError;
use crate::handler::Handler;
use crate::limiter::RateLimiter;
use crate::pubsub::Subscriber;
use crate::render::{render_document, render_socket, Rendered};
use crate::shutdown::Shutdown;
use crate::socket::{Socket, SocketParts, SocketState};
use crate::state_store::{MemoryStateStore, StateStore, StoreError, StoredState};
use crate::types::{
    BroadcastHook, LiveState, OutboundTx, SelfRequest, SelfRx, SelfTx, SessionId, SocketId,
};

pub struct Engine<S: LiveState> {
    handler: Handler<S>,
    config: EngineConfig,
    sockets: Mutex<HashMap<SocketId, Arc<Socket<S>>>>,
    self_lock: Mutex<()>,
    broadcast_hook: RwLock<Option<BroadcastHook>>,
    store: Arc<dyn StateStore>,
    self_tx: SelfTx,
    limiter: RateLimiter,
    shutdown: Shutdown,
}

impl<S: LiveState> Engine<S> {
    /// Engine with an in-memory state store. Must be called inside a
    /// tokio runtime.
    pub fn new(handler: Handler<S>, config: EngineConfig, shutdown: Shutdown) -> Arc<Self> {
        let store = Arc::new(MemoryStateStore::spawn(
            config.janitor_interval(),
            shutdown.clone(),
        ));
        Self::with_state_store(handler, config, store, shutdown)
    }

    pub fn with_state_store(
        handler: Handler<S>,
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let (self_tx, self_rx) = mpsc::unbounded_channel();
        let limiter = RateLimiter::new(config.broadcast_interval(), config.broadcast_burst);
        let engine = Arc::new(Engine {
            handler,
            config,
            sockets: Mutex::new(HashMap::new()),
            self_lock: Mutex::new(()),
            broadcast_hook: RwLock::new(None),
            store,
            self_tx,
            limiter,
            shutdown: shutdown.clone(),
        });
        tokio::spawn(run_self_loop(Arc::downgrade(&engine), self_rx, shutdown));
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handler(&self) -> &Handler<S> {
        &self.handler
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Pass an error to the application's error callback.
    pub fn report(&self, err: &LiveError) {
        self.handler.report(err);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// First page load over HTTP: mount (not connected), apply params,
    /// render the full document and park the state for the realtime
    /// attach. Returns the document markup.
    pub async fn mount_http(&self, session: &SessionId, params: &Params) -> Result<String, LiveError> {
        if !self.handler.has_renderer() {
            return Err(LiveError::NoRenderer);
        }
        let socket = self.new_socket(session, None, S::default(), None);
        let mut state = socket.state().lock().await;

        let result = self.mount_and_render_http(&socket, &mut state, params);
        let html = match result {
            Ok(html) => html,
            Err(err) => {
                self.report(&err);
                return Err(err);
            }
        };
        self.save_state(socket.id(), html.clone(), &state.assigns).await;
        debug!(session = %session, "mounted over http");
        Ok(html)
    }

    fn mount_and_render_http(
        &self,
        socket: &Socket<S>,
        state: &mut SocketState<S>,
        params: &Params,
    ) -> Result<String, LiveError> {
        state.assigns = self.handler.mount(socket, &state.assigns)?;
        self.fold_params(socket, state, params)?;
        let tree = render_document(&self.handler, socket, &state.assigns)?;
        let html = to_html(&tree).map_err(live_core::DiffError::from)?;
        state.latest_render = Some(tree);
        Ok(html)
    }

    /// Realtime channel opened for `session`: rehydrate parked state,
    /// register the socket, mount (connected), apply params and render.
    ///
    /// With a parked render the client already shows it, so only patches
    /// go out. Without one the full document goes out as a single root
    /// patch. On failure, a panicking handler included, the socket is
    /// deregistered and closed.
    pub async fn attach(
        &self,
        session: &SessionId,
        params: &Params,
        outbound: OutboundTx,
    ) -> Result<Arc<Socket<S>>, LiveError> {
        if !self.handler.has_renderer() {
            return Err(LiveError::NoRenderer);
        }
        let (assigns, latest_render) = self.rehydrate(&SocketId::from(session)).await;
        let socket = Arc::new(self.new_socket(session, Some(outbound), assigns, latest_render));

        let previous = self
            .sockets
            .lock()
            .await
            .insert(socket.id().clone(), socket.clone());
        if let Some(previous) = previous {
            info!(socket = %socket.id(), "replacing existing socket for session");
            previous.close();
        }

        let started = AssertUnwindSafe(self.start(&socket, params))
            .catch_unwind()
            .await
            .unwrap_or(Err(LiveError::HandlerPanic));
        if let Err(err) = started {
            if self.deregister(&socket).await {
                self.drop_scoped_handlers(&socket);
            }
            socket.close();
            self.report(&err);
            return Err(err);
        }
        info!(socket = %socket.id(), "socket attached");
        Ok(socket)
    }

    async fn start(&self, socket: &Socket<S>, params: &Params) -> Result<(), LiveError> {
        let mut state = socket.state().lock().await;
        state.assigns = self.handler.mount(socket, &state.assigns)?;
        self.fold_params(socket, &mut state, params)?;
        self.rerender(socket, state).await
    }

    /// Tear down: deregister, run the unmount handler, drop scoped self
    /// handlers, park a final snapshot, clear uploads and close.
    ///
    /// A socket already replaced by a newer one for the same session
    /// only runs its unmount handler; the session's scoped handlers and
    /// parked state belong to the replacement.
    pub async fn unmount(&self, socket: &Arc<Socket<S>>) {
        let current = self.deregister(socket).await;

        let state = socket.state().lock().await;
        if let Err(err) = self.handler.unmount(socket, &state.assigns) {
            self.report(&err);
        }
        if !current {
            drop(state);
            socket.clear_uploads();
            socket.close();
            debug!(socket = %socket.id(), "stale socket unmounted");
            return;
        }
        let dropped = self.drop_scoped_handlers(socket);
        if let Some(tree) = &state.latest_render {
            match to_html(tree) {
                Ok(html) => self.save_state(socket.id(), html, &state.assigns).await,
                Err(err) => warn!(socket = %socket.id(), error = %err, "could not snapshot render"),
            }
        }
        drop(state);

        socket.clear_uploads();
        socket.close();
        info!(socket = %socket.id(), scoped_handlers = dropped, "socket unmounted");
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run the client event handler registered for `event.kind`, then
    /// re-render.
    pub async fn handle_event(&self, socket: &Socket<S>, event: &Event) -> Result<(), LiveError> {
        let handler = self
            .handler
            .event(&event.kind)
            .ok_or_else(|| LiveError::NoEventHandler(event.kind.clone()))?;
        let params = event
            .params()
            .map_err(|e| LiveError::MalformedParams(e.to_string()))?;
        socket.validate_uploads(&params);

        let mut state = socket.state().lock().await;
        match handler(socket, &state.assigns, params) {
            Ok(next) => state.assigns = next,
            Err(source) => {
                socket.discard_pending();
                return Err(LiveError::Handler {
                    event: event.kind.clone(),
                    source,
                });
            }
        }
        self.rerender(socket, state).await
    }

    /// Run the self handler registered for `event.kind`, then re-render.
    /// Serialized against every other self event of this engine.
    pub async fn handle_self(&self, socket: &Socket<S>, event: &Event) -> Result<(), LiveError> {
        let _serial = self.self_lock.lock().await;
        let handler = self
            .handler
            .self_handler(&event.kind)
            .ok_or_else(|| LiveError::NoEventHandler(event.kind.clone()))?;
        let payload = event.self_data.clone().unwrap_or(Value::Null);

        let mut state = socket.state().lock().await;
        match handler(socket, &state.assigns, payload) {
            Ok(next) => state.assigns = next,
            Err(source) => {
                socket.discard_pending();
                return Err(LiveError::Handler {
                    event: event.kind.clone(),
                    source,
                });
            }
        }
        self.rerender(socket, state).await
    }

    /// Fold every params handler over the assigns, then re-render.
    pub async fn handle_params(&self, socket: &Socket<S>, event: &Event) -> Result<(), LiveError> {
        let params = event
            .params()
            .map_err(|e| LiveError::MalformedParams(e.to_string()))?;
        let mut state = socket.state().lock().await;
        if let Err(err) = self.fold_params(socket, &mut state, &params) {
            socket.discard_pending();
            return Err(err);
        }
        self.rerender(socket, state).await
    }

    /// Apply params handlers in registration order, committing each
    /// result before the next handler runs. A failure stops the fold;
    /// results of the handlers before it stay.
    fn fold_params(
        &self,
        socket: &Socket<S>,
        state: &mut SocketState<S>,
        params: &Params,
    ) -> Result<(), LiveError> {
        for handler in self.handler.params_handlers() {
            state.assigns = handler(socket, &state.assigns, params.clone()).map_err(|source| {
                LiveError::Handler {
                    event: wire_types::PARAMS.to_string(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    async fn rerender(
        &self,
        socket: &Socket<S>,
        mut state: MutexGuard<'_, SocketState<S>>,
    ) -> Result<(), LiveError> {
        let rendered = render_socket(&self.handler, socket, &mut state).await?;
        drop(state);
        if let Rendered::Full(html) = rendered {
            socket.send(Event::patch(&[Patch::root(html)])?).await?;
        }
        socket.flush_pending().await
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// Send a self event to every socket. When subscribed to a pub/sub
    /// topic the event goes through the transport instead, reaching every
    /// engine on that topic (this one included).
    ///
    /// Waits for a broadcast token first; fails with `Cancelled` once
    /// the engine shuts down.
    pub async fn broadcast(&self, event: Event) -> Result<(), LiveError> {
        let mut shutdown = self.shutdown.clone();
        self.limiter.acquire(&mut shutdown).await?;
        let hook = self
            .broadcast_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match hook {
            Some(hook) => hook(event).await,
            None => self.emit(None, event),
        }
    }

    /// Queue a self event for one socket, or all of them when `target`
    /// is `None`. Dispatch happens on the self-event loop.
    pub fn emit(&self, target: Option<SocketId>, event: Event) -> Result<(), LiveError> {
        self.self_tx
            .send(SelfRequest { target, event })
            .map_err(|_| LiveError::Closed)
    }

    async fn dispatch_self(&self, request: SelfRequest) {
        let targets: Vec<Arc<Socket<S>>> = match &request.target {
            Some(id) => self.get_socket(id).await.into_iter().collect(),
            None => self.sockets.lock().await.values().cloned().collect(),
        };
        if targets.is_empty() {
            debug!(event = %request.event.kind, "self event with no target socket");
        }
        for socket in targets {
            let handled = AssertUnwindSafe(self.handle_self(&socket, &request.event))
                .catch_unwind()
                .await;
            match handled {
                Ok(Ok(())) => {}
                Ok(Err(LiveError::NoEventHandler(name))) => {
                    warn!(socket = %socket.id(), event = %name, "no self handler registered");
                }
                Ok(Err(err)) => self.report(&err),
                Err(_) => {
                    error!(socket = %socket.id(), event = %request.event.kind, "self handler panicked");
                    socket.close();
                    self.report(&LiveError::HandlerPanic);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    pub async fn get_socket(&self, id: &SocketId) -> Option<Arc<Socket<S>>> {
        self.sockets.lock().await.get(id).cloned()
    }

    /// Linear scan; there is no secondary index by session.
    pub async fn get_socket_by_session(&self, session: &SessionId) -> Option<Arc<Socket<S>>> {
        self.sockets
            .lock()
            .await
            .values()
            .find(|socket| socket.session() == session)
            .cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.sockets.lock().await.len()
    }

    /// Remove `socket` unless a newer socket for the same session has
    /// already replaced it. Returns whether `socket` was the registered one.
    async fn deregister(&self, socket: &Arc<Socket<S>>) -> bool {
        let mut sockets = self.sockets.lock().await;
        let current = sockets
            .get(socket.id())
            .is_some_and(|registered| Arc::ptr_eq(registered, socket));
        if current {
            sockets.remove(socket.id());
        }
        current
    }

    /// Drop the component-scoped self handlers of `socket`'s session.
    fn drop_scoped_handlers(&self, socket: &Socket<S>) -> usize {
        self.handler
            .self_handlers()
            .remove_prefix(&format!("{}--", socket.session()))
    }

    fn new_socket(
        &self,
        session: &SessionId,
        outbound: Option<OutboundTx>,
        assigns: S,
        latest_render: Option<Node>,
    ) -> Socket<S> {
        Socket::new(SocketParts {
            session: session.clone(),
            connected: outbound.is_some(),
            assigns,
            latest_render,
            outbound,
            send_budget: self.config.send_budget(),
            self_tx: self.self_tx.clone(),
            self_handlers: self.handler.self_handlers().clone(),
            upload_ceiling: self.config.max_upload_size,
            staging_root: self.config.upload_staging_dir.clone(),
        })
    }

    // ------------------------------------------------------------------
    // State store
    // ------------------------------------------------------------------

    async fn rehydrate(&self, id: &SocketId) -> (S, Option<Node>) {
        let stored = match self.store.get(id.clone()).await {
            Ok(stored) => stored,
            Err(StoreError::NoState) => return (S::default(), None),
            Err(err) => {
                warn!(socket = %id, error = %err, "state store unavailable, starting fresh");
                return (S::default(), None);
            }
        };
        let assigns = serde_json::from_value(stored.assigns).unwrap_or_else(|err| {
            warn!(socket = %id, error = %err, "parked assigns unreadable, starting fresh");
            S::default()
        });
        let tree = match parse(&stored.render) {
            Ok(tree) => Some(tree),
            Err(err) => {
                warn!(socket = %id, error = %err, "parked render unreadable");
                None
            }
        };
        debug!(socket = %id, "rehydrated from state store");
        (assigns, tree)
    }

    async fn save_state(&self, id: &SocketId, render: String, assigns: &S) {
        let assigns = match serde_json::to_value(assigns) {
            Ok(value) => value,
            Err(err) => {
                self.report(&LiveError::Serialize(err));
                return;
            }
        };
        let state = StoredState { render, assigns };
        if let Err(err) = self.store.set(id.clone(), state, self.config.state_ttl()).await {
            warn!(socket = %id, error = %err, "could not park socket state");
        }
    }
}

impl<S: LiveState> Subscriber for Engine<S> {
    fn receive(&self, event: Event) {
        if let Err(err) = self.emit(None, event) {
            warn!(error = %err, "engine dropped a pub/sub event");
        }
    }

    fn redirect_broadcasts(&self, hook: BroadcastHook) {
        *self
            .broadcast_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }
}

async fn run_self_loop<S: LiveState>(engine: Weak<Engine<S>>, mut rx: SelfRx, mut shutdown: Shutdown) {
    loop {
        let request = tokio::select! {
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shutdown.recv() => break,
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.dispatch_self(request).await;
    }
    debug!("self-event loop stopped");
}
