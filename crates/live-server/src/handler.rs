//! Application callbacks, registered once at construction.
//!
//! A `Handler<S>` is the explicit table of everything an application
//! plugs into the engine: mount/unmount, the render function, an error
//! callback, event handlers by type, self-event handlers by type and
//! params handlers in registration order. Handlers receive the current
//! assigns by reference and return the next assigns; on error the
//! assigns are left untouched.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use live_core::{Params, UploadContext};
use serde_json::Value;
use tracing::error;

use crate::error::LiveError;
use crate::socket::Socket;
use crate::types::{LiveState, SessionId};

pub type MountFn<S> = Arc<dyn Fn(&Socket<S>, &S) -> anyhow::Result<S> + Send + Sync>;
pub type UnmountFn<S> = Arc<dyn Fn(&Socket<S>, &S) -> anyhow::Result<()> + Send + Sync>;
pub type RenderFn<S> = Arc<dyn Fn(&RenderContext<'_, S>) -> anyhow::Result<String> + Send + Sync>;
pub type EventFn<S> = Arc<dyn Fn(&Socket<S>, &S, Params) -> anyhow::Result<S> + Send + Sync>;
pub type SelfFn<S> = Arc<dyn Fn(&Socket<S>, &S, Value) -> anyhow::Result<S> + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&LiveError) + Send + Sync>;

/// What the render function sees.
pub struct RenderContext<'a, S> {
    pub socket: &'a Socket<S>,
    pub assigns: &'a S,
    pub uploads: &'a UploadContext,
}

/// Self-event handlers. Shared with every socket so components can
/// register scoped handlers at runtime.
pub struct SelfHandlers<S> {
    handlers: RwLock<HashMap<String, SelfFn<S>>>,
}

impl<S> SelfHandlers<S> {
    fn new() -> Self {
        SelfHandlers {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, name: impl Into<String>, handler: SelfFn<S>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<SelfFn<S>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Drop every handler whose name starts with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|name, _| !name.starts_with(prefix));
        before - handlers.len()
    }
}

/// Self-event type of a component-scoped handler.
pub fn scoped_event_name(session: &SessionId, component: &str, event: &str) -> String {
    format!("{session}--{component}--{event}")
}

pub struct Handler<S> {
    mount: MountFn<S>,
    unmount: Option<UnmountFn<S>>,
    render: Option<RenderFn<S>>,
    error: ErrorFn,
    events: HashMap<String, EventFn<S>>,
    self_handlers: Arc<SelfHandlers<S>>,
    params: Vec<EventFn<S>>,
}

fn keep_assigns<S: Clone>(_socket: &Socket<S>, assigns: &S) -> anyhow::Result<S> {
    Ok(assigns.clone())
}

fn log_error(err: &LiveError) {
    error!(error = %err, "live handler error");
}

impl<S: LiveState> Default for Handler<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LiveState> Handler<S> {
    /// Empty handler: mount keeps the current assigns, errors are logged,
    /// no renderer.
    pub fn new() -> Self {
        Handler {
            mount: Arc::new(keep_assigns::<S>),
            unmount: None,
            render: None,
            error: Arc::new(log_error),
            events: HashMap::new(),
            self_handlers: Arc::new(SelfHandlers::new()),
            params: Vec::new(),
        }
    }

    /// Called on the HTTP render (not connected) and again when the
    /// realtime channel attaches (connected).
    pub fn with_mount<F>(mut self, f: F) -> Self
    where
        F: Fn(&Socket<S>, &S) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        self.mount = Arc::new(f);
        self
    }

    pub fn with_unmount<F>(mut self, f: F) -> Self
    where
        F: Fn(&Socket<S>, &S) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.unmount = Some(Arc::new(f));
        self
    }

    pub fn with_render<F>(mut self, f: F) -> Self
    where
        F: Fn(&RenderContext<'_, S>) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.render = Some(Arc::new(f));
        self
    }

    /// Receives every handler, mount and render failure. Defaults to
    /// logging it.
    pub fn with_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&LiveError) + Send + Sync + 'static,
    {
        self.error = Arc::new(f);
        self
    }

    /// Handle client events of type `name`.
    pub fn handle_event<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Socket<S>, &S, Params) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        self.events.insert(name.into(), Arc::new(f));
        self
    }

    /// Handle server-originated events of type `name`.
    pub fn handle_self<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Socket<S>, &S, Value) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        self.self_handlers.insert(name, Arc::new(f));
        self
    }

    /// Handle query-string changes. Runs after mount and on every
    /// `params` event, in registration order.
    pub fn handle_params<F>(mut self, f: F) -> Self
    where
        F: Fn(&Socket<S>, &S, Params) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        self.params.push(Arc::new(f));
        self
    }

    pub fn has_renderer(&self) -> bool {
        self.render.is_some()
    }

    pub fn report(&self, err: &LiveError) {
        (self.error)(err)
    }

    pub(crate) fn mount(&self, socket: &Socket<S>, assigns: &S) -> Result<S, LiveError> {
        (self.mount)(socket, assigns).map_err(LiveError::Mount)
    }

    pub(crate) fn unmount(&self, socket: &Socket<S>, assigns: &S) -> Result<(), LiveError> {
        match &self.unmount {
            Some(f) => f(socket, assigns).map_err(LiveError::Unmount),
            None => Ok(()),
        }
    }

    pub(crate) fn render(&self, ctx: &RenderContext<'_, S>) -> Result<String, LiveError> {
        let render = self.render.as_ref().ok_or(LiveError::NoRenderer)?;
        render(ctx).map_err(LiveError::Render)
    }

    pub(crate) fn event(&self, name: &str) -> Option<EventFn<S>> {
        self.events.get(name).cloned()
    }

    pub(crate) fn self_handler(&self, name: &str) -> Option<SelfFn<S>> {
        self.self_handlers.get(name)
    }

    pub(crate) fn self_handlers(&self) -> &Arc<SelfHandlers<S>> {
        &self.self_handlers
    }

    pub(crate) fn params_handlers(&self) -> &[EventFn<S>] {
        &self.params
    }
}
