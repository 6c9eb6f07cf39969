//! Event type tags.
//!
//! Client events use whatever tag the application registered a handler
//! for; the tags below are reserved for the protocol itself.

/// Server → client: a handler or render failed.
pub const ERROR: &str = "err";

/// Server → client: ordered list of patches.
pub const PATCH: &str = "patch";

/// Server → client: acknowledges a client event by its `i`.
pub const ACK: &str = "ack";

/// Both ways: opens the realtime session.
pub const CONNECT: &str = "connect";

/// Both ways: query-string state. The server sends it to change the
/// browser URL, the client sends it when the URL changed.
pub const PARAMS: &str = "params";

/// Server → client: navigate away.
pub const REDIRECT: &str = "redirect";

/// Classification of an event tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Error,
    Patch,
    Ack,
    Connect,
    Params,
    Redirect,
    /// Application defined.
    Custom,
}

impl EventKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            ERROR => EventKind::Error,
            PATCH => EventKind::Patch,
            ACK => EventKind::Ack,
            CONNECT => EventKind::Connect,
            PARAMS => EventKind::Params,
            REDIRECT => EventKind::Redirect,
            _ => EventKind::Custom,
        }
    }

    pub fn is_reserved(self) -> bool {
        self != EventKind::Custom
    }
}
