//! Error taxonomy of the live server.
//!
//! `LiveError::is_connection_fatal` decides whether the per-connection
//! loop keeps going (the error is reported to the client as an `err`
//! event) or tears the connection down.

use live_core::{DiffError, ParseError};
use live_protocol::ProtocolError;
use thiserror::Error;

use crate::state_store::StoreError;

#[derive(Debug, Error)]
pub enum LiveError {
    /// No render function was registered on the handler.
    #[error("no renderer registered")]
    NoRenderer,

    /// No handler for this event type. Logged and ignored upstream.
    #[error("no handler registered for event `{0}`")]
    NoEventHandler(String),

    /// Event data could not be decoded as a key/value map.
    #[error("{0}")]
    MalformedParams(String),

    /// An event, self-event or params handler returned an error.
    #[error("handler for `{event}` failed: {source}")]
    Handler {
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("mount failed: {0}")]
    Mount(#[source] anyhow::Error),

    #[error("unmount failed: {0}")]
    Unmount(#[source] anyhow::Error),

    /// The application's render function failed.
    #[error("render failed: {0}")]
    Render(#[source] anyhow::Error),

    #[error("rendered markup did not parse: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write timed out")]
    WriteTimeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The outbound queue stayed full for the whole send budget.
    #[error("client too slow, outbound queue full")]
    SlowClient,

    #[error("connection closed")]
    Closed,

    #[error("no socket `{0}`")]
    NoSocket(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pubsub: {0}")]
    PubSub(String),

    #[error("assigns could not be serialized: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("handler panicked")]
    HandlerPanic,
}

impl LiveError {
    /// Transport failures end the connection; everything else is
    /// reported and the connection continues.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            LiveError::Io(_)
                | LiveError::WriteTimeout
                | LiveError::SlowClient
                | LiveError::Closed
                | LiveError::Cancelled
                | LiveError::HandlerPanic
                | LiveError::Protocol(ProtocolError::TooLarge { .. })
        )
    }
}
