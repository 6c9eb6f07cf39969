//! live-server
//!
//! Concurrent half of the live view engine:
//! - `Socket`: one browser session's assigns, last render and outbound queue
//! - the render pipeline (render → parse → diff → enqueue)
//! - `Engine`: handler tables and the socket registry
//! - `PubSub`: rate-limited broadcast across engines and processes
//! - `MemoryStateStore`: TTL state used to rehydrate reconnecting sockets
//! - the per-connection line-JSON loop and a TCP accept loop

pub mod config;
pub mod types;
pub mod error;
pub mod shutdown;
pub mod limiter;
pub mod handler;
pub mod socket;
pub mod render;
pub mod engine;
pub mod pubsub;
pub mod state_store;
pub mod client;
pub mod server;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::LiveError;
pub use handler::{Handler, RenderContext};
pub use limiter::RateLimiter;
pub use pubsub::{LocalTransport, PubSub, Subscriber, Transport, TransportMessage};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use socket::Socket;
pub use state_store::{MemoryStateStore, StateStore, StoreError, StoredState};
pub use types::{LiveState, SessionId, SocketId};
