//! TCP listener and top-level server wiring.
//!
//! This module:
//! - Listens on the configured address/port.
//! - Accepts new TCP connections, refusing them past `max_connections`.
//! - Spawns one `client::run_connection` task per connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client;
use crate::engine::Engine;
use crate::error::LiveError;
use crate::shutdown::Shutdown;
use crate::types::LiveState;

/// Bind the configured address and serve until `shutdown` fires.
pub async fn run<S: LiveState>(engine: Arc<Engine<S>>, shutdown: Shutdown) -> Result<(), LiveError> {
    let addr = engine.config().socket_addr_string();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    serve(listener, engine, shutdown).await
}

/// Accept loop on an already bound listener.
pub async fn serve<S: LiveState>(
    listener: TcpListener,
    engine: Arc<Engine<S>>,
    mut shutdown: Shutdown,
) -> Result<(), LiveError> {
    let open = Arc::new(AtomicUsize::new(0));
    let max_connections = engine.config().max_connections;

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.recv() => {
                info!("shutting down listener");
                return Ok(());
            }
        };

        if open.load(Ordering::Acquire) >= max_connections {
            warn!(%peer_addr, max_connections, "rejecting connection: limit reached");
            // Dropping the stream closes it.
            continue;
        }
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer_addr, error = %err, "could not set TCP_NODELAY");
        }

        let guard = ConnectionGuard::new(open.clone());
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        info!(%peer_addr, "accepted connection");
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = client::run_connection(engine, stream, shutdown).await {
                debug!(%peer_addr, error = %err, "connection ended with error");
            }
        });
    }
}

/// Counts a connection as open for as long as it lives.
struct ConnectionGuard {
    open: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard { open }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}
