//! Render pipeline: assigns → markup → tree → patches → outbound queue.

use live_core::{anchor_tree, diff, parse, to_html, DiffError, Node};
use live_protocol::Event;
use tracing::debug;

use crate::error::LiveError;
use crate::handler::{Handler, RenderContext};
use crate::socket::{Socket, SocketState};
use crate::types::LiveState;

/// Outcome of one render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// First render for this socket; the whole document, not yet sent.
    Full(String),
    /// A patch event with this many patches was queued.
    Patched(usize),
    /// Nothing changed.
    Unchanged,
}

/// Run the render function and turn its markup into an anchored tree.
pub(crate) fn render_document<S: LiveState>(
    handler: &Handler<S>,
    socket: &Socket<S>,
    assigns: &S,
) -> Result<Node, LiveError> {
    let uploads = socket.uploads();
    let ctx = RenderContext {
        socket,
        assigns,
        uploads: &uploads,
    };
    let markup = handler.render(&ctx)?;
    let mut tree = parse(&markup)?;
    anchor_tree(&mut tree);
    Ok(tree)
}

/// Render `state` and reconcile it with what the client shows.
///
/// Without a stored tree the new tree is stored and returned in full,
/// no diff is made. Otherwise the patches (if any) are queued as one
/// `patch` event and the stored tree is replaced either way. A failed
/// render or parse leaves the stored tree alone.
pub(crate) async fn render_socket<S: LiveState>(
    handler: &Handler<S>,
    socket: &Socket<S>,
    state: &mut SocketState<S>,
) -> Result<Rendered, LiveError> {
    let tree = render_document(handler, socket, &state.assigns)?;

    let Some(current) = state.latest_render.as_ref() else {
        let html = to_html(&tree).map_err(DiffError::from)?;
        state.latest_render = Some(tree);
        debug!(socket = %socket.id(), "first render");
        return Ok(Rendered::Full(html));
    };

    let patches = diff(current, &tree)?;
    state.latest_render = Some(tree);
    if patches.is_empty() {
        return Ok(Rendered::Unchanged);
    }

    debug!(socket = %socket.id(), patches = patches.len(), "queueing patches");
    let count = patches.len();
    socket.send(Event::patch(&patches)?).await?;
    Ok(Rendered::Patched(count))
}
