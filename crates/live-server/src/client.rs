//! Per-connection loop over a line-delimited JSON realtime channel.
//!
//! The first inbound frame must be a `connect` event naming the session.
//! After that two halves run side by side:
//! - the reader task decodes frames, dispatches them to the engine and
//!   acknowledges each with an `ack` echoing its `i`;
//! - the writer drains the socket's outbound queue onto the stream,
//!   each write bounded by the configured timeout.
//!
//! Whatever ends the connection, the socket is unmounted.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use live_protocol::wire_types::EventKind;
use live_protocol::{decode_line, encode_line, ConnectRequest, ErrorEvent, Event, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::LiveError;
use crate::shutdown::Shutdown;
use crate::socket::Socket;
use crate::types::{LiveState, OutboundRx, SessionId};

const READ_CHUNK: usize = 4096;

/// Splits a byte stream into newline-terminated frames.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame: usize) -> Self {
        FrameReader {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame,
        }
    }

    /// Next non-blank frame, terminator included. `None` on clean EOF.
    /// A frame growing past the limit is rejected before it completes.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, LiveError> {
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.buf) {
                let frame = self.buf.split_to(pos + 1).freeze();
                if frame.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(frame));
            }

            // Room for the limit plus "\r\n".
            if self.buf.len() > self.max_frame + 2 {
                return Err(ProtocolError::TooLarge {
                    size: self.buf.len(),
                    max: self.max_frame,
                }
                .into());
            }

            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                // Last frame without a terminator.
                return Ok(Some(self.buf.split().freeze()));
            }
        }
    }
}

/// Write one event as a line, bounded by `limit`.
pub async fn write_event<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event: &Event,
    limit: Duration,
) -> Result<(), LiveError> {
    let mut frame = Vec::with_capacity(256);
    encode_line(event, &mut frame)?;
    let write = async {
        writer.write_all(&frame).await?;
        writer.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result.map_err(LiveError::from),
        Err(_) => Err(LiveError::WriteTimeout),
    }
}

/// Serve one realtime connection until the client leaves, a fatal error
/// occurs, the socket is closed or `shutdown` fires.
pub async fn run_connection<S, IO>(
    engine: Arc<Engine<S>>,
    stream: IO,
    mut shutdown: Shutdown,
) -> Result<(), LiveError>
where
    S: LiveState,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_frame = engine.config().max_message_size;
    let write_timeout = engine.config().write_timeout();
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut frames = FrameReader::new(read_half, max_frame);

    let hello = tokio::select! {
        frame = frames.next_frame() => frame?,
        _ = shutdown.recv() => return Ok(()),
    };
    let Some(hello) = hello else {
        debug!("connection closed before connect");
        return Ok(());
    };
    let request = ConnectRequest::from_event(&decode_line(&hello, max_frame)?)?;
    let session = if request.session.is_empty() {
        SessionId::generate()
    } else {
        SessionId::new(request.session)
    };
    write_event(&mut write_half, &Event::connect(), write_timeout).await?;

    let (out_tx, out_rx) = mpsc::channel(engine.config().outbound_capacity.max(1));
    let socket = engine.attach(&session, &request.params, out_tx).await?;

    let result = serve(&engine, &socket, frames, write_half, out_rx, shutdown).await;
    engine.unmount(&socket).await;
    match &result {
        Ok(()) => info!(socket = %socket.id(), "connection closed"),
        Err(err) => warn!(socket = %socket.id(), error = %err, "connection closed with error"),
    }
    result
}

async fn serve<S, R, W>(
    engine: &Arc<Engine<S>>,
    socket: &Arc<Socket<S>>,
    frames: FrameReader<R>,
    mut writer: W,
    mut out_rx: OutboundRx,
    mut shutdown: Shutdown,
) -> Result<(), LiveError>
where
    S: LiveState,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let write_timeout = engine.config().write_timeout();
    let mut reader = tokio::spawn(read_loop(engine.clone(), socket.clone(), frames));
    let mut closed = socket.closed_signal();

    let result = loop {
        tokio::select! {
            event = out_rx.recv() => match event {
                Some(event) => {
                    if let Err(err) = write_event(&mut writer, &event, write_timeout).await {
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
            joined = &mut reader => {
                break match joined {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => Err(LiveError::HandlerPanic),
                    Err(_) => Err(LiveError::Cancelled),
                };
            }
            _ = closed.recv() => break Ok(()),
            _ = shutdown.recv() => break Ok(()),
        }
    };
    reader.abort();
    result
}

async fn read_loop<S, R>(
    engine: Arc<Engine<S>>,
    socket: Arc<Socket<S>>,
    mut frames: FrameReader<R>,
) -> Result<(), LiveError>
where
    S: LiveState,
    R: AsyncRead + Unpin,
{
    let max_frame = engine.config().max_message_size;
    while let Some(frame) = frames.next_frame().await? {
        let event = match decode_line(&frame, max_frame) {
            Ok(event) => event,
            Err(err @ ProtocolError::TooLarge { .. }) => return Err(err.into()),
            Err(err) => {
                warn!(socket = %socket.id(), error = %err, "dropping undecodable frame");
                continue;
            }
        };
        debug!(socket = %socket.id(), event = %event.kind, id = ?event.id, "inbound event");

        let result = match event.event_kind() {
            EventKind::Params => engine.handle_params(&socket, &event).await,
            _ => engine.handle_event(&socket, &event).await,
        };
        match result {
            Ok(()) => {}
            Err(LiveError::NoEventHandler(name)) => {
                warn!(socket = %socket.id(), event = %name, "no handler registered");
            }
            Err(err) if err.is_connection_fatal() => return Err(err),
            Err(err) => {
                engine.report(&err);
                let reply = Event::error(&ErrorEvent::new(event.clone(), &err))?;
                socket.send(reply).await?;
            }
        }
        socket.send(Event::ack(event.id)).await?;
    }
    debug!(socket = %socket.id(), "client closed the channel");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_split_on_newlines_and_skip_blank_lines() {
        let input: &[u8] = b"{\"t\":\"a\"}\n\r\n\n{\"t\":\"b\"}\r\n{\"t\":\"c\"}";
        let mut frames = FrameReader::new(input, 1024);
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), &b"{\"t\":\"a\"}\n"[..]);
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), &b"{\"t\":\"b\"}\r\n"[..]);
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), &b"{\"t\":\"c\"}"[..]);
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let input = vec![b'x'; 64];
        let mut frames = FrameReader::new(&input[..], 16);
        let err = frames.next_frame().await.unwrap_err();
        assert!(matches!(err, LiveError::Protocol(ProtocolError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn write_event_appends_newline() {
        let mut out = Vec::new();
        write_event(&mut out, &Event::ack(Some(3)), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, b"{\"t\":\"ack\",\"i\":3}\n");
    }
}
