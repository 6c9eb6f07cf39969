//! Line-delimited JSON framing.
//!
//! Framing model: one `Event` per line, UTF-8 JSON, terminated by `\n`.
//! A trailing `\r` is tolerated on input. JSON never contains a raw
//! newline, so the terminator cannot appear inside a frame.

use thiserror::Error;

use crate::event::Event;

/// Errors that can arise when encoding/decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON for the expected shape.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Event data is not a key/value map.
    #[error("malformed params: expected object, got {0}")]
    MalformedParams(&'static str),

    /// Frame exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    /// A specific event type was required at this point.
    #[error("expected `{expected}` event, got `{got}`")]
    UnexpectedEvent { expected: &'static str, got: String },
}

/// Decode one frame (without its terminator).
pub fn decode(frame: &[u8]) -> Result<Event, ProtocolError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Decode one line, stripping `\n` / `\r\n` and enforcing `max` bytes.
pub fn decode_line(line: &[u8], max: usize) -> Result<Event, ProtocolError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.len() > max {
        return Err(ProtocolError::TooLarge {
            size: line.len(),
            max,
        });
    }
    decode(line)
}

/// Encode one event without terminator.
pub fn encode(event: &Event) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(event)?)
}

/// Append one event plus `\n` to `out`.
pub fn encode_line(event: &Event, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    serde_json::to_writer(&mut *out, event)?;
    out.push(b'\n');
    Ok(())
}
