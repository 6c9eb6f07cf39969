//! live-protocol
//!
//! Wire-level encoding/decoding for live views.
//!
//! Every message in either direction is one `Event` envelope
//! (`{"t": type, "i": id, "d": data, "s": self data}`) encoded as a
//! single line of JSON.
//!
//! - [`wire_types`] : event type tags
//! - [`event`]      : the envelope and its constructors
//! - [`json_codec`] : line framing and (de)serialization

pub mod wire_types;
pub mod event;
pub mod json_codec;

pub use event::{ConnectRequest, ErrorEvent, Event};
pub use json_codec::{decode, decode_line, encode, encode_line, ProtocolError};
pub use wire_types::EventKind;
