//! The event envelope shared by both directions of the realtime channel.

use live_core::{Params, Patch};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::json_codec::ProtocolError;
use crate::wire_types::{self, EventKind};

/// One message on the realtime channel.
///
/// - `t`: event type tag
/// - `i`: correlation id, echoed back in the matching `ack`
/// - `d`: event data; for client events a key/value params map
/// - `s`: self-event payload, opaque to the protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "t")]
    pub kind: String,

    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub self_data: Option<Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Event {
            kind: kind.into(),
            id: None,
            data: None,
            self_data: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_self_data(mut self, data: impl Into<Value>) -> Self {
        self.self_data = Some(data.into());
        self
    }

    pub fn event_kind(&self) -> EventKind {
        EventKind::from_tag(&self.kind)
    }

    /// Decode `d` as params. Absent or `null` data is an empty map.
    pub fn params(&self) -> Result<Params, ProtocolError> {
        match &self.data {
            None | Some(Value::Null) => Ok(Params::new()),
            Some(Value::Object(map)) => Ok(Params::from(map.clone())),
            Some(other) => Err(ProtocolError::MalformedParams(json_type(other))),
        }
    }

    /// Decode `d` of a `patch` event.
    pub fn patches(&self) -> Result<Vec<Patch>, ProtocolError> {
        let data = self.data.clone().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(data)?)
    }

    /// `patch` event carrying `patches` in order.
    pub fn patch(patches: &[Patch]) -> Result<Self, ProtocolError> {
        Ok(Event::new(wire_types::PATCH).with_data(serde_json::to_value(patches)?))
    }

    /// `ack` for a client event, echoing its id.
    pub fn ack(id: Option<i64>) -> Self {
        Event {
            id,
            ..Event::new(wire_types::ACK)
        }
    }

    pub fn error(error: &ErrorEvent) -> Result<Self, ProtocolError> {
        Ok(Event::new(wire_types::ERROR).with_data(serde_json::to_value(error)?))
    }

    pub fn connect() -> Self {
        Event::new(wire_types::CONNECT)
    }

    pub fn redirect(url: impl Into<String>) -> Self {
        Event::new(wire_types::REDIRECT).with_data(Value::String(url.into()))
    }

    /// `params` event asking the client to update its URL.
    pub fn params_event(params: &Params) -> Self {
        Event::new(wire_types::PARAMS).with_data(params.clone())
    }

    /// Server-originated event of type `kind` carrying `payload`.
    pub fn self_event(kind: impl Into<String>, payload: impl Into<Value>) -> Self {
        Event::new(kind).with_self_data(payload)
    }
}

/// Data of an `err` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub source: Event,
    pub err: String,
}

impl ErrorEvent {
    pub fn new(source: Event, err: impl ToString) -> Self {
        ErrorEvent {
            source,
            err: err.to_string(),
        }
    }
}

/// Data of the first client frame, `{"t":"connect","d":{...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub session: String,
    #[serde(default)]
    pub params: Params,
}

impl ConnectRequest {
    pub fn from_event(event: &Event) -> Result<Self, ProtocolError> {
        if event.event_kind() != EventKind::Connect {
            return Err(ProtocolError::UnexpectedEvent {
                expected: wire_types::CONNECT,
                got: event.kind.clone(),
            });
        }
        let data = event.data.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(data)?)
    }

    pub fn into_event(self) -> Result<Event, ProtocolError> {
        Ok(Event::connect().with_data(serde_json::to_value(self)?))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
