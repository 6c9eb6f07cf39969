//! Key/value parameters carried by browser events and query strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Decoded event parameters.
///
/// Values arrive loosely typed from the browser (form fields are strings,
/// JSON payloads may carry numbers), so the accessors convert leniently
/// and fall back to a zero value instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Params(Map::new())
    }

    /// Parse an URL query string. A key repeated more than once becomes
    /// an array of its values.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut map = Map::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Value::String(value.into_owned());
            match map.get_mut(key.as_ref()) {
                None => {
                    map.insert(key.into_owned(), value);
                }
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            }
        }
        Params(map)
    }

    /// Encode back into a query string, repeating keys for arrays.
    pub fn to_query(&self) -> String {
        let mut out = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.0 {
            match value {
                Value::Array(values) => {
                    for v in values {
                        out.append_pair(key, &scalar_to_string(v));
                    }
                }
                other => {
                    out.append_pair(key, &scalar_to_string(other));
                }
            }
        }
        out.finish()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// String value; numbers and booleans are formatted, anything else is empty.
    pub fn string(&self, key: &str) -> String {
        self.0.get(key).map(scalar_to_string).unwrap_or_default()
    }

    /// Integer value, parsing strings. Zero when absent or unparsable.
    pub fn int(&self, key: &str) -> i64 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Float value, parsing strings. Zero when absent or unparsable.
    pub fn float32(&self, key: &str) -> f32 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) as f32,
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// HTML checkboxes submit `"on"` when ticked and nothing otherwise.
    pub fn checkbox(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::String(s)) => s == "on",
            Some(Value::Bool(b)) => *b,
            _ => false,
        }
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Params(map)
    }
}

impl From<Params> for Value {
    fn from(params: Params) -> Self {
        Value::Object(params.0)
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
