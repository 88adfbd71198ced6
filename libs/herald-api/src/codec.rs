//! Wire serialization.
//!
//! Payloads are JSON with snake_case field names. A message travels as a
//! single map: the envelope header keys (`type`, `correlation_id`,
//! `created_at`) merged with the payload's own fields.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::BusError;
use crate::message::{CorrelationId, Header};

pub const TYPE_KEY: &str = "type";
pub const CORRELATION_ID_KEY: &str = "correlation_id";
pub const CREATED_AT_KEY: &str = "created_at";

const RESERVED_KEYS: [&str; 3] = [TYPE_KEY, CORRELATION_ID_KEY, CREATED_AT_KEY];

/// Serialize a value to wire bytes.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(value).map_err(|e| BusError::Serialization(e.to_string()))
}

/// Deserialize wire bytes into `T`.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BusError> {
    serde_json::from_slice(bytes).map_err(|e| BusError::Deserialization(e.to_string()))
}

/// Encode a payload together with its envelope header.
pub fn encode_envelope<T: Serialize + ?Sized>(
    wire_type: &str,
    header: &Header,
    payload: &T,
) -> Result<Vec<u8>, BusError> {
    let mut map = match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => Map::new(),
        Ok(other) => {
            return Err(BusError::Serialization(format!(
                "'{wire_type}' payload must serialize as a map, got {}",
                value_kind(&other)
            )));
        }
        Err(e) => return Err(BusError::Serialization(e.to_string())),
    };

    if let Some(key) = RESERVED_KEYS.iter().find(|key| map.contains_key(**key)) {
        return Err(BusError::Serialization(format!(
            "'{wire_type}' payload uses reserved field '{key}'"
        )));
    }

    map.insert(TYPE_KEY.into(), Value::String(wire_type.to_string()));
    map.insert(
        CORRELATION_ID_KEY.into(),
        Value::String(header.correlation_id().to_string()),
    );
    map.insert(
        CREATED_AT_KEY.into(),
        serde_json::to_value(header.created_at())
            .map_err(|e| BusError::Serialization(e.to_string()))?,
    );

    serialize(&Value::Object(map))
}

/// Parse wire bytes produced by [`encode_envelope`].
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, BusError> {
    Envelope::decode(bytes)
}

// ════════════════════════════════════════════════════════════════
//  Envelope
// ════════════════════════════════════════════════════════════════

/// A decoded message whose payload is not yet bound to a type.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    wire_type: String,
    header: Header,
    body: Map<String, Value>,
}

impl Envelope {
    /// Split wire bytes into header and untyped payload fields.
    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        let mut body = match deserialize::<Value>(bytes)? {
            Value::Object(map) => map,
            other => {
                return Err(BusError::Deserialization(format!(
                    "envelope must be a map, got {}",
                    value_kind(&other)
                )));
            }
        };

        let wire_type = match body.remove(TYPE_KEY) {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(BusError::Deserialization(format!(
                    "envelope '{TYPE_KEY}' must be a string, got {}",
                    value_kind(&other)
                )));
            }
            None => return Err(missing(TYPE_KEY)),
        };
        let correlation_id: CorrelationId = body
            .remove(CORRELATION_ID_KEY)
            .ok_or_else(|| missing(CORRELATION_ID_KEY))
            .and_then(from_value)?;
        let created_at: DateTime<Utc> = body
            .remove(CREATED_AT_KEY)
            .ok_or_else(|| missing(CREATED_AT_KEY))
            .and_then(from_value)?;

        Ok(Self {
            wire_type,
            header: Header::from_parts(correlation_id, created_at),
            body,
        })
    }

    pub fn wire_type(&self) -> &str {
        &self.wire_type
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Bind the payload fields to `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        from_value(Value::Object(self.body.clone()))
            .map_err(|e| e.with_context(format!("'{}' payload", self.wire_type)))
    }

    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T, BusError> {
        let wire_type = self.wire_type;
        from_value(Value::Object(self.body))
            .map_err(|e| e.with_context(format!("'{wire_type}' payload")))
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, BusError> {
    serde_json::from_value(value).map_err(|e| BusError::Deserialization(e.to_string()))
}

fn missing(key: &str) -> BusError {
    BusError::Deserialization(format!("envelope is missing '{key}'"))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
