//! Frame decoding and encoding.

use serde_json::Value;

use super::error::CodecError;
use super::protocol::{CLIENT_MESSAGE_TYPES, ClientMessage, ServerMessage};

/// Decode one inbound frame.
///
/// Distinguishes a well-formed object with an unrecognized `type` (reported as
/// [`CodecError::UnknownType`]) from everything else that fails the schema.
pub fn decode(bytes: &[u8]) -> Result<ClientMessage, CodecError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(CodecError::Malformed("expected a JSON object".to_string()));
    };
    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(CodecError::Malformed("`type` must be a string".to_string())),
        None => return Err(CodecError::Malformed("missing `type` field".to_string())),
    };
    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(CodecError::UnknownType(kind.clone()));
    }

    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encode one outbound frame.
pub fn encode(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(|e| CodecError::Encode(e.to_string()))
}

/// The received frame as it should be echoed back in an error envelope:
/// parsed JSON when possible, otherwise the (lossy) text.
pub fn echo(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
