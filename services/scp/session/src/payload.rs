//! JSON call convention layered on exchange bodies.
//!
//! Arguments travel as one JSON array, results as one JSON value, and
//! failures as `{message, ...fields}` next to `STATUS=ERROR`.

use crate::error::{Result, SessionError};
use bytes::Bytes;
use scp_wire::{Rfi, STATUS, STATUS_ERROR};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Application error relayed between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Human readable message
    pub message: String,
    /// Any further fields the raising side attached
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RemoteError {
    /// Create an error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Attach an extra field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get an extra field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<SessionError> for RemoteError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Remote(remote) => remote,
            other => Self::new(other.to_string()),
        }
    }
}

/// Encode call arguments as a JSON array.
///
/// `()` and other values serializing to `null` are the empty argument list;
/// any other value that is not an array is wrapped as a single argument.
pub fn encode_args<A: Serialize + ?Sized>(args: &A) -> Result<Bytes> {
    let value = match serde_json::to_value(args)? {
        Value::Array(items) => Value::Array(items),
        Value::Null => Value::Array(Vec::new()),
        single => Value::Array(vec![single]),
    };
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

/// Decode call arguments; an empty body is an empty argument list.
///
/// An empty list also satisfies argument types that read from `null`,
/// such as `()` and `Option<T>`.
pub fn decode_args<A: DeserializeOwned>(body: &[u8]) -> Result<A> {
    let value = if body.is_empty() {
        Value::Array(Vec::new())
    } else {
        serde_json::from_slice(body)?
    };
    match value {
        Value::Array(items) if items.is_empty() => {
            serde_json::from_value(Value::Array(Vec::new())).or_else(|err| {
                serde_json::from_value(Value::Null).map_err(|_| SessionError::from(err))
            })
        }
        Value::Array(items) => Ok(serde_json::from_value(Value::Array(items))?),
        _ => Err(SessionError::Protocol(
            "call arguments must be a JSON array".to_string(),
        )),
    }
}

/// Encode a result or error value
pub fn encode_value<R: Serialize + ?Sized>(value: &R) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode an error body; text that is not an error object becomes the message
pub fn decode_error(body: &[u8]) -> RemoteError {
    serde_json::from_slice::<RemoteError>(body)
        .unwrap_or_else(|_| RemoteError::new(String::from_utf8_lossy(body).into_owned()))
}

/// Interpret a reply body according to the mirrored RFI's `STATUS`
pub fn decode_reply(rfi: &Rfi, body: &[u8]) -> Result<Value> {
    if rfi.get(STATUS) == Some(STATUS_ERROR) {
        return Err(SessionError::Remote(decode_error(body)));
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp_wire::{Mode, Parameters, STATUS_OK};
    use serde_json::json;

    #[test]
    fn test_args_are_always_an_array() {
        assert_eq!(&encode_args(&("X",)).unwrap()[..], br#"["X"]"#);
        assert_eq!(&encode_args(&(1, "two")).unwrap()[..], br#"[1,"two"]"#);
        assert_eq!(&encode_args(&json!({"a": 1})).unwrap()[..], br#"[{"a":1}]"#);
        assert_eq!(&encode_args(&()).unwrap()[..], b"[]");
        assert_eq!(&encode_args(&Value::Null).unwrap()[..], b"[]");
        assert_eq!(&encode_args(&(Value::Null,)).unwrap()[..], b"[null]");
    }

    #[test]
    fn test_empty_argument_list() {
        let () = decode_args(b"[]").unwrap();
        let () = decode_args(b"").unwrap();
        let none: Option<String> = decode_args(b"[]").unwrap();
        assert_eq!(none, None);
        let empty: Vec<Value> = decode_args(&encode_args(&()).unwrap()).unwrap();
        assert!(empty.is_empty());

        assert!(decode_args::<(String,)>(b"[]").is_err());
        assert!(decode_args::<()>(b"[1]").is_err());
    }

    #[test]
    fn test_decode_args_into_tuple() {
        let (a, b): (i64, String) = decode_args(br#"[4,"x"]"#).unwrap();
        assert_eq!((a, b), (4, "x".to_string()));

        let empty: Vec<Value> = decode_args(b"").unwrap();
        assert!(empty.is_empty());

        assert!(decode_args::<Vec<Value>>(b"{\"a\":1}").is_err());
    }

    #[test]
    fn test_remote_error_shape() {
        let error = RemoteError::new("boom").with_field("code", 42);
        let body = encode_value(&error).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({"message": "boom", "code": 42}));
    }

    #[test]
    fn test_decode_reply_status() {
        let ok = Rfi::new(Mode::Reply, "op")
            .with_parameters(Parameters::new().with(STATUS, STATUS_OK));
        assert_eq!(decode_reply(&ok, b"[1,2]").unwrap(), json!([1, 2]));
        assert_eq!(decode_reply(&ok, b"").unwrap(), Value::Null);

        let failed = Rfi::new(Mode::Reply, "op")
            .with_parameters(Parameters::new().with(STATUS, STATUS_ERROR));
        match decode_reply(&failed, br#"{"message":"boom","code":7}"#) {
            Err(SessionError::Remote(e)) => {
                assert_eq!(e.message, "boom");
                assert_eq!(e.field("code"), Some(&json!(7)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
