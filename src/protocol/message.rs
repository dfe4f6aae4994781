//! Request and response envelope codec.
//!
//! Wire format shared with Nameko peers:
//!
//! ```text
//! request:  {"args": [...], "kwargs": {...}}
//! response: {"result": <any>}                       success
//!           {"result": null, "error": {"exc_type": ..., "exc_path": ...,
//!                                      "exc_args": ..., "value": ...}}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{Result, RpcError};

/// Arguments of a remote call.
///
/// Built with the consuming `with_*` methods and never changed after it has
/// been handed to [`RpcClient::call`](crate::RpcClient::call).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    // ---
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl RequestEnvelope {
    // ---

    /// An envelope with no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument, replacing any previous value under `name`.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument `name`, if present.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a request body. Anything other than a JSON object with
    /// optional `args` array and `kwargs` object is rejected.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| RpcError::Protocol(format!("malformed request: {e}")))
    }
}

/// Structured exception raised by a remote handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    // ---
    /// Exception class name, e.g. `"ValueError"`.
    #[serde(default)]
    pub exc_type: String,

    /// Fully qualified exception path, e.g. `"builtins.ValueError"`.
    #[serde(default)]
    pub exc_path: String,

    /// Exception arguments. Nameko peers send a list, this crate sends a string.
    #[serde(default)]
    pub exc_args: Value,

    /// Human readable message.
    #[serde(default)]
    pub value: String,
}

impl RemoteError {
    // ---

    pub fn new(exc_type: impl Into<String>, value: impl Into<String>) -> Self {
        // ---
        let exc_type = exc_type.into();
        let value = value.into();
        Self {
            exc_path: exc_type.clone(),
            exc_args: Value::String(value.clone()),
            exc_type,
            value,
        }
    }

    pub fn with_path(mut self, exc_path: impl Into<String>) -> Self {
        self.exc_path = exc_path.into();
        self
    }

    pub fn with_args(mut self, exc_args: impl Into<Value>) -> Self {
        self.exc_args = exc_args.into();
        self
    }

    /// Error reported for a routing key naming no registered handler.
    pub fn method_not_found(method: &str) -> Self {
        Self::new("MethodNotFound", method).with_path("nameko.exceptions.MethodNotFound")
    }

    /// Error reported for a request body that is not a valid envelope.
    pub fn malformed_request(detail: impl Into<String>) -> Self {
        Self::new("MalformedRequest", detail).with_path("nameko.exceptions.MalformedRequest")
    }

    /// An error object with every field unset.
    ///
    /// Some peers always emit `"error": {}` on success; that is not an error.
    /// Any populated field, even only a path or args, makes it a real error.
    pub fn is_empty(&self) -> bool {
        self.exc_type.is_empty()
            && self.exc_path.is_empty()
            && self.exc_args.is_null()
            && self.value.is_empty()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.value)
    }
}

impl std::error::Error for RemoteError {}

/// Outcome of a remote call as carried on the wire.
///
/// Exactly one of result or error exists; envelopes carrying both or neither
/// are rejected by [`ResponseEnvelope::from_slice`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEnvelope {
    Result(Value),
    Error(RemoteError),
}

#[derive(Serialize)]
struct WireResponseOut<'a> {
    result: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RemoteError>,
}

#[derive(Deserialize)]
struct WireResponseIn {
    // `"result": null` must stay distinguishable from a missing key.
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ResponseEnvelope {
    // ---

    pub fn to_bytes(&self) -> Result<Bytes> {
        // ---
        let wire = match self {
            ResponseEnvelope::Result(value) => WireResponseOut {
                result: value,
                error: None,
            },
            ResponseEnvelope::Error(err) => WireResponseOut {
                result: &Value::Null,
                error: Some(err),
            },
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    /// Decode a response body, enforcing the one-of rule.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        // ---
        let wire: WireResponseIn = serde_json::from_slice(body)
            .map_err(|e| RpcError::Protocol(format!("malformed response: {e}")))?;

        let error = wire.error.filter(|err| !err.is_empty());

        match (wire.result, error) {
            (Some(result), Some(_)) if !result.is_null() => Err(RpcError::Protocol(
                "response carries both result and error".into(),
            )),
            (_, Some(err)) => Ok(ResponseEnvelope::Error(err)),
            (Some(result), None) => Ok(ResponseEnvelope::Result(result)),
            (None, None) => Err(RpcError::Protocol(
                "response carries neither result nor error".into(),
            )),
        }
    }

    /// Convert into the caller-facing outcome.
    pub fn into_result(self) -> Result<Value> {
        match self {
            ResponseEnvelope::Result(value) => Ok(value),
            ResponseEnvelope::Error(err) => Err(RpcError::Remote(err)),
        }
    }
}

impl From<std::result::Result<Value, RemoteError>> for ResponseEnvelope {
    fn from(outcome: std::result::Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(value) => ResponseEnvelope::Result(value),
            Err(err) => ResponseEnvelope::Error(err),
        }
    }
}
