//! Error types for channel operations and handler failures.

use crate::message::TransactionId;
use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// Error code used when a handler failure carries no code of its own.
pub const RUNTIME_ERROR: &str = "runtime_error";

/// Error code delivered to a caller whose request outlived its timeout.
pub const TIMEOUT_ERROR: &str = "timeout_error";

/// Errors raised synchronously by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel configuration was rejected at build time.
    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// Another live channel already covers this context, origin and scope.
    #[error(
        "A channel is already bound to the same context which overlaps with origin '{origin}' and has scope '{scope}'"
    )]
    DuplicateBinding { origin: String, scope: String },

    /// A call, notify or bind was invoked with bad arguments.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The method already has a handler on this channel.
    #[error("Method '{0}' is already bound")]
    DuplicateMethod(String),

    /// The request did not declare this callback.
    #[error("Request supports no such callback '{0}'")]
    UnknownCallback(String),

    /// The transaction was already completed, errored or never opened.
    #[error("Transaction {0} is not open")]
    StaleTransaction(TransactionId),

    /// The params tree nests deeper than can be serialized.
    #[error("Params cannot be a recursive data structure (nesting exceeds {0} levels)")]
    RecursiveParams(usize),

    /// The peer violated the protocol.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A notification handler failed. Notifications have no error path back
    /// to the peer, so the failure surfaces to whoever drives dispatch.
    #[error("Handler for '{method}' failed: {code}: {message}")]
    Handler {
        method: String,
        code: String,
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An error response delivered to a caller's error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: String,
    pub message: Option<String>,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code == TIMEOUT_ERROR
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) if !message.is_empty() => write!(f, "{}: {}", self.code, message),
            _ => f.write_str(&self.code),
        }
    }
}

impl std::error::Error for RemoteError {}

/// What a method handler raised.
///
/// The raised value is normalized into an error `(code, message)` pair
/// before it is sent back to the caller:
///
/// - a string becomes `("runtime_error", string)`
/// - a two-element array becomes `(array[0], array[1])`
/// - an object with a string `error` member becomes `(error, message)`
/// - anything else becomes `("runtime_error", <json text of the value>)`
#[derive(Debug)]
pub struct HandlerError {
    raised: Value,
    source: Option<ChannelError>,
}

impl HandlerError {
    pub fn new(raised: impl Into<Value>) -> Self {
        Self {
            raised: raised.into(),
            source: None,
        }
    }

    /// Raise an explicit error code and message.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Value::Array(vec![
            Value::String(code.into()),
            Value::String(message.into()),
        ]))
    }

    pub fn raised(&self) -> &Value {
        &self.raised
    }

    /// The channel error this failure was converted from, if any.
    pub fn channel_error(&self) -> Option<&ChannelError> {
        self.source.as_ref()
    }

    pub(crate) fn into_channel_error(self, method: &str) -> ChannelError {
        if let Some(err) = self.source {
            return err;
        }
        let (code, message) = self.normalize();
        ChannelError::Handler {
            method: method.to_string(),
            code,
            message,
        }
    }

    /// Reduce the raised value to an error `(code, message)` pair.
    pub fn normalize(&self) -> (String, String) {
        let (code, message) = match &self.raised {
            Value::String(message) => (RUNTIME_ERROR.to_string(), message.clone()),
            Value::Array(items) if items.len() == 2 => {
                let code = text_of(&items[0]);
                let message = match &items[1] {
                    Value::Null => stringify(&self.raised),
                    other => text_of(other),
                };
                (code, message)
            }
            Value::Object(map) if matches!(map.get("error"), Some(Value::String(_))) => {
                let code = map.get("error").map(text_of).unwrap_or_default();
                let message = match map.get("message") {
                    None => String::new(),
                    Some(m) if is_falsy(m) => String::new(),
                    Some(Value::String(m)) => m.clone(),
                    Some(other) => stringify(other),
                };
                (code, message)
            }
            other => (RUNTIME_ERROR.to_string(), stringify(other)),
        };
        // An empty code would read as a successful response on the wire.
        if code.is_empty() {
            (RUNTIME_ERROR.to_string(), message)
        } else {
            (code, message)
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (code, message) = self.normalize();
        write!(f, "{}: {}", code, message)
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => stringify(other),
    }
}

fn stringify(value: &Value) -> String {
    match value.to_json() {
        Some(json) => json.to_string(),
        None => value.to_string(),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<(&str, &str)> for HandlerError {
    fn from((code, message): (&str, &str)) -> Self {
        Self::with_code(code, message)
    }
}

impl From<(String, String)> for HandlerError {
    fn from((code, message): (String, String)) -> Self {
        Self::with_code(code, message)
    }
}

impl From<Value> for HandlerError {
    fn from(raised: Value) -> Self {
        Self::new(raised)
    }
}

impl From<serde_json::Value> for HandlerError {
    fn from(raised: serde_json::Value) -> Self {
        Self::new(Value::from(raised))
    }
}

impl From<ChannelError> for HandlerError {
    fn from(err: ChannelError) -> Self {
        Self {
            raised: Value::String(err.to_string()),
            source: Some(err),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_is_runtime_error() {
        let err = HandlerError::from("boom");
        assert_eq!(err.normalize(), ("runtime_error".to_string(), "boom".to_string()));
    }

    #[test]
    fn test_two_element_array_is_code_and_message() {
        let err = HandlerError::from(("bad_input", "explain"));
        assert_eq!(err.normalize(), ("bad_input".to_string(), "explain".to_string()));

        let err = HandlerError::from(json!(["quota", 42]));
        assert_eq!(err.normalize(), ("quota".to_string(), "42".to_string()));
    }

    #[test]
    fn test_object_with_error_member() {
        let err = HandlerError::from(json!({"error": "denied", "message": "no access"}));
        assert_eq!(err.normalize(), ("denied".to_string(), "no access".to_string()));

        let err = HandlerError::from(json!({"error": "denied"}));
        assert_eq!(err.normalize(), ("denied".to_string(), String::new()));

        let err = HandlerError::from(json!({"error": "denied", "message": {"why": 1}}));
        assert_eq!(err.normalize(), ("denied".to_string(), r#"{"why":1}"#.to_string()));
    }

    #[test]
    fn test_other_values_are_stringified() {
        let err = HandlerError::from(json!({"code": 7}));
        assert_eq!(err.normalize(), ("runtime_error".to_string(), r#"{"code":7}"#.to_string()));

        let err = HandlerError::from(json!([1, 2, 3]));
        assert_eq!(err.normalize(), ("runtime_error".to_string(), "[1,2,3]".to_string()));
    }

    #[test]
    fn test_unencodable_value_falls_back_to_display() {
        let err = HandlerError::new(Value::callback(|_| {}));
        assert_eq!(err.normalize(), ("runtime_error".to_string(), "[callback]".to_string()));
    }

    #[test]
    fn test_empty_code_becomes_runtime_error() {
        let err = HandlerError::from(("", "why"));
        assert_eq!(err.normalize(), ("runtime_error".to_string(), "why".to_string()));
    }

    #[test]
    fn test_channel_error_is_kept_as_source() {
        let err = HandlerError::from(ChannelError::ProtocolError("twice".into()));
        assert!(matches!(err.channel_error(), Some(ChannelError::ProtocolError(_))));
        assert!(matches!(
            err.into_channel_error("__ready"),
            ChannelError::ProtocolError(_)
        ));
    }

    #[test]
    fn test_remote_error_display() {
        assert_eq!(RemoteError::new("bad_input", "explain").to_string(), "bad_input: explain");
        let bare = RemoteError { code: "x".into(), message: None };
        assert_eq!(bare.to_string(), "x");
    }
}
