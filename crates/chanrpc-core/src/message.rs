//! Wire messages.
//!
//! Every message is a JSON object whose variant is determined by which
//! fields are present:
//!
//! | variant            | fields                                   |
//! |--------------------|------------------------------------------|
//! | Request            | `id`, `method`, `params?`, `callbacks?`  |
//! | CallbackInvocation | `id`, `callback`, `params?`              |
//! | Error              | `id`, `error`, `message?`                |
//! | Response           | `id`, `result?`                          |
//! | Notification       | `method`, `params?`                      |
//!
//! Methods may be scoped as `"<scope>::<name>"`.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

/// Identifier correlating a request with its callbacks and response.
pub type TransactionId = u64;

/// Separator between a scope and a method name.
pub const SCOPE_SEPARATOR: &str = "::";

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: TransactionId,
        method: String,
        params: Option<JsonValue>,
        callbacks: Vec<String>,
    },
    CallbackInvocation {
        id: TransactionId,
        callback: String,
        params: Option<JsonValue>,
    },
    Error {
        id: TransactionId,
        error: String,
        message: Option<String>,
    },
    Response {
        id: TransactionId,
        result: Option<JsonValue>,
    },
    Notification {
        method: String,
        params: Option<JsonValue>,
    },
}

/// Flat encoding of every variant; absent fields are skipped.
#[derive(Debug, Default, Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<TransactionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callbacks: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl Message {
    /// Decode a payload.
    ///
    /// Returns `None` for anything that is not a protocol message: malformed
    /// JSON, a non-object top-level value, or an object carrying neither a
    /// string `method` nor an integer `id`. Unrelated traffic may share the
    /// transport, so none of these are errors.
    pub fn parse(payload: &str) -> Option<Message> {
        match serde_json::from_str::<JsonValue>(payload).ok()? {
            JsonValue::Object(map) => Self::from_object(map),
            _ => None,
        }
    }

    fn from_object(mut map: Map<String, JsonValue>) -> Option<Message> {
        let id = map.get("id").and_then(JsonValue::as_u64);
        let params = map.remove("params");

        if let Some(JsonValue::String(method)) = map.remove("method") {
            return Some(match id {
                Some(id) => Message::Request {
                    id,
                    method,
                    params,
                    callbacks: callback_names(map.remove("callbacks")),
                },
                None => Message::Notification { method, params },
            });
        }

        let id = id?;
        if let Some(JsonValue::String(callback)) = map.remove("callback") {
            return Some(Message::CallbackInvocation {
                id,
                callback,
                params,
            });
        }

        match map.remove("error") {
            Some(JsonValue::String(error)) if !error.is_empty() => Some(Message::Error {
                id,
                error,
                message: map.remove("message").and_then(message_text),
            }),
            _ => Some(Message::Response {
                id,
                result: map.remove("result"),
            }),
        }
    }

    /// Encode to JSON text, emitting only the fields present.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let envelope = match self {
            Message::Request {
                id,
                method,
                params,
                callbacks,
            } => Envelope {
                id: Some(*id),
                method: Some(method),
                params: params.as_ref(),
                callbacks: (!callbacks.is_empty()).then_some(callbacks.as_slice()),
                ..Default::default()
            },
            Message::CallbackInvocation {
                id,
                callback,
                params,
            } => Envelope {
                id: Some(*id),
                callback: Some(callback),
                params: params.as_ref(),
                ..Default::default()
            },
            Message::Error { id, error, message } => Envelope {
                id: Some(*id),
                error: Some(error),
                message: message.as_deref(),
                ..Default::default()
            },
            Message::Response { id, result } => Envelope {
                id: Some(*id),
                result: result.as_ref(),
                ..Default::default()
            },
            Message::Notification { method, params } => Envelope {
                method: Some(method),
                params: params.as_ref(),
                ..Default::default()
            },
        };
        serde_json::to_string(&envelope)
    }

    /// Transaction id, for every variant except notifications.
    pub fn id(&self) -> Option<TransactionId> {
        match self {
            Message::Request { id, .. }
            | Message::CallbackInvocation { id, .. }
            | Message::Error { id, .. }
            | Message::Response { id, .. } => Some(*id),
            Message::Notification { .. } => None,
        }
    }

    /// The (possibly scoped) method of a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::CallbackInvocation { .. } => "callback",
            Message::Error { .. } => "error",
            Message::Response { .. } => "response",
            Message::Notification { .. } => "notification",
        }
    }
}

fn callback_names(value: Option<JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::String(name) => Some(name),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn message_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Split a wire method into `(scope, name)`.
///
/// Only a method with exactly one `::` separator is scoped; anything else is
/// an unscoped name with the empty scope.
pub fn split_scoped(method: &str) -> (&str, &str) {
    let mut parts = method.split(SCOPE_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scope), Some(name), None) => (scope, name),
        _ => ("", method),
    }
}

/// Prefix a method with its scope. The empty scope leaves it unchanged.
pub fn scoped(scope: &str, method: &str) -> String {
    if scope.is_empty() {
        method.to_string()
    } else {
        format!("{}{}{}", scope, SCOPE_SEPARATOR, method)
    }
}
