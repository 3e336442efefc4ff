//! Parameter and result values exchanged over a channel.
//!
//! `Value` is a JSON value that may additionally hold callbacks. Callbacks
//! never cross the wire as data: the marshaller lifts them out of a request's
//! params before encoding, and the receiving side installs remote stubs at the
//! same paths.

use crate::error::ChannelError;
use crate::transaction::Transaction;
use serde_json::Number;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// A JSON value extended with invocable callbacks.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Callback(Callback),
}

/// A function-valued leaf inside a [`Value`] tree.
#[derive(Clone)]
pub enum Callback {
    /// A function owned by this side of the channel.
    Local(Rc<dyn Fn(Value)>),
    /// A stub that forwards invocations to the peer that issued a request.
    Remote(RemoteCallback),
}

/// Stub installed in a request's params for each callback the caller declared.
#[derive(Debug, Clone)]
pub struct RemoteCallback {
    path: String,
    transaction: Transaction,
}

impl Callback {
    /// Wrap a local function.
    pub fn new(f: impl Fn(Value) + 'static) -> Self {
        Callback::Local(Rc::new(f))
    }

    pub(crate) fn remote(path: impl Into<String>, transaction: Transaction) -> Self {
        Callback::Remote(RemoteCallback {
            path: path.into(),
            transaction,
        })
    }

    /// Invoke the callback.
    ///
    /// Local callbacks always succeed. Remote stubs send a callback invocation
    /// to the caller and fail if the owning transaction has been completed.
    pub fn invoke(&self, params: impl Into<Value>) -> Result<(), ChannelError> {
        match self {
            Callback::Local(f) => {
                f(params.into());
                Ok(())
            }
            Callback::Remote(stub) => stub.transaction.invoke(&stub.path, params),
        }
    }

    /// The callback path this stub answers to, if it is a remote stub.
    pub fn path(&self) -> Option<&str> {
        match self {
            Callback::Local(_) => None,
            Callback::Remote(stub) => Some(&stub.path),
        }
    }
}

impl RemoteCallback {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Local(_) => f.write_str("Callback::Local"),
            Callback::Remote(stub) => write!(
                f,
                "Callback::Remote({}, tx {})",
                stub.path,
                stub.transaction.id()
            ),
        }
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Callback::Local(a), Callback::Local(b)) => Rc::ptr_eq(a, b),
            (Callback::Remote(a), Callback::Remote(b)) => {
                a.path == b.path && a.transaction.id() == b.transaction.id()
            }
            _ => false,
        }
    }
}

impl Value {
    /// Build a callback value from a local function.
    pub fn callback(f: impl Fn(Value) + 'static) -> Self {
        Value::Callback(Callback::new(f))
    }

    /// Build an object from key/value pairs.
    pub fn object<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            Value::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    /// Look up a member of an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Look up a nested value by slash-separated path (`"a/b/0"`).
    ///
    /// The empty path refers to the value itself. Numeric segments index into
    /// arrays.
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('/').try_fold(self, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Convert to plain JSON.
    ///
    /// Callbacks are dropped the way JSON text encoding drops functions:
    /// omitted from objects, `null` inside arrays, and a callback at the top
    /// level has no encoding at all (`None`).
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| item.to_json().unwrap_or(serde_json::Value::Null))
                    .collect(),
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .filter_map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect(),
            ),
            Value::Callback(_) => return None,
        })
    }

    fn to_display_json(&self) -> serde_json::Value {
        match self {
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_display_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_display_json()))
                    .collect(),
            ),
            Value::Callback(_) => serde_json::Value::String("[callback]".to_string()),
            other => other.to_json().unwrap_or(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Callback(_) => f.write_str("[callback]"),
            other => write!(f, "{}", other.to_display_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<Callback> for Value {
    fn from(cb: Callback) -> Self {
        Value::Callback(cb)
    }
}
