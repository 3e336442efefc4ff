//! Channel configuration and validation.

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::message::{Message, SCOPE_SEPARATOR};
use crate::registry::WILDCARD_ORIGIN;
use crate::transport::RemoteContext;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use std::sync::OnceLock;
use std::time::Duration;

/// Which side of the handshake a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Waits for the peer's ping.
    #[default]
    Parent,
    /// Sends the ping on the next turn after construction.
    Child,
}

/// Serializable channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Origin of the peer: `*` or an `http(s)://host[:port]` prefix.
    pub origin: String,

    /// Namespace for method names when channels share a transport.
    #[serde(default)]
    pub scope: Option<String>,

    #[serde(default)]
    pub role: Role,

    /// Emit per-message trace lines for this channel.
    #[serde(default)]
    pub debug_output: bool,

    /// Timeout applied to calls that do not set their own (milliseconds).
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl ChannelOptions {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            scope: None,
            role: Role::default(),
            debug_output: false,
            default_timeout_ms: None,
        }
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Observer of outgoing or incoming messages: `(origin, message)`.
///
/// Errors are logged and never interrupt dispatch.
pub type MessageObserver = Rc<dyn Fn(&str, &Message) -> anyhow::Result<()>>;

/// Invoked once when the handshake completes.
pub type ReadyObserver = Box<dyn FnOnce(&Channel)>;

/// Everything needed to build a channel.
pub struct ChannelConfig {
    pub options: ChannelOptions,
    pub remote_context: Option<Rc<dyn RemoteContext>>,
    pub on_post_message: Option<MessageObserver>,
    pub on_got_message: Option<MessageObserver>,
    pub on_ready: Option<ReadyObserver>,
}

impl ChannelConfig {
    /// Configure a channel to `remote` whose origin is `origin`.
    pub fn new(remote: Rc<dyn RemoteContext>, origin: impl Into<String>) -> Self {
        Self::from_options(ChannelOptions::new(origin)).with_remote_context(remote)
    }

    /// Start from deserialized options; the remote context is still required.
    pub fn from_options(options: ChannelOptions) -> Self {
        Self {
            options,
            remote_context: None,
            on_post_message: None,
            on_got_message: None,
            on_ready: None,
        }
    }

    pub fn with_remote_context(mut self, remote: Rc<dyn RemoteContext>) -> Self {
        self.remote_context = Some(remote);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.options.scope = Some(scope.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.options.role = role;
        self
    }

    pub fn with_debug_output(mut self, enabled: bool) -> Self {
        self.options.debug_output = enabled;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.options.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn on_post_message(
        mut self,
        observer: impl Fn(&str, &Message) -> anyhow::Result<()> + 'static,
    ) -> Self {
        self.on_post_message = Some(Rc::new(observer));
        self
    }

    pub fn on_got_message(
        mut self,
        observer: impl Fn(&str, &Message) -> anyhow::Result<()> + 'static,
    ) -> Self {
        self.on_got_message = Some(Rc::new(observer));
        self
    }

    pub fn on_ready(mut self, observer: impl FnOnce(&Channel) + 'static) -> Self {
        self.on_ready = Some(Box::new(observer));
        self
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("options", &self.options)
            .field(
                "remote_context",
                &self.remote_context.as_ref().map(|r| r.id()),
            )
            .field("on_post_message", &self.on_post_message.is_some())
            .field("on_got_message", &self.on_got_message.is_some())
            .field("on_ready", &self.on_ready.is_some())
            .finish()
    }
}

fn origin_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://[-a-zA-Z0-9_.]+(?::\d+)?").expect("origin pattern is valid")
    })
}

/// Validate an origin and reduce it to `scheme://host[:port]`, lower-cased.
///
/// Any path or query after the host is ignored. `*` passes through.
pub fn normalize_origin(origin: &str) -> Result<String, ChannelError> {
    if origin == WILDCARD_ORIGIN {
        return Ok(origin.to_string());
    }
    origin_pattern()
        .find(origin)
        .map(|m| m.as_str().to_lowercase())
        .ok_or_else(|| ChannelError::InvalidConfig(format!("invalid origin '{}'", origin)))
}

/// Validate a scope. No scope is the empty scope.
pub fn validate_scope(scope: Option<&str>) -> Result<String, ChannelError> {
    match scope {
        None => Ok(String::new()),
        Some(s) if s.contains(SCOPE_SEPARATOR) => Err(ChannelError::InvalidConfig(format!(
            "scope may not contain double colons: '{}'",
            SCOPE_SEPARATOR
        ))),
        Some(s) => Ok(s.to_string()),
    }
}
