//! Channel: one endpoint bound to a (remote context, origin, scope) triple.
//!
//! A channel owns its method table, the requests it has sent and not yet
//! seen answered, the requests it has received and not yet completed, and
//! the queue of messages posted before the handshake finished.
//!
//! All state lives behind `RefCell`s. No borrow is ever held while user code
//! runs (method handlers, success/error callbacks, observers), since that code
//! may call back into the same channel.

use crate::config::{
    normalize_origin, validate_scope, ChannelConfig, ChannelOptions, MessageObserver,
    ReadyObserver, Role,
};
use crate::error::{ChannelError, HandlerError, RemoteError, TIMEOUT_ERROR};
use crate::handshake;
use crate::marshal::{extract_callbacks, install_stubs};
use crate::message::{self, split_scoped, Message, TransactionId};
use crate::runtime::Runtime;
use crate::transaction::Transaction;
use crate::transport::RemoteContext;
use crate::value::{Callback, Value};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Length of the random part of a channel's debug identifier.
const DEBUG_ID_LEN: usize = 5;

/// A bound method.
pub type MethodHandler = Rc<dyn Fn(&Invocation, Value) -> Result<Value, HandlerError>>;

/// Receives the result of a successful call. `None` when the response
/// carried no result.
pub type SuccessCallback = Box<dyn FnOnce(Option<Value>)>;

/// Receives the error response of a failed or timed-out call.
pub type ErrorCallback = Box<dyn FnOnce(RemoteError)>;

/// What a method handler is being invoked for.
#[derive(Debug, Clone)]
pub enum Invocation {
    /// A request; the handler answers through the transaction.
    Request(Transaction),
    /// A notification from `origin`; there is no way to answer.
    Notification { origin: String },
}

impl Invocation {
    /// Origin of the peer that sent the message.
    pub fn origin(&self) -> &str {
        match self {
            Invocation::Request(transaction) => transaction.origin(),
            Invocation::Notification { origin } => origin,
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            Invocation::Request(transaction) => Some(transaction),
            Invocation::Notification { .. } => None,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Invocation::Notification { .. })
    }
}

/// An outbound request, built up before being handed to [`Channel::call`].
pub struct Call {
    method: String,
    params: Option<Value>,
    success: Option<SuccessCallback>,
    error: Option<ErrorCallback>,
    timeout: Option<Duration>,
}

impl Call {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            success: None,
            error: None,
            timeout: None,
        }
    }

    /// Params may contain callbacks; see [`crate::marshal`].
    pub fn params(mut self, params: impl Into<Value>) -> Self {
        self.params = Some(params.into());
        self
    }

    /// Required. Invoked once with the response's result.
    pub fn success(mut self, f: impl FnOnce(Option<Value>) + 'static) -> Self {
        self.success = Some(Box::new(f));
        self
    }

    pub fn error(mut self, f: impl FnOnce(RemoteError) + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Give up on the response after `timeout`, delivering a `timeout_error`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method)
            .field("params", &self.params)
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A request this channel sent that has not been answered.
struct OutstandingRequest {
    /// Scoped method name, for the timeout message.
    method: String,
    success: Option<SuccessCallback>,
    error: Option<ErrorCallback>,
    /// Caller's functions by callback path.
    callbacks: HashMap<String, Callback>,
}

#[derive(Default)]
struct ChannelState {
    methods: HashMap<String, MethodHandler>,
    outbound: HashMap<TransactionId, OutstandingRequest>,
    inbound: HashSet<TransactionId>,
    ready: bool,
    pending: Vec<Message>,
    destroyed: bool,
}

pub(crate) struct ChannelInner {
    runtime: Runtime,
    remote: Rc<dyn RemoteContext>,
    origin: String,
    scope: String,
    options: ChannelOptions,
    on_post_message: Option<MessageObserver>,
    on_got_message: Option<MessageObserver>,
    on_ready: RefCell<Option<ReadyObserver>>,
    state: RefCell<ChannelState>,
    debug_id: RefCell<String>,
    self_ref: Weak<ChannelInner>,
}

/// Handle to a channel.
///
/// Handles are cheap to clone. The channel is torn down by
/// [`destroy`](Self::destroy) or when the last handle is dropped.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Rc<ChannelInner>,
}

impl Channel {
    pub(crate) fn build(runtime: &Runtime, config: ChannelConfig) -> Result<Channel, ChannelError> {
        let ChannelConfig {
            options,
            remote_context,
            on_post_message,
            on_got_message,
            on_ready,
        } = config;

        let remote = remote_context.ok_or_else(|| {
            ChannelError::InvalidConfig("a remote context is required".to_string())
        })?;
        if !remote.can_post_message() {
            return Err(ChannelError::InvalidConfig(
                "the remote context cannot post messages".to_string(),
            ));
        }
        if remote.id() == runtime.local_context() {
            return Err(ChannelError::InvalidConfig(
                "a channel may not target its own context".to_string(),
            ));
        }
        let origin = normalize_origin(&options.origin)?;
        let scope = validate_scope(options.scope.as_deref())?;

        let debug_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(DEBUG_ID_LEN)
            .map(char::from)
            .collect();

        let inner = Rc::new_cyclic(|self_ref| ChannelInner {
            runtime: runtime.clone(),
            remote,
            origin,
            scope,
            options,
            on_post_message,
            on_got_message,
            on_ready: RefCell::new(on_ready),
            state: RefCell::new(ChannelState::default()),
            debug_id: RefCell::new(debug_id),
            self_ref: self_ref.clone(),
        });

        if let Err(err) = runtime.register_channel(
            inner.remote.id(),
            &inner.origin,
            &inner.scope,
            Rc::downgrade(&inner),
        ) {
            // Never registered, so dropping it must not unregister anything.
            inner.state.borrow_mut().destroyed = true;
            return Err(err);
        }

        handshake::install(&inner)?;

        info!(
            channel = %inner.debug_id(),
            origin = %inner.origin,
            scope = %inner.scope,
            role = ?inner.options.role,
            "Channel built"
        );
        Ok(Channel { inner })
    }

    /// Bind `handler` to `method`.
    ///
    /// Fails with `InvalidArgument` for an empty method name and with
    /// `DuplicateMethod` if the method is already bound.
    pub fn bind<F>(&self, method: &str, handler: F) -> Result<&Self, ChannelError>
    where
        F: Fn(&Invocation, Value) -> Result<Value, HandlerError> + 'static,
    {
        self.inner.bind_handler(method, Rc::new(handler))?;
        Ok(self)
    }

    /// Remove the binding for `method`. Returns whether one existed.
    pub fn unbind(&self, method: &str) -> bool {
        self.inner.unbind(method)
    }

    /// Send a request.
    ///
    /// The outcome arrives later through the call's success or error
    /// callback. Fails with `InvalidArgument` if the method is empty or no
    /// success callback was given, and with `RecursiveParams` if the params
    /// nest too deeply.
    pub fn call(&self, call: Call) -> Result<(), ChannelError> {
        let Call {
            method,
            params,
            success,
            error,
            timeout,
        } = call;

        if method.is_empty() {
            return Err(ChannelError::InvalidArgument(
                "missing method for call".to_string(),
            ));
        }
        let Some(success) = success else {
            return Err(ChannelError::InvalidArgument(format!(
                "missing success callback for call to '{}'",
                method
            )));
        };
        if self.inner.is_destroyed() {
            debug!(channel = %self.inner.debug_id(), method = %method, "Call on destroyed channel ignored");
            return Ok(());
        }

        let mut params = params;
        let callbacks = match params.as_mut() {
            Some(params) => extract_callbacks(params)?,
            None => Vec::new(),
        };
        let paths = callbacks.iter().map(|(path, _)| path.clone()).collect();
        let scoped = self.inner.scoped(&method);

        let id = self
            .inner
            .runtime
            .allocate_transaction(self.inner.self_ref.clone());
        self.inner.state.borrow_mut().outbound.insert(
            id,
            OutstandingRequest {
                method: scoped.clone(),
                success: Some(success),
                error,
                callbacks: callbacks.into_iter().collect(),
            },
        );

        if let Some(timeout) = timeout.or_else(|| self.inner.options.default_timeout()) {
            let channel = self.inner.self_ref.clone();
            self.inner.runtime.scheduler().schedule(
                timeout,
                Box::new(move || {
                    if let Some(channel) = channel.upgrade() {
                        channel.expire(id, timeout);
                    }
                }),
            );
        }

        let request = Message::Request {
            id,
            method: scoped,
            params: params.and_then(|p| p.to_json()),
            callbacks: paths,
        };
        if let Err(err) = self.inner.post(request, false) {
            self.inner.state.borrow_mut().outbound.remove(&id);
            self.inner.runtime.release_transaction(id);
            return Err(err);
        }
        Ok(())
    }

    /// Send a notification. Callbacks in `params` are dropped.
    pub fn notify(&self, method: &str, params: impl Into<Option<Value>>) -> Result<(), ChannelError> {
        if method.is_empty() {
            return Err(ChannelError::InvalidArgument(
                "missing method for notification".to_string(),
            ));
        }
        let params: Option<Value> = params.into();
        self.inner.post(
            Message::Notification {
                method: self.inner.scoped(method),
                params: params.and_then(|p| p.to_json()),
            },
            false,
        )
    }

    /// Tear the channel down.
    ///
    /// Its binding is removed, its outstanding requests are forgotten and
    /// every later operation is a no-op. Calling it again has no effect.
    pub fn destroy(&self) {
        if self.inner.teardown() {
            info!(channel = %self.inner.debug_id(), "Channel destroyed");
        }
    }

    /// Whether the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Identifier used in log lines. Gains a `-R` suffix once this side
    /// answered the handshake ping, or `-L` once its own ping was answered.
    pub fn debug_id(&self) -> String {
        self.inner.debug_id()
    }

    /// Normalized origin of the peer.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Scope of the channel; empty when unscoped.
    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    /// Number of sent requests still waiting for an answer.
    pub fn outstanding(&self) -> usize {
        self.inner.state.borrow().outbound.len()
    }

    /// Number of received requests not yet completed.
    pub fn open(&self) -> usize {
        self.inner.state.borrow().inbound.len()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Channel")
            .field("debug_id", &self.inner.debug_id())
            .field("origin", &self.inner.origin)
            .field("scope", &self.inner.scope)
            .field("ready", &state.ready)
            .field("destroyed", &state.destroyed)
            .field("methods", &state.methods.len())
            .field("outstanding", &state.outbound.len())
            .field("open", &state.inbound.len())
            .finish()
    }
}

impl ChannelInner {
    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn role(&self) -> Role {
        self.options.role
    }

    pub(crate) fn debug_id(&self) -> String {
        self.debug_id.borrow().clone()
    }

    pub(crate) fn append_debug_suffix(&self, suffix: &str) {
        self.debug_id.borrow_mut().push_str(suffix);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.borrow().ready
    }

    pub(crate) fn set_ready(&self) {
        self.state.borrow_mut().ready = true;
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    pub(crate) fn take_ready_observer(&self) -> Option<ReadyObserver> {
        self.on_ready.borrow_mut().take()
    }

    pub(crate) fn scoped(&self, method: &str) -> String {
        message::scoped(&self.scope, method)
    }

    pub(crate) fn bind_handler(&self, method: &str, handler: MethodHandler) -> Result<(), ChannelError> {
        if method.is_empty() {
            return Err(ChannelError::InvalidArgument(
                "method must be a non-empty string".to_string(),
            ));
        }
        let mut state = self.state.borrow_mut();
        if state.destroyed {
            debug!(channel = %self.debug_id(), method = %method, "Bind on destroyed channel ignored");
            return Ok(());
        }
        if state.methods.contains_key(method) {
            return Err(ChannelError::DuplicateMethod(method.to_string()));
        }
        state.methods.insert(method.to_string(), handler);
        Ok(())
    }

    pub(crate) fn unbind(&self, method: &str) -> bool {
        let removed = self.state.borrow_mut().methods.remove(method);
        removed.is_some()
    }

    fn handler(&self, method: &str) -> Option<MethodHandler> {
        self.state.borrow().methods.get(method).cloned()
    }

    /// Whether an inbound request is still awaiting completion.
    pub(crate) fn is_open(&self, id: TransactionId) -> bool {
        self.state.borrow().inbound.contains(&id)
    }

    /// Close an inbound request. Returns false if it was not open.
    pub(crate) fn close_transaction(&self, id: TransactionId) -> bool {
        self.state.borrow_mut().inbound.remove(&id)
    }

    /// Send `message`, or queue it until the handshake completes. `force`
    /// sends regardless of readiness.
    pub(crate) fn post(&self, message: Message, force: bool) -> Result<(), ChannelError> {
        {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                debug!(channel = %self.debug_id(), kind = message.kind(), "Post on destroyed channel ignored");
                return Ok(());
            }
            if !force && !state.ready {
                if self.options.debug_output {
                    debug!(channel = %self.debug_id(), kind = message.kind(), "queue");
                }
                state.pending.push(message);
                return Ok(());
            }
        }
        self.send(&message)
    }

    fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let payload = message.encode()?;
        if self.options.debug_output {
            debug!(channel = %self.debug_id(), "post {}", payload);
        }
        trace!(channel = %self.debug_id(), kind = message.kind(), "Posting message");
        if let Some(observer) = &self.on_post_message {
            if let Err(e) = observer(&self.origin, message) {
                warn!(channel = %self.debug_id(), error = %e, "Post-message observer failed");
            }
        }
        self.remote.post_message(&payload, &self.origin);
        Ok(())
    }

    /// Send everything queued before the handshake, most recent first.
    pub(crate) fn flush_pending(&self) -> Result<(), ChannelError> {
        loop {
            let next = self.state.borrow_mut().pending.pop();
            match next {
                Some(message) => self.send(&message)?,
                None => return Ok(()),
            }
        }
    }

    /// Handle a message routed to this channel.
    pub(crate) fn on_message(&self, origin: &str, message: Message) -> Result<(), ChannelError> {
        if self.is_destroyed() {
            debug!(channel = %self.debug_id(), kind = message.kind(), "Message for destroyed channel dropped");
            return Ok(());
        }
        if let Some(observer) = &self.on_got_message {
            if let Err(e) = observer(origin, &message) {
                warn!(channel = %self.debug_id(), error = %e, "Got-message observer failed");
            }
        }
        if self.options.debug_output {
            debug!(channel = %self.debug_id(), kind = message.kind(), origin = %origin, "got");
        }

        match message {
            Message::Request {
                id,
                method,
                params,
                callbacks,
            } => self.handle_request(origin, id, &method, params, callbacks),
            Message::CallbackInvocation {
                id,
                callback,
                params,
            } => self.handle_callback(id, &callback, params),
            Message::Response { id, result } => {
                self.resolve(id, Ok(result.map(Value::from)));
                Ok(())
            }
            Message::Error { id, error, message } => {
                self.resolve(
                    id,
                    Err(RemoteError {
                        code: error,
                        message,
                    }),
                );
                Ok(())
            }
            Message::Notification { method, params } => {
                self.handle_notification(origin, &method, params)
            }
        }
    }

    fn handle_request(
        &self,
        origin: &str,
        id: TransactionId,
        method: &str,
        params: Option<JsonValue>,
        callbacks: Vec<String>,
    ) -> Result<(), ChannelError> {
        let (_, name) = split_scoped(method);
        let Some(handler) = self.handler(name) else {
            debug!(channel = %self.debug_id(), method = %method, id, "No handler bound for request; ignoring");
            return Ok(());
        };

        let transaction = Transaction::new(id, origin, callbacks, self.self_ref.clone());
        self.state.borrow_mut().inbound.insert(id);

        let mut params = params.map(Value::from).unwrap_or_default();
        if !transaction.callbacks().is_empty() {
            install_stubs(&mut params, transaction.callbacks(), &transaction);
        }

        let invocation = Invocation::Request(transaction.clone());
        let outcome = handler(&invocation, params);

        if self.is_destroyed() {
            return Ok(());
        }
        match outcome {
            Ok(result) => {
                if !transaction.is_delayed() && !transaction.completed() {
                    transaction.complete(result)?;
                }
            }
            Err(err) => {
                let (code, message) = err.normalize();
                debug!(channel = %self.debug_id(), method = %method, id, code = %code, "Handler failed");
                transaction.error(&code, &message)?;
            }
        }
        Ok(())
    }

    fn handle_callback(
        &self,
        id: TransactionId,
        path: &str,
        params: Option<JsonValue>,
    ) -> Result<(), ChannelError> {
        let callback = self
            .state
            .borrow()
            .outbound
            .get(&id)
            .and_then(|request| request.callbacks.get(path).cloned());
        match callback {
            Some(callback) => callback.invoke(params.map(Value::from).unwrap_or_default()),
            None => {
                debug!(channel = %self.debug_id(), id, callback = %path, "Ignoring callback invocation for unknown transaction or path");
                Ok(())
            }
        }
    }

    fn handle_notification(
        &self,
        origin: &str,
        method: &str,
        params: Option<JsonValue>,
    ) -> Result<(), ChannelError> {
        let (_, name) = split_scoped(method);
        let Some(handler) = self.handler(name) else {
            debug!(channel = %self.debug_id(), method = %method, "No handler bound for notification; dropping");
            return Ok(());
        };
        let invocation = Invocation::Notification {
            origin: origin.to_string(),
        };
        handler(&invocation, params.map(Value::from).unwrap_or_default())
            .map(|_| ())
            .map_err(|err| err.into_channel_error(method))
    }

    /// Deliver the outcome of an outbound request and forget it.
    fn resolve(&self, id: TransactionId, outcome: Result<Option<Value>, RemoteError>) {
        let request = self.state.borrow_mut().outbound.remove(&id);
        let Some(request) = request else {
            debug!(channel = %self.debug_id(), id, "Ignoring answer for unknown transaction");
            return;
        };
        self.runtime.release_transaction(id);
        match outcome {
            Ok(result) => {
                if let Some(success) = request.success {
                    success(result);
                }
            }
            Err(err) => match request.error {
                Some(on_error) => on_error(err),
                None => debug!(channel = %self.debug_id(), id, error = %err, "Error response with no error callback"),
            },
        }
    }

    /// Timer callback for a call with a timeout.
    fn expire(&self, id: TransactionId, timeout: Duration) {
        let method = match self.state.borrow().outbound.get(&id) {
            Some(request) => request.method.clone(),
            None => return,
        };
        debug!(channel = %self.debug_id(), id, method = %method, "Call timed out");
        self.resolve(
            id,
            Err(RemoteError::new(
                TIMEOUT_ERROR,
                format!(
                    "timeout ({}ms) exceeded on method '{}'",
                    timeout.as_millis(),
                    method
                ),
            )),
        );
    }

    /// Release everything the channel holds. Returns false if it was already
    /// torn down.
    fn teardown(&self) -> bool {
        let (ids, methods, outbound, pending) = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return false;
            }
            state.destroyed = true;
            state.ready = false;
            state.inbound.clear();
            let outbound = std::mem::take(&mut state.outbound);
            let ids: Vec<TransactionId> = outbound.keys().copied().collect();
            (
                ids,
                std::mem::take(&mut state.methods),
                outbound,
                std::mem::take(&mut state.pending),
            )
        };
        self.runtime
            .unregister_channel(self.remote.id(), &self.origin, &self.scope, &ids);
        let observer = self.take_ready_observer();
        // Handlers and callbacks may own channel handles; drop them with no
        // borrow held.
        drop((methods, outbound, pending, observer));
        true
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if self.teardown() {
            debug!(channel = %self.debug_id(), "Channel dropped without destroy");
        }
    }
}
