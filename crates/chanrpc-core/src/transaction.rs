//! Inbound request lifecycle.
//!
//! A [`Transaction`] is handed to a method handler for every request it
//! serves. It stays open until `complete` or `error` is called, exactly once.
//! By default the channel completes it with the handler's return value;
//! `delay_return(true)` hands that responsibility to the handler.

use crate::channel::ChannelInner;
use crate::error::ChannelError;
use crate::message::{Message, TransactionId};
use crate::value::Value;
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Handle to one open inbound request.
#[derive(Clone)]
pub struct Transaction {
    state: Rc<TransactionState>,
}

struct TransactionState {
    id: TransactionId,
    origin: String,
    callbacks: Vec<String>,
    channel: Weak<ChannelInner>,
    delay_return: Cell<bool>,
    completed: Cell<bool>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        origin: &str,
        callbacks: Vec<String>,
        channel: Weak<ChannelInner>,
    ) -> Self {
        Self {
            state: Rc::new(TransactionState {
                id,
                origin: origin.to_string(),
                callbacks,
                channel,
                delay_return: Cell::new(false),
                completed: Cell::new(false),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.state.id
    }

    /// Origin of the peer that sent the request.
    pub fn origin(&self) -> &str {
        &self.state.origin
    }

    /// Callback paths the caller declared.
    pub fn callbacks(&self) -> &[String] {
        &self.state.callbacks
    }

    fn channel(&self) -> Result<Rc<ChannelInner>, ChannelError> {
        self.state
            .channel
            .upgrade()
            .ok_or(ChannelError::StaleTransaction(self.state.id))
    }

    /// Invoke one of the caller's callbacks. May be called any number of
    /// times while the transaction is open.
    pub fn invoke(&self, callback: &str, params: impl Into<Value>) -> Result<(), ChannelError> {
        let channel = self.channel()?;
        if !channel.is_open(self.state.id) {
            return Err(ChannelError::StaleTransaction(self.state.id));
        }
        if !self.state.callbacks.iter().any(|name| name == callback) {
            return Err(ChannelError::UnknownCallback(callback.to_string()));
        }
        channel.post(
            Message::CallbackInvocation {
                id: self.state.id,
                callback: callback.to_string(),
                params: params.into().to_json(),
            },
            false,
        )
    }

    /// Send the successful result and close the transaction.
    pub fn complete(&self, result: impl Into<Value>) -> Result<(), ChannelError> {
        self.state.completed.set(true);
        let channel = self.channel()?;
        if !channel.close_transaction(self.state.id) {
            return Err(ChannelError::StaleTransaction(self.state.id));
        }
        channel.post(
            Message::Response {
                id: self.state.id,
                result: result.into().to_json(),
            },
            false,
        )
    }

    /// Send an error response and close the transaction.
    pub fn error(&self, code: &str, message: &str) -> Result<(), ChannelError> {
        self.state.completed.set(true);
        let channel = self.channel()?;
        if !channel.close_transaction(self.state.id) {
            return Err(ChannelError::StaleTransaction(self.state.id));
        }
        channel.post(
            Message::Error {
                id: self.state.id,
                error: code.to_string(),
                message: Some(message.to_string()),
            },
            false,
        )
    }

    /// Set the sticky delayed-return flag and return it. While set, the
    /// handler's return value is not sent; the handler must call
    /// [`complete`](Self::complete) or [`error`](Self::error) itself.
    pub fn delay_return(&self, delay: bool) -> bool {
        self.state.delay_return.set(delay);
        delay
    }

    pub fn is_delayed(&self) -> bool {
        self.state.delay_return.get()
    }

    /// Whether `complete` or `error` has been called.
    pub fn completed(&self) -> bool {
        self.state.completed.get()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.state.id)
            .field("origin", &self.state.origin)
            .field("callbacks", &self.state.callbacks)
            .field("delay_return", &self.state.delay_return.get())
            .field("completed", &self.state.completed.get())
            .finish()
    }
}
