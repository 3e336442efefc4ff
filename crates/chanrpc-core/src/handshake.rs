//! Ready handshake.
//!
//! Every channel binds `__ready` when it is built. A child channel pings the
//! peer on the next turn; the peer answers with a pong. Each side becomes
//! ready when it receives either message, flushes whatever it queued in the
//! meantime and notifies its ready observer.

use crate::channel::{Channel, ChannelInner, Invocation};
use crate::config::Role;
use crate::error::{ChannelError, HandlerError};
use crate::message::Message;
use crate::value::Value;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Method carrying the handshake.
pub const READY_METHOD: &str = "__ready";

const PING: &str = "ping";
const PONG: &str = "pong";

/// Bind `__ready` and, for a child, schedule the ping.
pub(crate) fn install(channel: &Rc<ChannelInner>) -> Result<(), ChannelError> {
    let weak = Rc::downgrade(channel);
    channel.bind_handler(
        READY_METHOD,
        Rc::new(move |_: &Invocation, params: Value| -> Result<Value, HandlerError> {
            if let Some(channel) = weak.upgrade() {
                complete(&channel, params.as_str() == Some(PING))?;
            }
            Ok(Value::Null)
        }),
    )?;

    if channel.role() == Role::Child {
        let weak = Rc::downgrade(channel);
        channel.runtime().scheduler().schedule(
            Duration::ZERO,
            Box::new(move || {
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                // The ping bypasses the queue: nothing is sent until it is answered.
                if let Err(e) = channel.post(ready_message(&channel, PING), true) {
                    warn!(channel = %channel.debug_id(), error = %e, "Failed to send ready ping");
                }
            }),
        );
    }
    Ok(())
}

fn ready_message(channel: &ChannelInner, params: &str) -> Message {
    Message::Notification {
        method: channel.scoped(READY_METHOD),
        params: Some(serde_json::Value::String(params.to_string())),
    }
}

/// Transition to ready. `pinged` is true when the peer initiated.
pub(crate) fn complete(channel: &Rc<ChannelInner>, pinged: bool) -> Result<(), ChannelError> {
    if channel.is_ready() {
        return Err(ChannelError::ProtocolError(
            "received ready message while in ready state".to_string(),
        ));
    }

    channel.append_debug_suffix(if pinged { "-R" } else { "-L" });
    channel.unbind(READY_METHOD);
    channel.set_ready();
    debug!(channel = %channel.debug_id(), pinged, "ready msg received");

    if pinged {
        channel.post(ready_message(channel, PONG), false)?;
    }
    channel.flush_pending()?;

    if let Some(observer) = channel.take_ready_observer() {
        observer(&Channel {
            inner: channel.clone(),
        });
    }
    info!(channel = %channel.debug_id(), "Channel ready");
    Ok(())
}
