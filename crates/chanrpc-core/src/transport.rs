//! The raw message-passing primitive a channel is layered over.
//!
//! A context can only hand an opaque string to another context, addressed
//! by an origin filter. The receiving process has a single listener
//! ([`Runtime::deliver`](crate::Runtime::deliver)) that learns the sender's
//! context and origin alongside the payload.

use crate::registry::WILDCARD_ORIGIN;
use crate::runtime::{Runtime, WeakRuntime};
use crate::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tracing::{trace, warn};
use uuid::Uuid;

/// Identity of an execution context (a page, a frame, a worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Creates a new random context ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({})", self.0)
    }
}

/// Handle to another context that payloads can be posted to.
pub trait RemoteContext {
    /// Identity of the context this handle addresses.
    fn id(&self) -> ContextId;

    /// Whether the handle can currently accept payloads.
    fn can_post_message(&self) -> bool {
        true
    }

    /// Post `payload` to the context, provided its origin matches
    /// `target_origin` (or `target_origin` is `*`).
    fn post_message(&self, payload: &str, target_origin: &str);
}

/// In-process transport between two runtimes.
///
/// Posting never delivers synchronously: the payload is handed to the
/// receiving runtime's listener on a later turn of the sender's scheduler.
pub struct LoopbackContext {
    target: ContextId,
    target_origin: String,
    receiver: WeakRuntime,
    sender: ContextId,
    sender_origin: String,
    scheduler: Rc<dyn Scheduler>,
    closed: Cell<bool>,
}

impl LoopbackContext {
    /// Stop accepting payloads, as if the target context had gone away.
    pub fn close(&self) {
        self.closed.set(true);
    }

    /// Origin of the context this handle addresses.
    pub fn origin(&self) -> &str {
        &self.target_origin
    }
}

impl fmt::Debug for LoopbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackContext")
            .field("target", &self.target)
            .field("target_origin", &self.target_origin)
            .field("sender", &self.sender)
            .field("closed", &self.closed.get())
            .finish()
    }
}

impl RemoteContext for LoopbackContext {
    fn id(&self) -> ContextId {
        self.target
    }

    fn can_post_message(&self) -> bool {
        !self.closed.get()
    }

    fn post_message(&self, payload: &str, target_origin: &str) {
        if self.closed.get() {
            trace!(target = %self.target, "Dropping payload: context closed");
            return;
        }
        if target_origin != WILDCARD_ORIGIN && target_origin != self.target_origin {
            trace!(
                expected = %target_origin,
                actual = %self.target_origin,
                "Dropping payload: target origin mismatch"
            );
            return;
        }

        let receiver = self.receiver.clone();
        let payload = payload.to_string();
        let sender = self.sender;
        let sender_origin = self.sender_origin.clone();
        self.scheduler.schedule(
            Duration::ZERO,
            Box::new(move || {
                let Some(runtime) = receiver.upgrade() else {
                    return;
                };
                if let Err(e) = runtime.deliver(&payload, sender, &sender_origin) {
                    warn!(error = %e, "Dispatch of inbound payload failed");
                }
            }),
        );
    }
}

/// Connect two runtimes living at `a_origin` and `b_origin`.
///
/// Returns `(handle to b for a's channels, handle to a for b's channels)`.
/// Origins are compared lower-cased, as channels normalize them.
pub fn connect(
    a: &Runtime,
    a_origin: &str,
    b: &Runtime,
    b_origin: &str,
) -> (Rc<LoopbackContext>, Rc<LoopbackContext>) {
    let a_origin = a_origin.to_lowercase();
    let b_origin = b_origin.to_lowercase();
    let to_b = LoopbackContext {
        target: b.local_context(),
        target_origin: b_origin.clone(),
        receiver: b.downgrade(),
        sender: a.local_context(),
        sender_origin: a_origin.clone(),
        scheduler: a.scheduler(),
        closed: Cell::new(false),
    };
    let to_a = LoopbackContext {
        target: a.local_context(),
        target_origin: a_origin,
        receiver: a.downgrade(),
        sender: b.local_context(),
        sender_origin: b_origin,
        scheduler: b.scheduler(),
        closed: Cell::new(false),
    };
    (Rc::new(to_b), Rc::new(to_a))
}
