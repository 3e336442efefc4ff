//! Process-wide services shared by every channel of one context.

use crate::channel::{Channel, ChannelInner};
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::message::{split_scoped, Message, TransactionId};
use crate::registry::ChannelRegistry;
use crate::router::TransactionRouter;
use crate::scheduler::Scheduler;
use crate::transport::ContextId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// The channel registry, the transaction router and the single transport
/// listener of one execution context.
///
/// Every channel built from the same runtime shares its transaction id
/// counter, so outstanding requests never collide. The listener is attached
/// while at least one channel is live.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

/// Non-owning reference to a [`Runtime`].
#[derive(Clone, Default)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

struct RuntimeInner {
    local: ContextId,
    scheduler: Rc<dyn Scheduler>,
    registry: RefCell<ChannelRegistry<Weak<ChannelInner>>>,
    router: RefCell<TransactionRouter<Weak<ChannelInner>>>,
    listening: Cell<bool>,
}

impl Runtime {
    /// Services for the context `local`, scheduling deferred work on
    /// `scheduler`.
    pub fn new(local: ContextId, scheduler: Rc<dyn Scheduler>) -> Self {
        Self::with_router(local, scheduler, TransactionRouter::new())
    }

    /// Like [`new`](Self::new), with a fixed first transaction id.
    pub fn with_seed(local: ContextId, scheduler: Rc<dyn Scheduler>, seed: TransactionId) -> Self {
        Self::with_router(local, scheduler, TransactionRouter::with_seed(seed))
    }

    fn with_router(
        local: ContextId,
        scheduler: Rc<dyn Scheduler>,
        router: TransactionRouter<Weak<ChannelInner>>,
    ) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                local,
                scheduler,
                registry: RefCell::new(ChannelRegistry::new()),
                router: RefCell::new(router),
                listening: Cell::new(false),
            }),
        }
    }

    pub fn local_context(&self) -> ContextId {
        self.inner.local
    }

    pub fn scheduler(&self) -> Rc<dyn Scheduler> {
        self.inner.scheduler.clone()
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Build a channel. See [`ChannelConfig`] for the options.
    pub fn build(&self, config: ChannelConfig) -> Result<Channel, ChannelError> {
        Channel::build(self, config)
    }

    /// The transport listener: handle `payload` received from `sender` at
    /// `origin`.
    ///
    /// Payloads that are not protocol messages, or that no channel claims,
    /// are ignored. Errors come from notification handlers and protocol
    /// violations; there is no peer to report them to.
    pub fn deliver(&self, payload: &str, sender: ContextId, origin: &str) -> Result<(), ChannelError> {
        if !self.inner.listening.get() {
            trace!(context = %self.inner.local, "No live channel; payload ignored");
            return Ok(());
        }
        let Some(message) = Message::parse(payload) else {
            trace!(context = %self.inner.local, "Ignoring non-protocol payload");
            return Ok(());
        };

        let target = match message.method() {
            Some(method) => {
                let (scope, _) = split_scoped(method);
                self.inner.registry.borrow().route(sender, origin, scope)
            }
            None => message
                .id()
                .and_then(|id| self.inner.router.borrow().lookup(id)),
        };
        let Some(channel) = target.and_then(|weak| weak.upgrade()) else {
            debug!(
                context = %self.inner.local,
                kind = message.kind(),
                id = ?message.id(),
                method = ?message.method(),
                origin = %origin,
                "No channel for inbound message"
            );
            return Ok(());
        };
        channel.on_message(origin, message)
    }

    /// Whether the transport listener is attached.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.get()
    }

    /// Number of channels currently registered.
    pub fn live_channels(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    /// Number of outbound requests awaiting an answer across all channels.
    pub fn outstanding_transactions(&self) -> usize {
        self.inner.router.borrow().len()
    }

    pub(crate) fn register_channel(
        &self,
        context: ContextId,
        origin: &str,
        scope: &str,
        channel: Weak<ChannelInner>,
    ) -> Result<(), ChannelError> {
        self.inner
            .registry
            .borrow_mut()
            .register(context, origin, scope, channel)?;
        if !self.inner.listening.replace(true) {
            debug!(context = %self.inner.local, "Attached transport listener");
        }
        Ok(())
    }

    /// Remove a channel's binding and the outbound ids it still owns.
    pub(crate) fn unregister_channel(
        &self,
        context: ContextId,
        origin: &str,
        scope: &str,
        ids: &[TransactionId],
    ) {
        {
            let mut router = self.inner.router.borrow_mut();
            for id in ids {
                router.release(*id);
            }
        }
        let mut registry = self.inner.registry.borrow_mut();
        registry.unregister(context, origin, scope);
        if registry.is_empty() && self.inner.listening.replace(false) {
            debug!(context = %self.inner.local, "Detached transport listener");
        }
    }

    pub(crate) fn allocate_transaction(&self, channel: Weak<ChannelInner>) -> TransactionId {
        self.inner.router.borrow_mut().allocate(channel)
    }

    pub(crate) fn release_transaction(&self, id: TransactionId) {
        self.inner.router.borrow_mut().release(id);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("local", &self.inner.local)
            .field("listening", &self.inner.listening.get())
            .field("live_channels", &self.live_channels())
            .field("outstanding_transactions", &self.outstanding_transactions())
            .finish()
    }
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for WeakRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakRuntime")
    }
}
