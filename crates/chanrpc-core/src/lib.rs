//! chanrpc-core: RPC and notifications between isolated execution contexts.
//!
//! Two contexts that can only exchange opaque strings (a page and an
//! embedded frame, say) each build a [`Channel`] towards the other. Channels
//! support:
//!
//! - requests with a single response, correlated by a transaction id unique
//!   across every channel of the process
//! - fire-and-forget notifications
//! - callbacks passed inside request params, invoked by the peer any number
//!   of times while the request is open
//! - scoping, so several channels can share one transport
//! - a ping/pong handshake; messages sent before it completes are queued
//!
//! All state is single-threaded. A [`Runtime`] owns the per-process routing
//! tables and the single transport listener; channels are built from it.

pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod marshal;
pub mod message;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod transaction;
pub mod transport;
pub mod value;

pub use channel::{Call, Channel, ErrorCallback, Invocation, MethodHandler, SuccessCallback};
pub use config::{
    normalize_origin, ChannelConfig, ChannelOptions, MessageObserver, ReadyObserver, Role,
};
pub use error::{ChannelError, HandlerError, RemoteError, RUNTIME_ERROR, TIMEOUT_ERROR};
pub use message::{Message, TransactionId};
pub use runtime::{Runtime, WeakRuntime};
pub use scheduler::{EventLoop, Scheduler, TokioScheduler};
pub use transaction::Transaction;
pub use transport::{connect, ContextId, LoopbackContext, RemoteContext};
pub use value::{Callback, Value};
