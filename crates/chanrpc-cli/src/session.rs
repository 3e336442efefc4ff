//! A page and a frame in one process, joined by the loopback transport.

use crate::config::CliConfig;
use anyhow::{anyhow, Context, Result};
use chanrpc_core::{
    connect, Call, Channel, ChannelConfig, ContextId, RemoteError, Runtime, Scheduler,
    TokioScheduler, Value,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;

/// How long to wait for the handshake.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Both ends of a ready channel pair.
///
/// Must be used inside a `tokio::task::LocalSet`.
pub struct Session {
    pub page: Runtime,
    pub frame: Runtime,
    /// The page's channel to the frame.
    pub parent: Channel,
    /// The frame's channel to the page.
    pub child: Channel,
}

impl Session {
    /// Build both channels and wait for the handshake to finish.
    pub async fn open(config: &CliConfig) -> Result<Self> {
        let scheduler: Rc<dyn Scheduler> = Rc::new(TokioScheduler);
        let page = Runtime::new(ContextId::new(), scheduler.clone());
        let frame = Runtime::new(ContextId::new(), scheduler);
        let (to_frame, to_page) = connect(&page, &config.page_origin, &frame, &config.frame_origin);

        let parent = page
            .build(ChannelConfig::from_options(config.parent.clone()).with_remote_context(to_frame))
            .context("Failed to build the page's channel")?;

        // The child is the last side to become ready.
        let (ready_tx, ready_rx) = oneshot::channel();
        let child = frame
            .build(
                ChannelConfig::from_options(config.child.clone())
                    .with_remote_context(to_page)
                    .on_ready(move |channel| {
                        let _ = ready_tx.send(channel.debug_id());
                    }),
            )
            .context("Failed to build the frame's channel")?;

        let child_id = tokio::time::timeout(READY_TIMEOUT, ready_rx)
            .await
            .map_err(|_| anyhow!("Handshake did not complete within {:?}", READY_TIMEOUT))?
            .context("Frame channel went away before the handshake")?;
        info!(parent = %parent.debug_id(), child = %child_id, "Session ready");

        Ok(Self {
            page,
            frame,
            parent,
            child,
        })
    }

    /// Call `method` on the frame from the page and wait for the outcome.
    pub async fn call(
        &self,
        method: &str,
        params: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> Result<Result<Option<Value>, RemoteError>> {
        self.call_with(Call::new(method).params(params), timeout).await
    }

    /// Send a prepared call, filling in its outcome callbacks.
    pub async fn call_with(
        &self,
        call: Call,
        timeout: Option<Duration>,
    ) -> Result<Result<Option<Value>, RemoteError>> {
        let (tx, rx) = oneshot::channel();
        let on_success = Rc::new(RefCell::new(Some(tx)));
        let on_error = on_success.clone();

        let mut call = call
            .success(move |result| {
                if let Some(tx) = on_success.borrow_mut().take() {
                    let _ = tx.send(Ok(result));
                }
            })
            .error(move |err| {
                if let Some(tx) = on_error.borrow_mut().take() {
                    let _ = tx.send(Err(err));
                }
            });
        if let Some(timeout) = timeout {
            call = call.timeout(timeout);
        }
        self.parent.call(call)?;
        rx.await
            .context("Channel was destroyed before the call was answered")
    }

    pub fn close(self) {
        self.parent.destroy();
        self.child.destroy();
    }
}
