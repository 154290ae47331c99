//! Shared plumbing `CableClient` and every `Subscription` send through: the
//! FIFO writer and the currently-published transport half.
//!
//! Splitting this out of `client.rs` keeps the actor (which owns the
//! receiver and the subscription list) and the send path (used from
//! arbitrary caller tasks) from needing a reference to each other.

use std::sync::Arc;
use std::time::Duration;

use cable_protocol::OutgoingFrame;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::transport::{WsFrame, WsSender};

use super::error::CableError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    WaitingForWelcome,
    Connected,
    Reconnecting,
    Disconnecting,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig { initial: Duration::from_secs(1), max: Duration::from_secs(30) }
    }
}

/// The sender half, published only once the handshake completes (`welcome`
/// received) and taken back on teardown. A write attempted while this is
/// empty fails with `NotConnected`, matching the invariant that outbound
/// frames are only transmitted in `Connected`.
pub(super) struct SharedSender {
    slot: AsyncMutex<Option<Box<dyn WsSender>>>,
}

impl SharedSender {
    pub(super) fn empty() -> Self {
        SharedSender { slot: AsyncMutex::new(None) }
    }

    pub(super) async fn publish(&self, sender: Box<dyn WsSender>) {
        *self.slot.lock().await = Some(sender);
    }

    pub(super) async fn take(&self) -> Option<Box<dyn WsSender>> {
        self.slot.lock().await.take()
    }

    async fn write(&self, frame: WsFrame) -> Result<(), CableError> {
        let mut guard = self.slot.lock().await;
        match guard.as_mut() {
            Some(sender) => sender.send(frame).await.map_err(CableError::from),
            None => Err(CableError::NotConnected),
        }
    }
}

/// What `CableClient::subscribe` and every `Subscription` hold to send,
/// independent of the actor task that owns the receive loop and the
/// subscription registry.
pub(crate) struct ClientHandle {
    pub(super) runner: sequential_runner::SequentialRunner,
    pub(super) sender: Arc<SharedSender>,
    pub(super) state: watch::Receiver<ClientState>,
    pub(super) backoff: BackoffConfig,
}

impl ClientHandle {
    pub(crate) fn current_state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Send a single frame through the sequential runner, preserving order
    /// with every other caller writing to the same transport.
    pub(crate) async fn send_frame(
        &self,
        cancel: CancellationToken,
        frame: OutgoingFrame,
    ) -> Result<(), CableError> {
        let sender = self.sender.clone();
        self.runner
            .enqueue(cancel, move || async move { sender.write(WsFrame::Text(frame.encode())).await })
            .await?
    }

    pub(crate) async fn send_message(
        &self,
        cancel: CancellationToken,
        identifier: &str,
        data: Value,
    ) -> Result<(), CableError> {
        if self.current_state() != ClientState::Connected {
            return Err(CableError::NotConnected);
        }
        let frame = OutgoingFrame::message(identifier.to_owned(), &data)?;
        self.send_frame(cancel, frame).await
    }

    /// Like `send_message`, but retries on `NotConnected` with the
    /// reconnection backoff until it succeeds or `cancel` fires.
    pub(crate) async fn guarantee_perform(
        &self,
        cancel: CancellationToken,
        identifier: String,
        data: Value,
    ) -> Result<(), CableError> {
        let mut backoff = self.backoff.initial;
        loop {
            match self.send_message(cancel.clone(), &identifier, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(CableError::NotConnected) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CableError::Canceled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.backoff.max);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
