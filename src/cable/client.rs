//! The reconnecting, multiplexed pub/sub client. Runs as a single actor
//! task that owns the receive loop and the subscription registry; writes
//! go out through `ClientHandle`'s sequential runner so callers never touch
//! the transport directly. The `tokio::select!` shape here generalizes a
//! plain shutdown-vs-socket reactor loop with a third and fourth arm for
//! reconnect backoff and the ping watchdog.

use std::sync::Arc;
use std::time::Duration;

use cable_protocol::{IncomingFrame, OutgoingFrame, SubscriptionIdentifier};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::{TransportError, WsConnector, WsFrame, WsReceiver, WsSender};

use super::error::CableError;
use super::handle::{BackoffConfig, ClientHandle, ClientState, SharedSender};
use super::subscription::{Subscription, SubscriptionState};

#[derive(Debug, Clone)]
pub struct CableClientConfig {
    pub url: String,
    pub origin: String,
    pub backoff: BackoffConfig,
    pub ping_stale_threshold: Duration,
}

impl CableClientConfig {
    pub fn new(url: impl Into<String>, origin: impl Into<String>) -> Self {
        CableClientConfig {
            url: url.into(),
            origin: origin.into(),
            backoff: BackoffConfig::default(),
            ping_stale_threshold: Duration::from_secs(6),
        }
    }
}

enum ControlCommand {
    Connect(oneshot::Sender<Result<(), CableError>>),
    Disconnect(oneshot::Sender<Result<(), CableError>>),
    Subscribe(SubscriptionIdentifier, oneshot::Sender<Arc<Subscription>>),
}

/// Handle to the background actor. Cheap to clone-by-reference (it's just
/// two channel handles); the actor task outlives every `CableClient` clone
/// until the process shuts down.
pub struct CableClient {
    commands: mpsc::UnboundedSender<ControlCommand>,
    handle: Arc<ClientHandle>,
}

impl CableClient {
    /// Spawn the actor task and return a handle to it. The client starts
    /// `Disconnected`; call `connect()` to begin dialing.
    pub fn spawn(config: CableClientConfig, connector: Arc<dyn WsConnector>) -> Self {
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle {
            runner: sequential_runner::SequentialRunner::new(),
            sender: Arc::new(SharedSender::empty()),
            state: state_rx,
            backoff: config.backoff,
        });
        let actor = Actor {
            current_backoff: config.backoff.initial,
            config,
            connector,
            commands: commands_rx,
            state: state_tx,
            handle: handle.clone(),
            subscriptions: Vec::new(),
            receiver: None,
            pending_sender: None,
            next_attempt: None,
            last_ping: None,
        };
        tokio::spawn(actor.run());
        CableClient { commands: commands_tx, handle }
    }

    pub fn state(&self) -> ClientState {
        self.handle.current_state()
    }

    /// Idempotent: a no-op if already `Connected`, an error if a connect
    /// or reconnect is already under way.
    pub async fn connect(&self) -> Result<(), CableError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(ControlCommand::Connect(tx)).map_err(|_| CableError::Stopped)?;
        rx.await.map_err(|_| CableError::Stopped)?
    }

    /// Idempotent: ensures the transport is closed and the state is
    /// `Disconnected`, with no reconnect scheduled.
    pub async fn disconnect(&self) -> Result<(), CableError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(ControlCommand::Disconnect(tx)).map_err(|_| CableError::Stopped)?;
        rx.await.map_err(|_| CableError::Stopped)?
    }

    /// Returns a `Pending` subscription immediately; the subscribe frame is
    /// sent once the client reaches `Connected`. Two calls with structurally
    /// equal identifiers return the same subscription.
    pub async fn subscribe(&self, identifier: SubscriptionIdentifier) -> Result<Arc<Subscription>, CableError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ControlCommand::Subscribe(identifier, tx))
            .map_err(|_| CableError::Stopped)?;
        rx.await.map_err(|_| CableError::Stopped)
    }

    pub async fn send_message(&self, identifier: &str, data: Value) -> Result<(), CableError> {
        self.handle.send_message(CancellationToken::new(), identifier, data).await
    }

    pub async fn guarantee_perform(&self, identifier: impl Into<String>, data: Value) -> Result<(), CableError> {
        self.handle.guarantee_perform(CancellationToken::new(), identifier.into(), data).await
    }
}

struct Actor {
    config: CableClientConfig,
    connector: Arc<dyn WsConnector>,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    state: watch::Sender<ClientState>,
    handle: Arc<ClientHandle>,
    subscriptions: Vec<Arc<Subscription>>,
    receiver: Option<Box<dyn WsReceiver>>,
    pending_sender: Option<Box<dyn WsSender>>,
    current_backoff: Duration,
    next_attempt: Option<Instant>,
    last_ping: Option<Instant>,
}

async fn recv_or_pending(receiver: &mut Option<Box<dyn WsReceiver>>) -> Result<WsFrame, TransportError> {
    match receiver {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                frame = recv_or_pending(&mut self.receiver) => {
                    match frame {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "cable transport receive failed");
                            self.begin_reconnect().await;
                        }
                    }
                }
                () = sleep_until_or_pending(self.next_attempt) => {
                    self.attempt_connect().await;
                }
                _ = watchdog.tick() => {
                    self.check_watchdog().await;
                }
            }
        }
        self.close_transport().await;
    }

    fn current_state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: ClientState) {
        let _ = self.state.send(state);
    }

    async fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Connect(reply) => {
                let result = self.do_connect().await;
                let _ = reply.send(result);
            }
            ControlCommand::Disconnect(reply) => {
                let result = self.do_disconnect().await;
                let _ = reply.send(result);
            }
            ControlCommand::Subscribe(identifier, reply) => {
                let subscription = self.do_subscribe(identifier).await;
                let _ = reply.send(subscription);
            }
        }
    }

    async fn do_connect(&mut self) -> Result<(), CableError> {
        match self.current_state() {
            ClientState::Connected => Ok(()),
            ClientState::Disconnected => {
                self.next_attempt = None;
                self.current_backoff = self.config.backoff.initial;
                self.attempt_connect().await;
                Ok(())
            }
            _ => Err(CableError::AlreadyConnecting),
        }
    }

    async fn do_disconnect(&mut self) -> Result<(), CableError> {
        self.set_state(ClientState::Disconnecting);
        self.close_transport().await;
        self.next_attempt = None;
        self.set_state(ClientState::Disconnected);
        Ok(())
    }

    async fn do_subscribe(&mut self, identifier: SubscriptionIdentifier) -> Arc<Subscription> {
        if let Some(existing) = self.subscriptions.iter().find(|s| *s.identifier() == identifier) {
            return existing.clone();
        }
        let subscription = Subscription::new(identifier.clone(), self.handle.clone());
        self.subscriptions.push(subscription.clone());
        if self.current_state() == ClientState::Connected {
            self.send_subscribe_frame(&identifier);
        }
        subscription
    }

    fn send_subscribe_frame(&self, identifier: &SubscriptionIdentifier) {
        let frame = OutgoingFrame::subscribe(identifier.encode());
        let handle = self.handle.clone();
        let runner = handle.runner.clone();
        let enqueued = runner.enqueue_detached(move || async move {
            if let Err(e) = handle.send_frame(CancellationToken::new(), frame).await {
                tracing::warn!(error = %e, "failed to send subscribe frame");
            }
        });
        if let Err(e) = enqueued {
            tracing::warn!(error = %e, "sequential runner stopped; could not enqueue subscribe frame");
        }
    }

    async fn handle_frame(&mut self, frame: WsFrame) {
        let text = match frame {
            WsFrame::Text(t) => t,
            WsFrame::Binary(_) => {
                tracing::debug!("ignoring unexpected binary cable frame");
                return;
            }
            WsFrame::Close => {
                tracing::warn!("cable transport closed by peer");
                self.begin_reconnect().await;
                return;
            }
        };
        let decoded = match IncomingFrame::decode(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed cable frame");
                return;
            }
        };
        match decoded {
            IncomingFrame::Welcome => self.handle_welcome().await,
            IncomingFrame::Ping { .. } => {
                self.last_ping = Some(Instant::now());
            }
            IncomingFrame::Disconnect { reason, reconnect } => {
                tracing::info!(reason = ?reason, reconnect, "server requested disconnect");
                if reconnect {
                    self.begin_reconnect().await;
                } else {
                    self.set_state(ClientState::Disconnecting);
                    self.close_transport().await;
                    self.next_attempt = None;
                    self.set_state(ClientState::Disconnected);
                }
            }
            IncomingFrame::ConfirmSubscription { identifier } => match self.find_subscription(&identifier) {
                Some(sub) => sub.mark_subscribed().await,
                None => tracing::debug!(identifier = %identifier, "confirm_subscription for unknown subscription"),
            },
            IncomingFrame::RejectSubscription { identifier } => match self.find_subscription(&identifier) {
                Some(sub) => sub.mark_rejected(),
                None => tracing::debug!(identifier = %identifier, "reject_subscription for unknown subscription"),
            },
            IncomingFrame::Message { identifier, data } => match self.find_subscription(&identifier) {
                Some(sub) => sub.dispatch_message(data).await,
                None => tracing::debug!(identifier = %identifier, "message for unknown subscription"),
            },
        }
    }

    fn find_subscription(&self, identifier: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.iter().find(|s| s.identifier().encode() == identifier).cloned()
    }

    async fn handle_welcome(&mut self) {
        if let Some(sender) = self.pending_sender.take() {
            self.handle.sender.publish(sender).await;
        }
        self.current_backoff = self.config.backoff.initial;
        self.next_attempt = None;
        self.last_ping = Some(Instant::now());
        self.set_state(ClientState::Connected);
        for subscription in &self.subscriptions {
            if subscription.state() != SubscriptionState::Unsubscribed {
                self.send_subscribe_frame(subscription.identifier());
            }
        }
    }

    async fn attempt_connect(&mut self) {
        self.set_state(ClientState::Connecting);
        let headers = [("Origin", self.config.origin.clone())];
        match self.connector.connect(&self.config.url, &headers).await {
            Ok((sender, receiver)) => {
                self.receiver = Some(receiver);
                self.pending_sender = Some(sender);
                self.last_ping = None;
                self.set_state(ClientState::WaitingForWelcome);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cable connect attempt failed");
                self.schedule_reconnect();
            }
        }
    }

    async fn begin_reconnect(&mut self) {
        self.close_transport().await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.set_state(ClientState::Reconnecting);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        self.next_attempt = Some(Instant::now() + self.current_backoff + jitter);
        self.current_backoff = (self.current_backoff * 2).min(self.config.backoff.max);
    }

    async fn close_transport(&mut self) {
        self.receiver = None;
        if let Some(mut sender) = self.pending_sender.take() {
            let _ = sender.close().await;
        }
        if let Some(mut sender) = self.handle.sender.take().await {
            let _ = sender.close().await;
        }
    }

    async fn check_watchdog(&mut self) {
        if self.current_state() != ClientState::Connected {
            return;
        }
        if let Some(last) = self.last_ping {
            if last.elapsed() > self.config.ping_stale_threshold {
                tracing::warn!("cable ping watchdog stale; forcing reconnect");
                self.begin_reconnect().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::connector_pair;
    use tokio::time::timeout;

    fn test_config(url: &str) -> CableClientConfig {
        CableClientConfig {
            url: url.to_owned(),
            origin: "http://localhost".to_owned(),
            backoff: BackoffConfig { initial: Duration::from_millis(5), max: Duration::from_millis(20) },
            ping_stale_threshold: Duration::from_secs(6),
        }
    }

    #[tokio::test]
    async fn connect_welcome_then_subscribe_confirms() {
        let (connector, inject, mut sent) = connector_pair();
        let client = CableClient::spawn(test_config("ws://example.com"), Arc::new(connector));

        client.connect().await.unwrap();
        inject.send(WsFrame::Text(r#"{"type":"welcome"}"#.to_owned())).unwrap();

        let mut state_rx = client.handle.state.clone();
        timeout(Duration::from_secs(1), state_rx.wait_for(|s| *s == ClientState::Connected))
            .await
            .unwrap()
            .unwrap();

        let identifier = SubscriptionIdentifier::new("ClientChannel").param("ClientId", "abc");
        let subscription = client.subscribe(identifier.clone()).await.unwrap();

        let sent_frame = timeout(Duration::from_secs(1), sent.recv()).await.unwrap().unwrap();
        assert_eq!(sent_frame, WsFrame::Text(OutgoingFrame::subscribe(identifier.encode()).encode()));

        inject
            .send(WsFrame::Text(format!(
                r#"{{"type":"confirm_subscription","identifier":{}}}"#,
                serde_json::to_string(&identifier.encode()).unwrap()
            )))
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while subscription.state() != SubscriptionState::Subscribed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn disconnect_without_reconnect_stays_disconnected() {
        let (connector, inject, _sent) = connector_pair();
        let client = CableClient::spawn(test_config("ws://example.com"), Arc::new(connector));
        client.connect().await.unwrap();
        inject.send(WsFrame::Text(r#"{"type":"welcome"}"#.to_owned())).unwrap();

        let mut state_rx = client.handle.state.clone();
        timeout(Duration::from_secs(1), state_rx.wait_for(|s| *s == ClientState::Connected))
            .await
            .unwrap()
            .unwrap();

        inject.send(WsFrame::Text(r#"{"type":"disconnect","reconnect":false}"#.to_owned())).unwrap();

        timeout(Duration::from_secs(1), state_rx.wait_for(|s| *s == ClientState::Disconnected))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn subscribe_while_disconnected_sends_no_frame_until_welcome() {
        let (connector, inject, mut sent) = connector_pair();
        let client = CableClient::spawn(test_config("ws://example.com"), Arc::new(connector));

        let identifier = SubscriptionIdentifier::new("ClientChannel").param("ClientId", "abc");
        let subscription = client.subscribe(identifier.clone()).await.unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Pending);

        client.connect().await.unwrap();
        assert!(timeout(Duration::from_millis(50), sent.recv()).await.is_err());

        inject.send(WsFrame::Text(r#"{"type":"welcome"}"#.to_owned())).unwrap();
        let sent_frame = timeout(Duration::from_secs(1), sent.recv()).await.unwrap().unwrap();
        assert_eq!(sent_frame, WsFrame::Text(OutgoingFrame::subscribe(identifier.encode()).encode()));
    }
}
