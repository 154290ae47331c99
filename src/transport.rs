//! WebSocket transport adapter: the thin, testable surface the Cable client
//! is built against. Connecting yields a split sender/receiver pair (the
//! same shape `tokio-tungstenite`'s `WebSocketStream::split` gives
//! `rt-test-utils`'s mock client) so one task can own writes while another
//! owns the read loop, with no shared lock held across an `.await`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::Message as TungsteniteMessage;

/// One frame crossing the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Transport-level failures, kept distinct from protocol decode errors so
/// the Cable client can tell "the socket broke" from "the server sent
/// garbage" apart.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("transport is closed")]
    Closed,
}

#[async_trait]
pub trait WsSender: Send {
    async fn send(&mut self, frame: WsFrame) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
    /// Close the outbound half only; a concurrent receiver may keep
    /// draining in-flight frames (used after a server-initiated
    /// `disconnect` while still reading the tail of the stream).
    async fn close_output_only(&mut self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait WsReceiver: Send {
    async fn recv(&mut self) -> Result<WsFrame, TransportError>;
}

/// Dials a URL and returns an already-split sender/receiver pair.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<(Box<dyn WsSender>, Box<dyn WsReceiver>), TransportError>;
}

type TlsWsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// The real connector, backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<(Box<dyn WsSender>, Box<dyn WsReceiver>), TransportError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid URL '{url}': {e}")))?;
        for (name, value) in headers {
            let header_value = value
                .parse()
                .map_err(|e| TransportError::Connect(format!("invalid header `{name}`: {e}")))?;
            request.headers_mut().insert(*name, header_value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, source) = stream.split();
        Ok((
            Box::new(TungsteniteSender { sink, connected: true }),
            Box::new(TungsteniteReceiver { source }),
        ))
    }
}

struct TungsteniteSender {
    sink: SplitSink<TlsWsStream, TungsteniteMessage>,
    connected: bool,
}

#[async_trait]
impl WsSender for TungsteniteSender {
    async fn send(&mut self, frame: WsFrame) -> Result<(), TransportError> {
        let message = match frame {
            WsFrame::Text(text) => TungsteniteMessage::Text(text.into()),
            WsFrame::Binary(bytes) => TungsteniteMessage::Binary(bytes.into()),
            WsFrame::Close => TungsteniteMessage::Close(None),
        };
        self.sink.send(message).await.map_err(|e| {
            self.connected = false;
            TransportError::Send(e.to_string())
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        let _ = self.sink.close().await;
        Ok(())
    }

    async fn close_output_only(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(TungsteniteMessage::Close(None))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

struct TungsteniteReceiver {
    source: SplitStream<TlsWsStream>,
}

#[async_trait]
impl WsReceiver for TungsteniteReceiver {
    async fn recv(&mut self) -> Result<WsFrame, TransportError> {
        loop {
            match self.source.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                Some(Ok(TungsteniteMessage::Text(t))) => return Ok(WsFrame::Text(t.to_string())),
                Some(Ok(TungsteniteMessage::Binary(b))) => return Ok(WsFrame::Binary(b.to_vec())),
                Some(Ok(TungsteniteMessage::Close(_))) => return Ok(WsFrame::Close),
                // tungstenite answers pings with a queued pong automatically.
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! An in-memory connector for exercising `CableClient` without a real
    //! socket: a lighter-weight channel-based analogue of
    //! `rt-test-utils`'s real-socket `MockWsClient`/`MockWsServer` pairing,
    //! used here because we're testing the trait boundary itself rather
    //! than a wire handshake.

    use super::{TransportError, WsConnector, WsFrame, WsReceiver, WsSender};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    pub struct MockWsConnector {
        fail_next: Arc<AtomicBool>,
        handles: std::sync::Mutex<Option<(mpsc::UnboundedReceiver<WsFrame>, mpsc::UnboundedSender<WsFrame>)>>,
    }

    impl MockWsConnector {
        /// `server_to_client` is drained by the client's receiver;
        /// `client_to_server` is fed by the client's sender. Both channel
        /// halves are consumed on the first `connect` call.
        fn new(
            server_to_client: mpsc::UnboundedReceiver<WsFrame>,
            client_to_server: mpsc::UnboundedSender<WsFrame>,
        ) -> Self {
            MockWsConnector {
                fail_next: Arc::new(AtomicBool::new(false)),
                handles: std::sync::Mutex::new(Some((server_to_client, client_to_server))),
            }
        }

        pub fn fail_next_connect(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WsConnector for MockWsConnector {
        async fn connect(
            &self,
            _url: &str,
            _headers: &[(&'static str, String)],
        ) -> Result<(Box<dyn WsSender>, Box<dyn WsReceiver>), TransportError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(TransportError::Connect("mock connect failure".to_owned()));
            }
            let (inbound, outbound) = self
                .handles
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::Connect("mock connector already consumed".to_owned()))?;
            let connected = Arc::new(AtomicBool::new(true));
            let sender = MockWsSender { outbound, connected: connected.clone() };
            let receiver = MockWsReceiver { inbound };
            Ok((Box::new(sender), Box::new(receiver)))
        }
    }

    struct MockWsSender {
        outbound: mpsc::UnboundedSender<WsFrame>,
        connected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl WsSender for MockWsSender {
        async fn send(&mut self, frame: WsFrame) -> Result<(), TransportError> {
            self.outbound.send(frame).map_err(|_| TransportError::Send("server dropped".to_owned()))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn close_output_only(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct MockWsReceiver {
        inbound: mpsc::UnboundedReceiver<WsFrame>,
    }

    #[async_trait]
    impl WsReceiver for MockWsReceiver {
        async fn recv(&mut self) -> Result<WsFrame, TransportError> {
            self.inbound.recv().await.ok_or(TransportError::Closed)
        }
    }

    /// Build a connector plus the harness used to drive the "server" side
    /// of the same pair: `inject` pushes frames the client will receive,
    /// `sent` drains frames the client sent.
    pub fn connector_pair() -> (MockWsConnector, mpsc::UnboundedSender<WsFrame>, mpsc::UnboundedReceiver<WsFrame>) {
        let (inject, server_to_client) = mpsc::unbounded_channel();
        let (client_to_server, sent) = mpsc::unbounded_channel();
        let connector = MockWsConnector::new(server_to_client, client_to_server);
        (connector, inject, sent)
    }
}
