//! Rendezvous sessions.
//!
//! A `RendezvousSession` is one room membership over one hub link. Structured
//! messages travel as JSON text frames; relay payloads as binary frames. The
//! session can be split so that one task sends while another receives; both
//! halves share a single close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace};

use roomhub_core::messages::CAUSE_INVALID_PASSWORD;
use roomhub_core::{
    decode_message, encode_message, HubError, HubRequest, HubResult, JoinResponse, JoinStatus,
};

use crate::transport::{self, websocket, LinkSink, LinkStream, ProxyMode};

/// Lifecycle of a session.
///
/// A [`RendezvousSession`] is only handed out once the hub has acknowledged
/// the join, so `state()` on a session or either of its halves reports
/// `Joined` or `Closed`. `Disconnected` and `AwaitingJoinAck` describe a
/// [`HubClient::join`] still in progress and show up in its trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link yet.
    Disconnected,
    /// Join sent, waiting for the hub's answer.
    AwaitingJoinAck,
    /// Member of the room; messages flow.
    Joined,
    /// Closed locally or by the hub. Terminal.
    Closed,
}

/// Options for reaching the hub.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Limit on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Limit on waiting for the join answer.
    pub join_timeout: Duration,
    /// Route to the hub.
    pub proxy: ProxyMode,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            proxy: ProxyMode::System,
        }
    }
}

/// Hub address plus credentials; every `join` opens a fresh link.
#[derive(Debug, Clone)]
pub struct HubClient {
    url: String,
    token: String,
    config: ConnectConfig,
}

impl HubClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_config(url, token, ConnectConfig::default())
    }

    pub fn with_config(url: impl Into<String>, token: impl Into<String>, config: ConnectConfig) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the hub and join `room`, creating it if absent.
    ///
    /// Fails with [`HubError::RoomPasswordMismatch`] when the room exists
    /// under another password, [`HubError::Authentication`] when the hub
    /// refuses the token.
    pub async fn join(&self, room: &str, password: &str) -> HubResult<RendezvousSession> {
        let mut state = SessionState::Disconnected;
        trace!(room = %room, ?state, "joining");

        let ws = transport::connect(
            &self.url,
            &self.token,
            self.config.connect_timeout,
            &self.config.proxy,
        )
        .await?;
        let (mut sink, mut stream) = ws.split();

        let request = HubRequest::Join {
            room: room.to_string(),
            password: password.to_string(),
        };
        websocket::send(&mut sink, Message::Text(encode_message(&request)?.into())).await?;
        state = SessionState::AwaitingJoinAck;
        trace!(room = %room, ?state, "join sent");

        let outcome = match tokio::time::timeout(self.config.join_timeout, websocket::recv(&mut stream)).await {
            Err(_) => Err(HubError::Timeout),
            Ok(Err(reason)) => Err(HubError::Closed(reason)),
            Ok(Ok(Message::Text(text))) => decode_message::<JoinResponse>(text.as_bytes()),
            Ok(Ok(_)) => Err(HubError::Protocol("expected a join answer, got a binary frame".into())),
        };

        let failure = match outcome {
            Ok(response) if response.status == JoinStatus::Joined => None,
            Ok(response) if response.cause == CAUSE_INVALID_PASSWORD => {
                Some(HubError::RoomPasswordMismatch {
                    room: room.to_string(),
                })
            }
            Ok(response) => Some(HubError::JoinRejected(response.cause)),
            Err(e) => Some(e),
        };
        if let Some(e) = failure {
            debug!(room = %room, error = %e, "join failed");
            let _ = sink.close().await;
            return Err(e);
        }

        info!(room = %room, hub = %self.url, "joined room");
        Ok(RendezvousSession::new(room.to_string(), sink, stream))
    }
}

/// State shared by both halves of a session.
struct Shared {
    room: String,
    sink: Mutex<LinkSink>,
    closed: AtomicBool,
    ended: AtomicBool,
}

impl Shared {
    /// `Joined` until either half closes or the link ends.
    fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) || self.ended.load(Ordering::SeqCst) {
            SessionState::Closed
        } else {
            SessionState::Joined
        }
    }

    async fn send(&self, message: Message) -> HubResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::AlreadyClosed);
        }
        let mut sink = self.sink.lock().await;
        websocket::send(&mut sink, message).await
    }

    async fn close(&self) -> HubResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(HubError::AlreadyClosed);
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
        debug!(room = %self.room, "session closed");
        Ok(())
    }
}

/// A joined room membership.
pub struct RendezvousSession {
    sender: SessionSender,
    receiver: SessionReceiver,
}

impl RendezvousSession {
    fn new(room: String, sink: LinkSink, stream: LinkStream) -> Self {
        let shared = Arc::new(Shared {
            room,
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        });
        Self {
            sender: SessionSender {
                shared: shared.clone(),
            },
            receiver: SessionReceiver { shared, stream },
        }
    }

    pub fn room(&self) -> &str {
        self.sender.room()
    }

    pub fn state(&self) -> SessionState {
        self.sender.state()
    }

    pub async fn send_message<T: Serialize>(&self, message: &T) -> HubResult<()> {
        self.sender.send_message(message).await
    }

    pub async fn send_frame(&self, data: &[u8]) -> HubResult<()> {
        self.sender.send_frame(data).await
    }

    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> HubResult<T> {
        self.receiver.recv_message().await
    }

    pub async fn recv_frame(&mut self) -> HubResult<Vec<u8>> {
        self.receiver.recv_frame().await
    }

    /// Leave the room. A second close fails with [`HubError::AlreadyClosed`].
    pub async fn close(&self) -> HubResult<()> {
        self.sender.close().await
    }

    /// Split into independently owned send and receive halves.
    pub fn into_split(self) -> (SessionSender, SessionReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a session. Cheap to clone.
#[derive(Clone)]
pub struct SessionSender {
    shared: Arc<Shared>,
}

impl SessionSender {
    pub fn room(&self) -> &str {
        &self.shared.room
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Send a structured message as one JSON text frame.
    pub async fn send_message<T: Serialize>(&self, message: &T) -> HubResult<()> {
        let text = encode_message(message)?;
        self.shared.send(Message::Text(text.into())).await
    }

    /// Send raw bytes as one binary frame.
    pub async fn send_frame(&self, data: &[u8]) -> HubResult<()> {
        trace!(room = %self.shared.room, bytes = data.len(), "send frame");
        self.shared.send(Message::Binary(data.to_vec().into())).await
    }

    pub async fn close(&self) -> HubResult<()> {
        self.shared.close().await
    }
}

/// Receiving half of a session.
pub struct SessionReceiver {
    shared: Arc<Shared>,
    stream: LinkStream,
}

impl SessionReceiver {
    pub fn room(&self) -> &str {
        &self.shared.room
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Receive the next structured message.
    ///
    /// A malformed message yields a codec error and leaves the session
    /// usable; a closed link yields [`HubError::Closed`].
    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> HubResult<T> {
        match self.next().await? {
            Message::Text(text) => decode_message(text.as_bytes()),
            _ => Err(HubError::Protocol("unexpected binary frame".into())),
        }
    }

    /// Receive the next relay frame.
    pub async fn recv_frame(&mut self) -> HubResult<Vec<u8>> {
        match self.next().await? {
            Message::Binary(data) => Ok(data.into()),
            _ => Err(HubError::Protocol("unexpected text frame in relay".into())),
        }
    }

    pub async fn close(&self) -> HubResult<()> {
        self.shared.close().await
    }

    async fn next(&mut self) -> HubResult<Message> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(HubError::AlreadyClosed);
        }
        match websocket::recv(&mut self.stream).await {
            Ok(message) => Ok(message),
            Err(reason) => {
                self.shared.ended.store(true, Ordering::SeqCst);
                debug!(room = %self.shared.room, %reason, "link ended");
                Err(HubError::Closed(reason))
            }
        }
    }
}
