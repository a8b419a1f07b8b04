//! Hub server: accepts participant connections and drives their rooms.
//!
//! Every connection gets its own task: upgrade (token check), one join
//! exchange, then a read loop that broadcasts each message to the rest of
//! the room. A failed read ends the participant's membership.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use roomhub_core::messages::CAUSE_INVALID_PASSWORD;
use roomhub_core::{encode_message, HubError, HubRequest, HubResult, JoinResponse};

use crate::config::ServerConfig;
use crate::registry::{Outbound, RoomRegistry};
use crate::transport::websocket::{self, WsOutbound};

/// State shared by all connection tasks.
struct HubContext {
    registry: Arc<RoomRegistry>,
    token: String,
    path: String,
}

/// The hub server instance.
pub struct HubServer {
    config: ServerConfig,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    registry: Arc<RoomRegistry>,
}

impl HubServer {
    /// Bind the listening socket. TLS is used when `tls_config` is given.
    pub async fn bind(
        config: ServerConfig,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> HubResult<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| HubError::Transport(format!("bind {} failed: {e}", config.listen)))?;

        Ok(Self {
            config,
            listener,
            tls: tls_config.map(TlsAcceptor::from),
            registry: Arc::new(RoomRegistry::new()),
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The room registry served by this hub.
    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    /// Accept connections forever.
    pub async fn run(self) -> HubResult<()> {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            path = %self.config.path,
            tls = self.tls.is_some(),
            "roomhub-server ready"
        );

        let ctx = Arc::new(HubContext {
            registry: self.registry.clone(),
            token: self.config.token.clone(),
            path: self.config.path.clone(),
        });

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    continue;
                }
            };

            let ctx = ctx.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_participant(tls_stream, remote, ctx).await,
                        Err(e) => Err(HubError::Transport(format!("TLS handshake failed: {e}"))),
                    },
                    None => serve_participant(stream, remote, ctx).await,
                };
                if let Err(e) = result {
                    debug!(remote = %remote, error = %e, "participant connection ended with error");
                }
            });
        }
    }
}

/// Drive one participant connection from upgrade to leave.
async fn serve_participant<S>(stream: S, remote: SocketAddr, ctx: Arc<HubContext>) -> HubResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = websocket::accept(stream, &ctx.token, &ctx.path).await?;
    debug!(remote = %remote, "WebSocket connection accepted");

    let (sink, mut read) = ws.split();
    let outbound = Arc::new(WsOutbound::new(sink));

    let first = websocket::recv_data(&mut read)
        .await?
        .ok_or_else(|| HubError::Protocol("connection closed before join".into()))?;

    let (room, password) = match HubRequest::parse(&first.into_data()) {
        Ok(HubRequest::Join { room, password }) => (room, password),
        Err(cause) => {
            warn!(remote = %remote, cause, "rejecting first message");
            let _ = outbound.deliver(join_reply(JoinResponse::error(cause))?).await;
            return Err(HubError::Protocol(cause.to_string()));
        }
    };

    // Hold the write half until the ack is out so no broadcast overtakes it.
    let membership = {
        let mut sink = outbound.sink.lock().await;
        match ctx
            .registry
            .join(&room, &password, remote, outbound.clone())
            .await
        {
            Ok(membership) => {
                if let Err(e) = sink.send(join_reply(JoinResponse::joined())?).await {
                    drop(sink);
                    ctx.registry.leave(&membership.room, membership.id).await;
                    return Err(HubError::Transport(format!("failed to send join ack: {e}")));
                }
                membership
            }
            Err(e) => {
                let _ = sink
                    .send(join_reply(JoinResponse::error(CAUSE_INVALID_PASSWORD))?)
                    .await;
                let _ = sink.close().await;
                return Err(e);
            }
        }
    };

    loop {
        match websocket::recv_data(&mut read).await {
            Ok(Some(message)) => {
                trace!(remote = %remote, room = %membership.room, bytes = message.len(), "recv");
                if ctx
                    .registry
                    .broadcast(&membership.room, membership.id, message)
                    .await
                    .is_none()
                {
                    debug!(remote = %remote, room = %membership.room, "no longer a member, closing");
                    let _ = outbound.sink.lock().await.close().await;
                    break;
                }
            }
            Ok(None) => {
                debug!(remote = %remote, room = %membership.room, "participant closed connection");
                break;
            }
            Err(e) => {
                debug!(remote = %remote, room = %membership.room, error = %e, "read error, removing participant");
                break;
            }
        }
    }

    ctx.registry.leave(&membership.room, membership.id).await;
    Ok(())
}

fn join_reply(response: JoinResponse) -> HubResult<Message> {
    Ok(Message::Text(encode_message(&response)?.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use roomhub_core::{decode_message, JoinStatus, TOKEN_HEADER};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tokio_tungstenite::MaybeTlsStream;

    type ClientWs = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start_hub() -> (SocketAddr, Arc<RoomRegistry>) {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), "test-token");
        let server = HubServer::bind(config, None).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(server.run());
        (addr, registry)
    }

    async fn connect(addr: SocketAddr, path: &str, token: &str) -> Result<ClientWs, WsError> {
        let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(TOKEN_HEADER, token.parse().unwrap());
        tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn send_text(ws: &mut ClientWs, text: &str) {
        ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    async fn next_reply(ws: &mut ClientWs) -> JoinResponse {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return decode_message(text.as_bytes()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_with_401() {
        let (addr, _) = start_hub().await;
        match connect(addr, "/hub", "nope").await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn unknown_path_is_rejected_with_404() {
        let (addr, _) = start_hub().await;
        match connect(addr, "/elsewhere", "test-token").await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
            other => panic!("expected HTTP 404, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn garbage_first_message_gets_parse_cause() {
        let (addr, _) = start_hub().await;
        let mut ws = connect(addr, "/hub", "test-token").await.unwrap();
        send_text(&mut ws, "{not json").await;
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply.status, JoinStatus::Error);
        assert!(!reply.success);
        assert_eq!(reply.cause, "failed to parse request");
    }

    #[tokio::test]
    async fn unknown_type_gets_unknown_cause() {
        let (addr, _) = start_hub().await;
        let mut ws = connect(addr, "/hub", "test-token").await.unwrap();
        send_text(&mut ws, r#"{"type":"dance","room":"r"}"#).await;
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply.cause, "unknown request type");
    }

    #[tokio::test]
    async fn join_then_relay_between_two_participants() {
        let (addr, registry) = start_hub().await;
        let mut a = connect(addr, "/hub", "test-token").await.unwrap();
        let mut b = connect(addr, "/hub", "test-token").await.unwrap();

        send_text(&mut a, r#"{"type":"join","room":"r1","password":"pw"}"#).await;
        assert_eq!(next_reply(&mut a).await.status, JoinStatus::Joined);
        send_text(&mut b, r#"{"type":"join","room":"r1","password":"pw"}"#).await;
        assert_eq!(next_reply(&mut b).await.status, JoinStatus::Joined);
        assert_eq!(registry.participant_count("r1").await, Some(2));

        a.send(Message::Binary(b"ping".to_vec().into())).await.unwrap();
        loop {
            match b.next().await.unwrap().unwrap() {
                Message::Binary(data) => {
                    assert_eq!(&data[..], b"ping");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn wrong_password_is_refused_without_joining() {
        let (addr, registry) = start_hub().await;
        let mut a = connect(addr, "/hub", "test-token").await.unwrap();
        send_text(&mut a, r#"{"type":"join","room":"r2","password":"right"}"#).await;
        assert_eq!(next_reply(&mut a).await.status, JoinStatus::Joined);

        let mut b = connect(addr, "/hub", "test-token").await.unwrap();
        send_text(&mut b, r#"{"type":"join","room":"r2","password":"wrong"}"#).await;
        let reply = next_reply(&mut b).await;
        assert_eq!(reply.status, JoinStatus::Error);
        assert_eq!(reply.cause, "invalid password");
        assert_eq!(registry.participant_count("r2").await, Some(1));
    }

    #[tokio::test]
    async fn room_removed_when_last_participant_disconnects() {
        let (addr, registry) = start_hub().await;
        let mut a = connect(addr, "/hub", "test-token").await.unwrap();
        send_text(&mut a, r#"{"type":"join","room":"r3","password":"pw"}"#).await;
        assert_eq!(next_reply(&mut a).await.status, JoinStatus::Joined);
        assert!(registry.contains("r3").await);

        a.close(None).await.unwrap();
        drop(a);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while registry.contains("r3").await {
            assert!(tokio::time::Instant::now() < deadline, "room was not removed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
