//! WebSocket endpoint using tokio-tungstenite.
//!
//! The bearer token is checked during the HTTP upgrade, before any room
//! logic runs. Each accepted socket is split: the read half stays with the
//! participant's task, the write half is shared with the room registry
//! through [`WsOutbound`].

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

use roomhub_core::{HubError, HubResult, TOKEN_HEADER};

use crate::registry::Outbound;

/// Maximum size of a single message accepted from a participant (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Upgrade `stream` to a WebSocket.
///
/// Requests for another path are answered 404; requests without the
/// expected `x-token` header are answered 401.
pub async fn accept<S>(stream: S, token: &str, path: &str) -> HubResult<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let callback = |req: &Request, response: Response| {
        let req_path = req.uri().path();
        if req_path != path && req_path.trim_end_matches('/') != path {
            warn!(path = %req_path, "unknown endpoint requested");
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        let presented = req
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(token) {
            warn!("invalid token provided");
            return Err(reject(StatusCode::UNAUTHORIZED, "invalid token"));
        }
        Ok(response)
    };

    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| HubError::Transport(format!("WS upgrade failed: {e}")))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Receive the next data (text or binary) message.
///
/// Returns `None` once the peer closed. Control frames are skipped.
pub async fn recv_data<St>(ws: &mut St) -> HubResult<Option<Message>>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                if message.len() > MAX_WS_FRAME_SIZE {
                    return Err(HubError::Protocol(format!(
                        "WS message too large: {} bytes (max {})",
                        message.len(),
                        MAX_WS_FRAME_SIZE
                    )));
                }
                return Ok(Some(message));
            }
            // Keep polling after a close frame so the reply gets flushed.
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
            Some(Err(e)) => return Err(HubError::Transport(format!("WS recv failed: {e}"))),
            None => return Ok(None),
        }
    }
}

/// Shared write half of a participant's socket.
pub struct WsOutbound<S> {
    pub(crate) sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> WsOutbound<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl<S> Outbound for WsOutbound<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn deliver<'a>(
        &'a self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = HubResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            sink.send(message)
                .await
                .map_err(|e| HubError::Transport(format!("WS send failed: {e}")))
        })
    }
}
