//! WebSocket link to the hub using tokio-tungstenite.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use roomhub_core::{CloseReason, HubError, HubResult, TOKEN_HEADER};

use super::proxy::{self, ProxyMode};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type LinkSink = SplitSink<WsStream, Message>;
pub type LinkStream = SplitStream<WsStream>;

/// Open a WebSocket to `url`, presenting `token` in the `x-token` header.
///
/// When `route` selects an HTTP proxy the handshake runs over a `CONNECT`
/// tunnel. An HTTP 401 from the hub surfaces as [`HubError::Authentication`].
pub async fn connect(
    url: &str,
    token: &str,
    timeout: Duration,
    route: &ProxyMode,
) -> HubResult<WsStream> {
    let mut request = url
        .into_client_request()
        .map_err(|e| HubError::Config(format!("invalid hub url {url:?}: {e}")))?;
    let value = HeaderValue::from_str(token)
        .map_err(|_| HubError::Config("token is not a valid header value".into()))?;
    request.headers_mut().insert(TOKEN_HEADER, value);

    let scheme = request.uri().scheme_str().unwrap_or("ws").to_string();
    let host = request
        .uri()
        .host()
        .ok_or_else(|| HubError::Config(format!("hub url {url:?} has no host")))?
        .to_string();
    let port = request
        .uri()
        .port_u16()
        .unwrap_or(if scheme == "wss" { 443 } else { 80 });
    let via = route.select(&scheme, &host)?;

    let handshake = async {
        match via {
            Some(proxy_url) => {
                debug!(url = %url, proxy = %proxy_url, "connecting through proxy");
                let stream = proxy::open_tunnel(&proxy_url, &format!("{host}:{port}")).await?;
                client_async_tls(request, stream).await.map_err(handshake_error)
            }
            None => connect_async(request).await.map_err(handshake_error),
        }
    };
    let (ws, _response) = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| HubError::Timeout)??;

    debug!(url = %url, "WebSocket connected");
    Ok(ws)
}

fn handshake_error(e: WsError) -> HubError {
    match e {
        WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            HubError::Authentication("hub rejected the token".into())
        }
        WsError::Http(response) => {
            HubError::Transport(format!("hub answered HTTP {}", response.status()))
        }
        other => HubError::Transport(format!("WebSocket connect error: {other}")),
    }
}

/// Send one message on the write half.
pub async fn send(sink: &mut LinkSink, message: Message) -> HubResult<()> {
    sink.send(message).await.map_err(|e| match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => HubError::Closed(CloseReason::Normal),
        other => HubError::Transport(format!("WS send error: {other}")),
    })
}

/// Receive the next text or binary message.
///
/// Control frames are skipped. When the link ends, the error tells how.
pub async fn recv(stream: &mut LinkStream) -> Result<Message, CloseReason> {
    loop {
        match stream.next().await {
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => return Ok(message),
            Some(Ok(Message::Close(_))) => return Err(CloseReason::Normal),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(classify(&e)),
            None => return Err(CloseReason::Abnormal),
        }
    }
}

/// Map a tungstenite error to the way the link ended.
fn classify(error: &WsError) -> CloseReason {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => CloseReason::Normal,
        // reset without handshake, I/O, protocol
        _ => CloseReason::Abnormal,
    }
}
