//! Reaching the hub through an HTTP proxy.
//!
//! The proxy is asked to `CONNECT` to the hub's host and port; the WebSocket
//! handshake then runs over the returned stream.

use std::net::IpAddr;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use roomhub_core::{HubError, HubResult};

const MAX_REPLY_HEADERS: usize = 64;
const MAX_REPLY_LEN: usize = 16 * 1024;

/// How links reach the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyMode {
    /// Use the proxy named by the environment, honouring `NO_PROXY`.
    #[default]
    System,
    /// Always go through this proxy URL.
    Explicit(String),
    /// Connect straight to the hub.
    Direct,
}

impl ProxyMode {
    /// The proxy to use for a hub at `host` reached with `scheme`
    /// (`ws` or `wss`), or `None` for a direct connection.
    pub fn select(&self, scheme: &str, host: &str) -> HubResult<Option<Url>> {
        self.select_with(scheme, host, |name| std::env::var(name).ok())
    }

    fn select_with(
        &self,
        scheme: &str,
        host: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> HubResult<Option<Url>> {
        match self {
            ProxyMode::Direct => Ok(None),
            ProxyMode::Explicit(proxy) => parse_proxy_url(proxy).map(Some),
            ProxyMode::System => {
                if is_loopback(host) {
                    return Ok(None);
                }
                let names: &[&str] = if scheme == "wss" {
                    &["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"]
                } else {
                    &["HTTP_PROXY", "http_proxy"]
                };
                let Some(proxy) = names
                    .iter()
                    .filter_map(|name| env(*name))
                    .find(|value| !value.trim().is_empty())
                else {
                    return Ok(None);
                };
                let no_proxy = env("NO_PROXY").or_else(|| env("no_proxy")).unwrap_or_default();
                if bypassed(&no_proxy, host) {
                    debug!(host = %host, "host listed in NO_PROXY, connecting directly");
                    return Ok(None);
                }
                parse_proxy_url(proxy.trim()).map(Some)
            }
        }
    }
}

fn parse_proxy_url(proxy: &str) -> HubResult<Url> {
    let with_scheme = if proxy.contains("://") {
        proxy.to_string()
    } else {
        format!("http://{proxy}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| HubError::Config(format!("invalid proxy url {proxy:?}: {e}")))?;
    if url.scheme() != "http" {
        return Err(HubError::Config(format!(
            "unsupported proxy scheme {:?} (only http:// proxies are supported)",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(HubError::Config(format!("proxy url {proxy:?} has no host")));
    }
    Ok(url)
}

fn is_loopback(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.eq_ignore_ascii_case("localhost")
        || bare.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// `NO_PROXY` matching: `*`, exact hosts, and domain suffixes (with or
/// without a leading dot).
fn bypassed(no_proxy: &str, host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    no_proxy
        .split(',')
        .map(|entry| entry.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .any(|entry| entry == "*" || host == entry || host.ends_with(&format!(".{entry}")))
}

/// Open a TCP stream to `authority` (`host:port`) through `proxy`.
pub async fn open_tunnel(proxy: &Url, authority: &str) -> HubResult<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| HubError::Config("proxy url has no host".into()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);
    let proxy_addr = format!("{proxy_host}:{proxy_port}");

    let mut stream = TcpStream::connect(&proxy_addr)
        .await
        .map_err(|e| HubError::Transport(format!("failed to reach proxy {proxy_addr}: {e}")))?;

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = basic_credentials(proxy) {
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    match read_reply(&mut stream).await? {
        200..=299 => {
            debug!(proxy = %proxy_addr, target = %authority, "proxy tunnel established");
            Ok(stream)
        }
        407 => Err(HubError::Authentication(format!(
            "proxy {proxy_addr} requires authentication"
        ))),
        code => Err(HubError::Transport(format!(
            "proxy {proxy_addr} refused CONNECT to {authority} with HTTP {code}"
        ))),
    }
}

fn basic_credentials(proxy: &Url) -> Option<String> {
    if proxy.username().is_empty() {
        return None;
    }
    let pair = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
    Some(base64::engine::general_purpose::STANDARD.encode(pair))
}

/// Read the proxy's answer head and return its status code.
async fn read_reply(stream: &mut TcpStream) -> HubResult<u16> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HubError::Transport(
                "proxy closed the connection during CONNECT".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_REPLY_HEADERS];
        let mut reply = httparse::Response::new(&mut headers);
        match reply.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let code = reply
                    .code
                    .ok_or_else(|| HubError::Protocol("proxy reply has no status".into()))?;
                if len < buf.len() && (200..300).contains(&code) {
                    return Err(HubError::Protocol(
                        "proxy sent data before the tunnel was used".into(),
                    ));
                }
                return Ok(code);
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_REPLY_LEN => continue,
            Ok(httparse::Status::Partial) => {
                return Err(HubError::Protocol("proxy reply head too long".into()))
            }
            Err(e) => return Err(HubError::Protocol(format!("invalid proxy reply: {e}"))),
        }
    }
}
