//! Client role.
//!
//! Listens on local TCP addresses. Every accepted connection asks the agent
//! for a tunnel over the shared control channel, joins the room it gets
//! back and relays. Several listeners may share one control channel.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use roomhub_core::{HubError, HubResult, TunnelResponse};

use crate::agent::policy::split_host_port;
use crate::control::{ControlChannel, ControlConfig};
use crate::exit::{ExitHook, ProcessExit};
use crate::relay::{relay, RelayConfig};
use crate::session::HubClient;

/// Port used when a listen address or an RDP destination gives none.
pub const RDP_PORT: u16 = 3389;

/// One local listener and the destination its connections reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub listen: SocketAddr,
    pub destination: String,
}

impl TunnelSpec {
    /// Build a spec, picking a random loopback listen address when none is
    /// given and appending `default_port` to a destination that lacks one.
    pub fn new(listen: Option<SocketAddr>, destination: &str, default_port: Option<u16>) -> Self {
        let destination = match default_port {
            Some(port) => with_default_port(destination, port),
            None => destination.to_string(),
        };
        Self {
            listen: listen.unwrap_or_else(|| random_loopback(RDP_PORT)),
            destination,
        }
    }
}

/// A random address in 127.0.0.0/8: `127.a.b.c` with a, b in [0, 254)
/// and c in [1, 254).
pub fn random_loopback(port: u16) -> SocketAddr {
    let mut rng = rand::thread_rng();
    let ip = Ipv4Addr::new(
        127,
        rng.gen_range(0..254),
        rng.gen_range(0..254),
        rng.gen_range(1..254),
    );
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

/// Append `:port` unless `destination` already carries one.
pub fn with_default_port(destination: &str, port: u16) -> String {
    if split_host_port(destination).is_some() {
        destination.to_string()
    } else if destination.contains(':') && !destination.starts_with('[') {
        format!("[{destination}]:{port}")
    } else {
        format!("{destination}:{port}")
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control room name.
    pub room: String,
    /// Control room password.
    pub password: String,
    pub control: ControlConfig,
    pub relay: RelayConfig,
    /// Terminate the process when a tunnel ends.
    pub exit_on_disconnect: bool,
}

impl ClientConfig {
    pub fn new(room: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            password: password.into(),
            control: ControlConfig::default(),
            relay: RelayConfig::default(),
            exit_on_disconnect: false,
        }
    }
}

struct ClientContext {
    client: HubClient,
    control: ControlChannel,
    config: ClientConfig,
    exit: Arc<dyn ExitHook>,
}

/// A joined client with its listeners bound.
pub struct ClientRole {
    ctx: Arc<ClientContext>,
    listeners: Vec<(TcpListener, TunnelSpec)>,
}

impl ClientRole {
    /// Join the control room and bind every listener.
    pub async fn start(
        client: HubClient,
        config: ClientConfig,
        tunnels: Vec<TunnelSpec>,
    ) -> HubResult<Self> {
        if tunnels.is_empty() {
            return Err(HubError::Config("no tunnel to serve".into()));
        }

        let mut listeners = Vec::with_capacity(tunnels.len());
        for spec in tunnels {
            let listener = TcpListener::bind(spec.listen).await.map_err(|e| {
                HubError::Transport(format!("failed to listen on {}: {e}", spec.listen))
            })?;
            let spec = TunnelSpec {
                listen: listener.local_addr()?,
                destination: spec.destination,
            };
            info!(listen = %spec.listen, destination = %spec.destination, "listening");
            listeners.push((listener, spec));
        }

        let control = ControlChannel::open(
            client.clone(),
            &config.room,
            &config.password,
            config.control.clone(),
        )
        .await?;

        Ok(Self {
            ctx: Arc::new(ClientContext {
                client,
                control,
                config,
                exit: Arc::new(ProcessExit),
            }),
            listeners,
        })
    }

    /// Replace the process-exit hook.
    pub fn with_exit_hook(mut self, hook: Arc<dyn ExitHook>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.exit = hook;
        }
        self
    }

    /// The bound tunnels (useful when a listen port was 0).
    pub fn tunnels(&self) -> Vec<TunnelSpec> {
        self.listeners.iter().map(|(_, spec)| spec.clone()).collect()
    }

    /// Accept and tunnel connections until the control channel is lost.
    pub async fn run(self) -> HubResult<()> {
        let accept_loops: Vec<JoinHandle<()>> = self
            .listeners
            .into_iter()
            .map(|(listener, spec)| tokio::spawn(accept_loop(self.ctx.clone(), listener, spec)))
            .collect();

        let fatal = self.ctx.control.closed().await;
        for task in accept_loops {
            task.abort();
        }
        Err(fatal)
    }
}

async fn accept_loop(ctx: Arc<ClientContext>, listener: TcpListener, spec: TunnelSpec) {
    let destination: Arc<str> = Arc::from(spec.destination.as_str());
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(ctx.clone(), stream, peer, destination.clone()));
            }
            Err(e) => {
                warn!(listen = %spec.listen, error = %e, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(
    ctx: Arc<ClientContext>,
    stream: TcpStream,
    peer: SocketAddr,
    destination: Arc<str>,
) {
    info!(peer = %peer, destination = %destination, "got connection");

    let (room, password) = match ctx.control.request_tunnel(&destination).await {
        Ok(TunnelResponse::Created { room, password }) => (room, password),
        Ok(TunnelResponse::Failed { cause }) => {
            let e = HubError::TunnelRejected(cause);
            warn!(peer = %peer, error = %e, "closing connection");
            return;
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "tunnel request failed");
            return;
        }
    };
    debug!(peer = %peer, room = %room, "tunnel room created");

    let session = match ctx.client.join(&room, &password).await {
        Ok(session) => session,
        Err(e) => {
            warn!(peer = %peer, room = %room, error = %e, "failed to join tunnel room");
            return;
        }
    };
    // Tell the agent we are in the room; an empty frame carries no bytes.
    if let Err(e) = session.send_frame(&[]).await {
        warn!(peer = %peer, room = %room, error = %e, "tunnel room unusable");
        let _ = session.close().await;
        return;
    }

    info!(peer = %peer, room = %room, "joined tunnel room, relaying");
    let report = relay(stream, session, &ctx.config.relay).await;
    info!(
        peer = %peer,
        room = %report.room,
        sent = report.stream_to_session,
        received = report.session_to_stream,
        "tunnel closed"
    );

    if ctx.config.exit_on_disconnect {
        ctx.exit.exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_loopback_is_in_range() {
        for _ in 0..1000 {
            let addr = random_loopback(RDP_PORT);
            match addr {
                SocketAddr::V4(v4) => {
                    let [a, b, c, d] = v4.ip().octets();
                    assert_eq!(a, 127);
                    assert!(b < 254);
                    assert!(c < 254);
                    assert!((1..254).contains(&d));
                    assert_eq!(v4.port(), 3389);
                }
                SocketAddr::V6(_) => panic!("expected IPv4"),
            }
        }
    }

    #[test]
    fn default_port_is_added_only_when_missing() {
        assert_eq!(with_default_port("desk.lab", 3389), "desk.lab:3389");
        assert_eq!(with_default_port("desk.lab:3390", 3389), "desk.lab:3390");
        assert_eq!(with_default_port("fe80::1", 3389), "[fe80::1]:3389");
        assert_eq!(with_default_port("[fe80::1]:22", 3389), "[fe80::1]:22");
    }

    #[test]
    fn spec_defaults() {
        let spec = TunnelSpec::new(None, "desk.lab", Some(RDP_PORT));
        assert_eq!(spec.destination, "desk.lab:3389");
        assert!(spec.listen.ip().is_loopback());

        let listen: SocketAddr = "127.0.0.2:8080".parse().unwrap();
        let spec = TunnelSpec::new(Some(listen), "web:80", None);
        assert_eq!(spec.listen, listen);
        assert_eq!(spec.destination, "web:80");
    }

    #[tokio::test]
    async fn start_without_tunnels_is_config_error() {
        let client = HubClient::new("ws://127.0.0.1:9/hub", "t");
        let err = ClientRole::start(client, ClientConfig::new("c", "p"), Vec::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Config(_)));
    }
}
