//! Agent role.
//!
//! Sits on the private network, joins the control room and serves tunnel
//! requests: for each one it opens a fresh room, dials the destination and
//! relays between the two. Every request runs on its own task.

pub mod dial;
pub mod policy;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use roomhub_core::{fresh_id, ControlMessage, HubError, HubResult, TunnelRequest};

use crate::control::{ControlChannel, ControlConfig};
use crate::exit::{ExitHook, ProcessExit};
use crate::relay::{relay, RelayConfig};
use crate::session::HubClient;

pub use policy::{DestinationPolicy, PolicyEnforcer, Refusal};

pub const CAUSE_ROOM_FAILED: &str = "failed to create room for tunnel";
pub const CAUSE_RESOLVE_FAILED: &str = "failed to resolve destination address";
pub const CAUSE_DIAL_FAILED: &str = "failed to dial destination";
pub const CAUSE_NOT_ALLOWED: &str = "destination not allowed";
pub const CAUSE_TOO_MANY_TUNNELS: &str = "too many active tunnels";

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control room name.
    pub room: String,
    /// Control room password.
    pub password: String,
    pub control: ControlConfig,
    pub relay: RelayConfig,
    pub policy: DestinationPolicy,
    /// Limit on dialing a destination.
    pub dial_timeout: Duration,
    /// How long a fresh tunnel waits for the client to show up.
    pub peer_timeout: Duration,
    /// Terminate the process when a tunnel ends.
    pub exit_on_disconnect: bool,
}

impl AgentConfig {
    pub fn new(room: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            password: password.into(),
            control: ControlConfig::default(),
            relay: RelayConfig::default(),
            policy: DestinationPolicy::default(),
            dial_timeout: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(30),
            exit_on_disconnect: false,
        }
    }
}

struct AgentContext {
    client: HubClient,
    control: Arc<ControlChannel>,
    config: AgentConfig,
    policy: PolicyEnforcer,
    exit: Arc<dyn ExitHook>,
}

impl AgentContext {
    async fn refuse(&self, refid: &str, cause: &str) {
        if let Err(e) = self.control.respond(&ControlMessage::failed(refid, cause)).await {
            warn!(refid = %refid, error = %e, "failed to send tunnelCreationFailed");
        }
    }

    fn tunnel_ended(&self) {
        if self.config.exit_on_disconnect {
            self.exit.exit(0);
        }
    }
}

/// A joined agent, ready to serve.
pub struct AgentRole {
    ctx: Arc<AgentContext>,
    requests: tokio::sync::mpsc::Receiver<TunnelRequest>,
}

impl AgentRole {
    /// Join the control room.
    pub async fn start(client: HubClient, config: AgentConfig) -> HubResult<Self> {
        let (control, requests) = ControlChannel::open_with_requests(
            client.clone(),
            &config.room,
            &config.password,
            config.control.clone(),
        )
        .await?;

        info!(room = %config.room, hub = %client.url(), "agent joined control room");
        Ok(Self {
            ctx: Arc::new(AgentContext {
                policy: PolicyEnforcer::new(config.policy.clone()),
                client,
                control: Arc::new(control),
                config,
                exit: Arc::new(ProcessExit),
            }),
            requests,
        })
    }

    /// Replace the process-exit hook.
    pub fn with_exit_hook(mut self, hook: Arc<dyn ExitHook>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.exit = hook;
        }
        self
    }

    /// Serve requests until the control channel is lost for good.
    pub async fn run(mut self) -> HubResult<()> {
        while let Some(request) = self.requests.recv().await {
            tokio::spawn(serve_request(self.ctx.clone(), request));
        }
        Err(self.ctx.control.closed().await)
    }
}

async fn serve_request(ctx: Arc<AgentContext>, request: TunnelRequest) {
    let TunnelRequest { destination, refid } = request;
    info!(refid = %refid, destination = %destination, "tunnel requested");

    let _slot = match ctx.policy.try_acquire() {
        Ok(slot) => slot,
        Err(_) => {
            warn!(refid = %refid, active = ctx.policy.active_tunnels(), "tunnel limit reached");
            ctx.refuse(&refid, CAUSE_TOO_MANY_TUNNELS).await;
            return;
        }
    };
    if ctx.policy.check(&destination).is_err() {
        let e = HubError::DestinationDenied(destination.clone());
        warn!(refid = %refid, error = %e, "refusing tunnel");
        ctx.refuse(&refid, CAUSE_NOT_ALLOWED).await;
        return;
    }

    let room = fresh_id();
    let password = fresh_id();
    let mut session = match ctx.client.join(&room, &password).await {
        Ok(session) => session,
        Err(e) => {
            warn!(refid = %refid, error = %e, "failed to create room for tunnel");
            ctx.refuse(&refid, CAUSE_ROOM_FAILED).await;
            return;
        }
    };

    let opened = match dial::resolve(&destination).await {
        Ok(addr) => dial::dial(addr, ctx.config.dial_timeout).await,
        Err(e) => Err(e),
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let cause = match e {
                HubError::DestinationResolve(_) => CAUSE_RESOLVE_FAILED,
                _ => CAUSE_DIAL_FAILED,
            };
            warn!(refid = %refid, room = %room, error = %e, "{cause}");
            ctx.refuse(&refid, cause).await;
            let _ = session.close().await;
            ctx.tunnel_ended();
            return;
        }
    };

    let created = ControlMessage::created(refid.as_str(), room.as_str(), password.as_str());
    if let Err(e) = ctx.control.respond(&created).await {
        warn!(refid = %refid, room = %room, error = %e, "failed to send tunnelCreated");
        let _ = session.close().await;
        ctx.tunnel_ended();
        return;
    }
    debug!(refid = %refid, room = %room, "tunnel room ready, waiting for client");

    // Hold the destination's bytes until the client is in the room.
    let first = tokio::time::timeout(ctx.config.peer_timeout, session.recv_frame()).await;
    let greeting = match first {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            warn!(refid = %refid, room = %room, error = %e, "tunnel closed before client joined");
            let _ = session.close().await;
            ctx.tunnel_ended();
            return;
        }
        Err(_) => {
            warn!(refid = %refid, room = %room, "client never joined tunnel room");
            let _ = session.close().await;
            ctx.tunnel_ended();
            return;
        }
    };
    if !greeting.is_empty() {
        if let Err(e) = stream.write_all(&greeting).await {
            warn!(refid = %refid, room = %room, error = %e, "destination write failed");
            let _ = session.close().await;
            ctx.tunnel_ended();
            return;
        }
    }

    info!(refid = %refid, room = %room, destination = %destination, "relaying");
    let report = relay(stream, session, &ctx.config.relay).await;
    info!(
        refid = %refid,
        room = %report.room,
        sent = report.stream_to_session,
        received = report.session_to_stream,
        "tunnel closed"
    );
    ctx.tunnel_ended();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::start_hub;
    use roomhub_core::TunnelResponse;

    fn config() -> AgentConfig {
        let mut config = AgentConfig::new("ctrl", "pw");
        config.control.request_timeout = Duration::from_secs(5);
        config
    }

    async fn request(hub: &crate::testutil::TestHub, destination: &str) -> TunnelResponse {
        let control = ControlChannel::open(hub.client(), "ctrl", "pw", config().control)
            .await
            .unwrap();
        control.request_tunnel(destination).await.unwrap()
    }

    #[tokio::test]
    async fn unresolvable_destination_reports_cause() {
        let hub = start_hub().await;
        let agent = AgentRole::start(hub.client(), config()).await.unwrap();
        tokio::spawn(agent.run());

        let response = request(&hub, "no-such-host.invalid:80").await;
        assert_eq!(
            response,
            TunnelResponse::Failed {
                cause: CAUSE_RESOLVE_FAILED.into()
            }
        );
    }

    #[tokio::test]
    async fn refused_dial_reports_cause() {
        let hub = start_hub().await;
        let agent = AgentRole::start(hub.client(), config()).await.unwrap();
        tokio::spawn(agent.run());

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let response = request(&hub, &addr.to_string()).await;
        assert_eq!(
            response,
            TunnelResponse::Failed {
                cause: CAUSE_DIAL_FAILED.into()
            }
        );
    }

    #[tokio::test]
    async fn disallowed_destination_reports_cause() {
        let hub = start_hub().await;
        let mut cfg = config();
        cfg.policy.allowed_destinations = vec!["allowed.lab".into()];
        let agent = AgentRole::start(hub.client(), cfg).await.unwrap();
        tokio::spawn(agent.run());

        let response = request(&hub, "127.0.0.1:22").await;
        assert_eq!(
            response,
            TunnelResponse::Failed {
                cause: CAUSE_NOT_ALLOWED.into()
            }
        );
    }

    #[tokio::test]
    async fn zero_capacity_reports_too_many() {
        let hub = start_hub().await;
        let mut cfg = config();
        cfg.policy.max_tunnels = 0;
        let agent = AgentRole::start(hub.client(), cfg).await.unwrap();
        tokio::spawn(agent.run());

        let response = request(&hub, "127.0.0.1:22").await;
        assert_eq!(
            response,
            TunnelResponse::Failed {
                cause: CAUSE_TOO_MANY_TUNNELS.into()
            }
        );
    }

    #[tokio::test]
    async fn created_tunnel_room_is_joinable() {
        let hub = start_hub().await;
        let agent = AgentRole::start(hub.client(), config()).await.unwrap();
        tokio::spawn(agent.run());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        match request(&hub, &addr.to_string()).await {
            TunnelResponse::Created { room, password } => {
                assert_eq!(room.len(), 32);
                assert_eq!(hub.registry.participant_count(&room).await, Some(1));
                let session = hub.client().join(&room, &password).await.unwrap();
                assert_eq!(hub.registry.participant_count(&room).await, Some(2));
                session.close().await.unwrap();
            }
            other => panic!("expected a tunnel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absent_client_times_out_and_tunnel_is_torn_down() {
        use tokio::io::AsyncReadExt;

        let hub = start_hub().await;
        let mut cfg = config();
        cfg.peer_timeout = Duration::from_millis(200);
        let agent = AgentRole::start(hub.client(), cfg).await.unwrap();
        tokio::spawn(agent.run());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let room = match request(&hub, &addr.to_string()).await {
            TunnelResponse::Created { room, .. } => room,
            other => panic!("expected a tunnel, got {other:?}"),
        };
        let (mut dialed, _) = listener.accept().await.unwrap();

        // Nobody joins: the agent gives up, leaves the room and hangs up.
        hub.wait_room_gone(&room).await;
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), dialed.read_to_end(&mut rest))
            .await
            .expect("destination connection left open")
            .unwrap();
        assert_eq!(n, 0);
    }
}
