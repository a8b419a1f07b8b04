//! roomhub-client: agent and client roles for roomhub.
//!
//! Both roles reach a rendezvous hub over WebSocket, meet in a shared
//! control room, and negotiate one private room per TCP connection. Bytes
//! are then relayed between the local TCP stream and that room.
//!
//! # Quick Start
//!
//! ```no_run
//! use roomhub_client::{ClientConfig, ClientRole, HubClient, TunnelSpec};
//!
//! # async fn example() -> roomhub_core::HubResult<()> {
//! let hub = HubClient::new("wss://hub.example.com/hub", "shared-token");
//! let tunnel = TunnelSpec::new(None, "desktop.lab", Some(3389));
//! let role = ClientRole::start(hub, ClientConfig::new("control room", "pw"), vec![tunnel]).await?;
//! role.run().await
//! # }
//! ```

pub mod agent;
pub mod client;
pub mod control;
pub mod exit;
pub mod relay;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use agent::{AgentConfig, AgentRole, DestinationPolicy};
pub use client::{ClientConfig, ClientRole, TunnelSpec};
pub use control::{ControlChannel, ControlConfig};
pub use exit::{ExitHook, ProcessExit};
pub use relay::{relay, Direction, RelayConfig, RelayReport};
pub use session::{
    ConnectConfig, HubClient, RendezvousSession, SessionReceiver, SessionSender, SessionState,
};
pub use transport::ProxyMode;

pub use roomhub_core::{HubError, HubResult};
