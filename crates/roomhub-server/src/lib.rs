//! roomhub-server: the rendezvous hub.
//!
//! Participants connect over WebSocket, join a password-protected room and
//! have every message they send relayed to the other members of that room.

pub mod config;
pub mod registry;
pub mod server;
pub mod transport;

pub use config::{CliOverrides, ServerConfig};
pub use registry::{Membership, Outbound, ParticipantId, RoomRegistry};
pub use server::HubServer;
