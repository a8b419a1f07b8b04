//! roomhub-core: shared protocol library for the room hub.
//!
//! Provides the typed JSON envelopes exchanged with the hub and between
//! agent and client, the text codec, correlation/room id generation, link
//! close classification, and the common error type.

pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode_message, encode_message};
pub use error::{HubError, HubResult};
pub use ids::{fresh_id, RefId};
pub use messages::{
    ControlMessage, HubRequest, JoinResponse, JoinStatus, TunnelCreated, TunnelFailed,
    TunnelRequest, TunnelResponse,
};
pub use transport::CloseReason;

/// Header carrying the shared bearer token on the WebSocket upgrade request.
pub const TOKEN_HEADER: &str = "x-token";

/// Default path of the hub endpoint.
pub const DEFAULT_HUB_PATH: &str = "/hub";
