//! Typed envelopes for the hub join exchange and the tunnel control protocol.
//!
//! Every structured message is a JSON object whose `type` field selects the
//! variant. Relay payloads inside tunnel rooms are raw binary frames and never
//! pass through these types.

use serde::{Deserialize, Serialize};

use crate::ids::{fresh_id, RefId};

/// Cause sent by the hub when the first message is not valid JSON.
pub const CAUSE_PARSE_FAILED: &str = "failed to parse request";
/// Cause sent by the hub when the first message is not a join.
pub const CAUSE_UNKNOWN_TYPE: &str = "unknown request type";
/// Cause sent by the hub when a join presents the wrong room password.
pub const CAUSE_INVALID_PASSWORD: &str = "invalid password";

// ── Hub join exchange ───────────────────────────────────────────────

/// Requests a participant may send to the hub before joining a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubRequest {
    /// Enter (or create) a room.
    Join { room: String, password: String },
}

impl HubRequest {
    /// Parse the first message of a hub connection.
    ///
    /// On failure returns the cause string to report back to the peer.
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|_| CAUSE_PARSE_FAILED)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("join") => serde_json::from_value(value).map_err(|_| CAUSE_PARSE_FAILED),
            Some(_) => Err(CAUSE_UNKNOWN_TYPE),
            None => Err(CAUSE_PARSE_FAILED),
        }
    }
}

/// Outcome tag of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStatus {
    Joined,
    Error,
}

/// Hub reply to a join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(rename = "type")]
    pub status: JoinStatus,
    pub success: bool,
    #[serde(default)]
    pub cause: String,
}

impl JoinResponse {
    pub fn joined() -> Self {
        Self {
            status: JoinStatus::Joined,
            success: true,
            cause: String::new(),
        }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        Self {
            status: JoinStatus::Error,
            success: false,
            cause: cause.into(),
        }
    }
}

// ── Tunnel control protocol ─────────────────────────────────────────

/// Client → agent: open a tunnel to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    /// `host:port` the agent should dial.
    pub destination: String,
    pub refid: RefId,
}

impl TunnelRequest {
    /// Build a request with a freshly minted refid.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            refid: fresh_id(),
        }
    }
}

/// Agent → client: the tunnel room is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCreated {
    pub refid: RefId,
    pub room: String,
    pub password: String,
    #[serde(default = "success_default")]
    pub success: bool,
}

fn success_default() -> bool {
    true
}

/// Agent → client: the tunnel could not be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelFailed {
    pub refid: RefId,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub success: bool,
}

/// Messages exchanged between agent and client over the control room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "createTunnel")]
    CreateTunnel(TunnelRequest),
    #[serde(rename = "tunnelCreated")]
    TunnelCreated(TunnelCreated),
    #[serde(rename = "tunnelCreationFailed")]
    TunnelCreationFailed(TunnelFailed),
}

impl ControlMessage {
    pub fn created(refid: impl Into<RefId>, room: impl Into<String>, password: impl Into<String>) -> Self {
        ControlMessage::TunnelCreated(TunnelCreated {
            refid: refid.into(),
            room: room.into(),
            password: password.into(),
            success: true,
        })
    }

    pub fn failed(refid: impl Into<RefId>, cause: impl Into<String>) -> Self {
        ControlMessage::TunnelCreationFailed(TunnelFailed {
            refid: refid.into(),
            cause: cause.into(),
            success: false,
        })
    }

    /// The correlation id carried by this message.
    pub fn refid(&self) -> &str {
        match self {
            ControlMessage::CreateTunnel(r) => &r.refid,
            ControlMessage::TunnelCreated(c) => &c.refid,
            ControlMessage::TunnelCreationFailed(f) => &f.refid,
        }
    }

    /// Split a response into its refid and outcome. Requests yield `None`.
    pub fn into_response(self) -> Option<(RefId, TunnelResponse)> {
        match self {
            ControlMessage::CreateTunnel(_) => None,
            ControlMessage::TunnelCreated(c) => Some((
                c.refid,
                TunnelResponse::Created {
                    room: c.room,
                    password: c.password,
                },
            )),
            ControlMessage::TunnelCreationFailed(f) => {
                Some((f.refid, TunnelResponse::Failed { cause: f.cause }))
            }
        }
    }
}

/// Outcome of a tunnel request as delivered to the waiting requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelResponse {
    Created { room: String, password: String },
    Failed { cause: String },
}
