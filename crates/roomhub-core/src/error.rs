use thiserror::Error;

use crate::transport::CloseReason;

/// Errors produced by the roomhub protocol layer.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid password for room {room}")]
    RoomPasswordMismatch { room: String },

    #[error("could not enter room. cause: {0}")]
    JoinRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed ({0})")]
    Closed(CloseReason),

    #[error("session already closed")]
    AlreadyClosed,

    #[error("failed to resolve destination address {0}")]
    DestinationResolve(String),

    #[error("failed to dial destination {0}")]
    DestinationDial(String),

    #[error("destination not allowed: {0}")]
    DestinationDenied(String),

    #[error("tunnel creation failed: {0}")]
    TunnelRejected(String),

    #[error("no pending request for refid {0}")]
    CorrelationMismatch(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Whether this error is the link ending without a closing handshake.
    ///
    /// The control channel rejoins its room on this condition only.
    pub fn is_abnormal_closure(&self) -> bool {
        matches!(self, HubError::Closed(CloseReason::Abnormal))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Codec(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abnormal_closure_classification() {
        assert!(HubError::Closed(CloseReason::Abnormal).is_abnormal_closure());
        assert!(!HubError::Closed(CloseReason::Normal).is_abnormal_closure());
        assert!(!HubError::Transport("reset".into()).is_abnormal_closure());
        assert!(!HubError::AlreadyClosed.is_abnormal_closure());
    }

    #[test]
    fn json_errors_become_codec_errors() {
        let err: HubError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, HubError::Codec(_)));
    }
}
