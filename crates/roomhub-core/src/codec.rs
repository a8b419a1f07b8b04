//! JSON text codec for structured hub messages.
//!
//! Structured messages travel as one JSON object per WebSocket text frame.

use crate::error::HubResult;

/// Encode a serializable value as a JSON text payload.
pub fn encode_message<T: serde::Serialize>(value: &T) -> HubResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON payload (text or binary frame contents) into a typed value.
pub fn decode_message<T: serde::de::DeserializeOwned>(data: &[u8]) -> HubResult<T> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use crate::messages::{ControlMessage, JoinResponse, JoinStatus};

    #[test]
    fn decodes_what_it_encodes() {
        let text = encode_message(&ControlMessage::failed("id", "nope")).unwrap();
        let msg: ControlMessage = decode_message(text.as_bytes()).unwrap();
        assert_eq!(msg.refid(), "id");
    }

    #[test]
    fn wrong_shape_is_codec_error() {
        let err = decode_message::<JoinResponse>(br#"{"type":"createTunnel"}"#).unwrap_err();
        assert!(matches!(err, HubError::Codec(_)));
    }

    #[test]
    fn join_response_from_peer_without_cause() {
        let resp: JoinResponse = decode_message(br#"{"type":"joined","success":true}"#).unwrap();
        assert_eq!(resp.status, JoinStatus::Joined);
        assert!(resp.cause.is_empty());
    }
}
