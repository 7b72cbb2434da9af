//! JSON text-frame codec for the hostlink control channel.
//!
//! Wire format: one JSON object per WebSocket text frame.

use crate::error::{LinkError, LinkResult};
use crate::messages::Envelope;

/// Encode an envelope into a text frame.
pub fn encode_frame(envelope: &Envelope) -> LinkResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a text frame into an envelope.
///
/// Anything that is not a JSON object carrying a string `type` is a
/// [`LinkError::MessageParse`].
pub fn decode_frame(text: &str) -> LinkResult<Envelope> {
    serde_json::from_str::<Envelope>(text).map_err(|e| LinkError::MessageParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_minimal() {
        let env = decode_frame(r#"{"type":"ping","requestId":"1"}"#).unwrap();
        assert_eq!(env.msg_type, "ping");
        assert_eq!(env.request_id, "1");
        assert!(env.payload.is_empty());
    }

    #[test]
    fn decode_without_request_id() {
        let env = decode_frame(r#"{"type":"port.status"}"#).unwrap();
        assert_eq!(env.request_id, "");
    }

    #[test]
    fn decode_keeps_extra_fields() {
        let env = decode_frame(r#"{"type":"fs.list","requestId":"9","path":"/x","deep":true}"#)
            .unwrap();
        assert_eq!(env.payload["path"], json!("/x"));
        assert_eq!(env.payload["deep"], json!(true));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            decode_frame("{not json"),
            Err(LinkError::MessageParse(_))
        ));
    }

    #[test]
    fn missing_type_is_parse_error() {
        assert!(matches!(
            decode_frame(r#"{"requestId":"1"}"#),
            Err(LinkError::MessageParse(_))
        ));
    }

    #[test]
    fn non_object_is_parse_error() {
        assert!(decode_frame("[1,2,3]").is_err());
        assert!(decode_frame("\"ping\"").is_err());
    }

    #[test]
    fn encode_then_decode() {
        let env = Envelope::reply("pong", "r-7", json!({"ok": true}));
        let text = encode_frame(&env).unwrap();
        assert_eq!(decode_frame(&text).unwrap(), env);
    }
}
