// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Frame codec.

use tracing::debug;

use super::{Envelope, ProtocolError};

/// Serializes an envelope into a text frame.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parses a text frame. Malformed input yields an unrecognized envelope
/// carrying the raw text and the parse error instead of failing.
pub fn decode(text: &str) -> Envelope {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Malformed frame ({} bytes): {}", text.len(), e);
            Envelope::unrecognized(text, &e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, StandardMessage};
    use serde_json::json;

    #[test]
    fn test_standard_message_survives_codec() {
        let msg = StandardMessage::text("qq", "k1", "hello");
        let envelope = Envelope::standard(&msg).unwrap();
        let decoded = decode(&encode(&envelope).unwrap());
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.standard_message().unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage() {
        let envelope = decode("not json");
        assert_eq!(envelope.msg_type, MessageType::Unrecognized(String::new()));
        assert_eq!(envelope.payload["raw"], json!("not json"));
        assert!(envelope.payload["error"].as_str().is_some());
    }

    #[test]
    fn test_decode_missing_fields() {
        let envelope = decode(r#"{"msg_id":"m1","type":"sys_std"}"#);
        assert_eq!(envelope.msg_type, MessageType::Unrecognized(String::new()));
    }

    #[test]
    fn test_decode_unknown_type_keeps_id() {
        let envelope = decode(r#"{"ver":1,"msg_id":"m9","type":"sys_reboot","meta":{},"payload":{}}"#);
        assert_eq!(envelope.msg_id, "m9");
        assert_eq!(envelope.msg_type, MessageType::Unrecognized("sys_reboot".into()));
    }

    #[test]
    fn test_decode_defaults_meta_and_payload() {
        let envelope = decode(r#"{"ver":1,"msg_id":"p1","type":"sys_ping"}"#);
        assert_eq!(envelope.msg_type, MessageType::Ping);
        assert!(envelope.meta.is_empty());
        assert_eq!(envelope.payload, json!({}));
    }

    #[test]
    fn test_standard_payload_mismatch() {
        let envelope = decode(r#"{"ver":1,"msg_id":"m1","type":"sys_std","meta":{},"payload":{"x":1}}"#);
        assert_eq!(envelope.msg_type, MessageType::Standard);
        assert!(envelope.standard_message().is_err());
    }
}
