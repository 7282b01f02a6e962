//! Message codec: envelopes to and from single-line JSON frames.
//!
//! Every envelope is serialized as one compact JSON document. The transport
//! terminates each document with `\n`, so a frame is exactly one envelope
//! regardless of how TCP splits or coalesces the bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::message::{Envelope, Message, MessageType};

/// The envelope as it appears on the wire. `payload` is JSON text whose
/// shape depends on `type`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    /// Variant name, or a legacy numeric index.
    #[serde(rename = "type")]
    kind: serde_json::Value,
    #[serde(default)]
    sender_id: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

fn parse_kind(kind: &serde_json::Value) -> Option<MessageType> {
    match kind {
        serde_json::Value::String(name) => MessageType::from_name(name),
        serde_json::Value::Number(n) => n.as_u64().and_then(MessageType::from_index),
        _ => None,
    }
}

/// Serialize an envelope into one frame (without the trailing newline).
pub fn encode(envelope: &Envelope) -> Result<String, NetworkError> {
    let wire = WireEnvelope {
        kind: serde_json::Value::String(envelope.message_type().as_str().to_string()),
        sender_id: envelope.sender_id.clone(),
        timestamp: envelope.timestamp,
        payload: Some(envelope.message.payload_json()?),
        signature: envelope.signature.clone(),
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Build and serialize an envelope for `message` from `sender_id`.
pub fn encode_message(sender_id: &str, message: Message) -> Result<String, NetworkError> {
    encode(&Envelope::new(sender_id, message))
}

/// Decode one frame, reporting why it was rejected.
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected, so a
/// bad text field costs at most that one message. A well-formed envelope
/// whose `type` this node does not know yields [`NetworkError::UnknownType`],
/// so the caller can still credit the sender.
pub fn decode(frame: &[u8]) -> Result<Envelope, NetworkError> {
    let text = String::from_utf8_lossy(frame);
    let wire: WireEnvelope = serde_json::from_str(text.trim())?;
    let kind = parse_kind(&wire.kind).ok_or_else(|| NetworkError::UnknownType(wire.kind.to_string()))?;
    let payload = wire.payload.unwrap_or_default();
    let message = Message::from_payload(kind, &payload)
        .map_err(|e| NetworkError::Decode(format!("bad {kind} payload: {e}")))?;

    Ok(Envelope {
        sender_id: wire.sender_id,
        timestamp: wire.timestamp,
        message,
        signature: wire.signature,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PriceFact, SyncQuery};

    #[test]
    fn test_encode_is_single_line() {
        let mut fact = PriceFact::new("Milk 2L", "Test Store", 3.20);
        fact.sale_description = Some("line one\nline two".into());
        let frame = encode_message("node_a", Message::PriceShare(fact)).unwrap();
        assert!(!frame.contains('\n'));
        assert!(frame.contains("\"type\":\"PriceShare\""));
        assert!(frame.contains("\"senderId\":\"node_a\""));
    }

    #[test]
    fn test_payload_is_string_on_wire() {
        let frame =
            encode_message("node_a", Message::PriceShare(PriceFact::new("Eggs", "Aldi", 4.0)))
                .unwrap();
        let raw: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert!(raw["payload"].is_string());
        let inner: serde_json::Value =
            serde_json::from_str(raw["payload"].as_str().unwrap()).unwrap();
        assert_eq!(inner["itemName"], "Eggs");
    }

    #[test]
    fn test_decode_price_share() {
        let frame = r#"{"type":"PriceShare","senderId":"peer-x","timestamp":"2026-01-05T10:00:00Z","payload":"{\"itemName\":\"Milk 2L\",\"storeName\":\"Test Store\",\"price\":3.20}"}"#;
        let envelope = decode(frame.as_bytes()).unwrap();
        assert_eq!(envelope.sender_id, "peer-x");
        match envelope.message {
            Message::PriceShare(fact) => {
                assert_eq!(fact.item_name, "Milk 2L");
                assert!((fact.price - 3.20).abs() < f64::EPSILON);
            }
            other => panic!("Expected PriceShare, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_legacy_numeric_type() {
        let frame = r#"{"type":6,"senderId":"old-node","payload":"{}"}"#;
        let envelope = decode(frame.as_bytes()).unwrap();
        assert_eq!(envelope.message_type(), MessageType::Heartbeat);
    }

    #[test]
    fn test_decode_sync_request() {
        let query = SyncQuery {
            since: Utc::now(),
            region: Some("NSW".into()),
            categories: None,
            chains: Some(vec!["Coles".into()]),
        };
        let frame = encode_message("a", Message::SyncRequest(query.clone())).unwrap();
        let envelope = decode(frame.as_bytes()).unwrap();
        assert_eq!(envelope.message, Message::SyncRequest(query));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not json at all".as_bytes()).is_err());
        assert!(decode("{\"senderId\":\"x\"}".as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = decode(r#"{"type":"Gossip","senderId":"x","payload":"{}"}"#.as_bytes()).unwrap_err();
        assert!(matches!(err, NetworkError::UnknownType(ref kind) if kind.contains("Gossip")));
        let err = decode(r#"{"type":42,"senderId":"x","payload":"{}"}"#.as_bytes()).unwrap_err();
        assert!(matches!(err, NetworkError::UnknownType(_)));
    }

    #[test]
    fn test_decode_replaces_invalid_utf8() {
        let frame = b"{\"type\":\"Heartbeat\",\"senderId\":\"n\xe9\",\"payload\":\"\"}";
        let envelope = decode(frame).unwrap();
        assert_eq!(envelope.sender_id, "n\u{FFFD}");

        let frame = b"{\"type\":\"Heartbeat\",\"payload\":\"\xff\xfe\"}";
        assert!(matches!(decode(frame), Err(NetworkError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        let err = decode(r#"{"type":"PriceShare","senderId":"x","payload":"{\"price\":1}"}"#.as_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("PriceShare"));
    }

    #[test]
    fn test_signature_is_carried_but_not_required() {
        let frame = r#"{"type":"Heartbeat","senderId":"x","payload":"","signature":"sig"}"#;
        let envelope = decode(frame.as_bytes()).unwrap();
        assert_eq!(envelope.signature.as_deref(), Some("sig"));

        let encoded = encode_message("x", Message::Heartbeat(crate::message::HeartbeatPayload::now()))
            .unwrap();
        assert!(!encoded.contains("signature"));
    }
}
