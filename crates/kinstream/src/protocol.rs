// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-channel wire codec.
//!
//! A control message is a short multipart frame: a single tag byte,
//! optionally followed by one UTF-8 JSON part:
//!
//! ```text
//! +-----------+   +-----------+----------------------+
//! | tag (1B)  |   | tag (1B)  | UTF-8 JSON document  |
//! +-----------+   +-----------+----------------------+
//!   no payload          with payload
//! ```
//!
//! Messages with zero parts or more than two parts are malformed, as are
//! multi-byte tag parts and payloads that are not valid JSON. Peers answer
//! malformed requests with an `error` reply carrying code 400 rather than
//! dropping them, so the request socket always re-enables sends.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::Message;

/// Control protocol version carried in every `me` payload.
///
/// A client that receives any other version must treat the session as
/// broken and disconnect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error-reply code for unknown or malformed requests.
pub const BAD_REQUEST: u32 = 400;

// ============================================================================
// Message tags
// ============================================================================

/// Closed enumeration of control message tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Error reply, payload `{ "code": u32, "reason": string }`.
    Error = 0x00,
    /// Liveness probe, no payload.
    Ping = 0x01,
    /// Reply to [`MessageType::Ping`], no payload.
    Pong = 0x02,
    /// Identity query, no payload.
    Who = 0x03,
    /// Reply to [`MessageType::Who`], payload is a [`ServerIdentity`].
    Me = 0x04,
}

impl MessageType {
    /// Decode a tag byte. Unknown bytes are not representable; the server
    /// answers them with an `error` reply instead.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(MessageType::Error),
            0x01 => Some(MessageType::Ping),
            0x02 => Some(MessageType::Pong),
            0x03 => Some(MessageType::Who),
            0x04 => Some(MessageType::Me),
            _ => None,
        }
    }

    /// The single-byte wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Who => "who",
            MessageType::Me => "me",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Endpoint types
// ============================================================================

/// Endpoints a server exposes, keyed by name on the wire.
///
/// The set is closed today but extensible on the wire: unknown endpoint-type
/// strings in a `me` payload are silently skipped by receivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointType {
    /// Request/reply socket answering `ping` and `who`.
    Control,
    /// Per-device publish socket carrying compressed depth frames.
    Depth,
}

impl EndpointType {
    /// Wire name of this endpoint type.
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointType::Control => "control",
            EndpointType::Depth => "depth",
        }
    }

    /// Parse a wire name. Unknown names yield `None` and are skipped.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "control" => Some(EndpointType::Control),
            "depth" => Some(EndpointType::Depth),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Identity payloads
// ============================================================================

/// One device entry in a [`ServerIdentity`].
///
/// `endpoints` maps endpoint-type names to `tcp://host:port` URIs. Unknown
/// keys are preserved on decode and skipped by consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Opaque stable identifier, unique within one server process.
    pub id: String,
    /// Endpoint URIs keyed by endpoint-type name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

/// The `me` payload: a server's identity snapshot.
///
/// Ordered maps keep the encoding deterministic, so two `who` requests
/// against unchanged server state produce byte-identical replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Control protocol version, currently [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Human-readable server name.
    pub name: String,
    /// Server-level endpoint URIs keyed by endpoint-type name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    /// Attached devices.
    #[serde(default)]
    pub devices: Vec<DeviceIdentity>,
}

/// The `error` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Numeric code; [`BAD_REQUEST`] for unknown or malformed requests.
    pub code: u32,
    /// Human-readable reason.
    pub reason: String,
}

impl ErrorPayload {
    /// A 400 reply with the given reason.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ErrorPayload {
            code: BAD_REQUEST,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Encode / parse
// ============================================================================

/// Encode a control message as transport parts.
///
/// `None` payload encodes as a bare tag; `Some` payloads are serialized as a
/// second UTF-8 JSON part.
pub fn encode_message(msg_type: MessageType, payload: Option<&Value>) -> Message {
    match payload {
        None => vec![vec![msg_type.tag()]],
        Some(value) => vec![
            vec![msg_type.tag()],
            serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec()),
        ],
    }
}

/// Encode a control message whose payload is any serializable document.
pub fn encode_payload<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Message> {
    let body = serde_json::to_vec(payload)?;
    Ok(vec![vec![msg_type.tag()], body])
}

/// Parse inbound transport parts into `(type, payload)`.
///
/// Rejects empty messages, messages with more than two parts, tag parts that
/// are not exactly one byte, unknown tag bytes, and payload parts that are
/// not valid JSON.
pub fn parse_message(parts: &[Vec<u8>]) -> Result<(MessageType, Option<Value>)> {
    let (tag_part, payload_part) = match parts {
        [tag] => (tag, None),
        [tag, payload] => (tag, Some(payload)),
        [] => return Err(Error::MalformedMessage("empty message".into())),
        _ => {
            return Err(Error::MalformedMessage(format!(
                "expected 1 or 2 parts, got {}",
                parts.len()
            )))
        }
    };

    if tag_part.len() != 1 {
        return Err(Error::MalformedMessage(format!(
            "tag part must be exactly 1 byte, got {}",
            tag_part.len()
        )));
    }

    let msg_type = MessageType::from_tag(tag_part[0]).ok_or_else(|| {
        Error::MalformedMessage(format!("unknown message tag 0x{:02x}", tag_part[0]))
    })?;

    let payload = match payload_part {
        None => None,
        Some(body) => {
            let value: Value = serde_json::from_slice(body)?;
            if value.is_null() {
                None
            } else {
                Some(value)
            }
        }
    };

    Ok((msg_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_no_payload() {
        for t in [MessageType::Ping, MessageType::Pong, MessageType::Who] {
            let parts = encode_message(t, None);
            assert_eq!(parts.len(), 1);
            let (back, payload) = parse_message(&parts).unwrap();
            assert_eq!(back, t);
            assert!(payload.is_none());
        }
    }

    #[test]
    fn test_roundtrip_with_payload() {
        let payload = json!({ "code": 400, "reason": "nope" });
        let parts = encode_message(MessageType::Error, Some(&payload));
        assert_eq!(parts.len(), 2);
        let (t, back) = parse_message(&parts).unwrap();
        assert_eq!(t, MessageType::Error);
        assert_eq!(back, Some(payload));
    }

    #[test]
    fn test_null_payload_is_none() {
        let parts = vec![vec![MessageType::Pong.tag()], b"null".to_vec()];
        let (_, payload) = parse_message(&parts).unwrap();
        assert!(payload.is_none());
    }

    #[test]
    fn test_reject_bad_part_counts() {
        assert!(matches!(
            parse_message(&[]),
            Err(Error::MalformedMessage(_))
        ));
        let three = vec![vec![0x01], b"{}".to_vec(), b"{}".to_vec()];
        assert!(matches!(
            parse_message(&three),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_reject_unknown_tag_and_fat_tag() {
        assert!(matches!(
            parse_message(&[vec![0x7f]]),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            parse_message(&[vec![0x01, 0x02]]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_reject_invalid_json_payload() {
        let parts = vec![vec![MessageType::Me.tag()], b"{not json".to_vec()];
        assert!(matches!(
            parse_message(&parts),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_identity_decode_ignores_unknown_fields() {
        let doc = json!({
            "version": 1,
            "name": "S1",
            "endpoints": { "control": "tcp://10.0.0.1:4000", "future": "tcp://10.0.0.1:9" },
            "devices": [
                { "id": "K1",
                  "endpoints": { "depth": "tcp://10.0.0.1:4001", "ir": "tcp://10.0.0.1:9" },
                  "firmware": "xyz" }
            ],
            "extra_top_level": true
        });
        let identity: ServerIdentity = serde_json::from_value(doc).unwrap();
        assert_eq!(identity.version, 1);
        assert_eq!(identity.name, "S1");
        assert_eq!(identity.devices.len(), 1);
        // Unknown endpoint-type keys survive the decode; consumers skip them.
        assert!(identity.devices[0].endpoints.contains_key("ir"));
        assert!(EndpointType::parse("ir").is_none());
    }

    #[test]
    fn test_identity_encoding_is_deterministic() {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("control".to_string(), "tcp://127.0.0.1:4000".to_string());
        let identity = ServerIdentity {
            version: PROTOCOL_VERSION,
            name: "S1".into(),
            endpoints,
            devices: vec![],
        };
        let a = serde_json::to_vec(&identity).unwrap();
        let b = serde_json::to_vec(&identity).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_endpoint_type_names() {
        assert_eq!(EndpointType::Control.as_str(), "control");
        assert_eq!(EndpointType::parse("depth"), Some(EndpointType::Depth));
        assert_eq!(EndpointType::parse("skeleton"), None);
    }
}
