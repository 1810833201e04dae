//! WebSocket wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator. Outbound frames
//! also carry `"v": PROTOCOL_VERSION`; inbound frames without `v` are treated
//! as version 1.

use crate::error::{Error, Result};
use crate::models::WireMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: u64 = 1;

/// Opaque WebRTC signaling body. Only the routing fields are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
    End,
}

/// A signaling frame handed untouched to the call subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub kind: SignalKind,
    pub payload: SignalPayload,
}

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Auth {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    },
    Message(WireMessage),
    GroupMessage(WireMessage),
    Typing {
        sender: String,
        #[serde(default)]
        receiver: Option<String>,
    },
    GroupTyping {
        group_id: String,
        sender: String,
    },
    Notification {
        #[serde(default)]
        message: Option<String>,
    },
    ContactRequestAccepted {
        #[serde(default)]
        uid: Option<String>,
    },
    ProfilePictureUpdate {
        uid: String,
        #[serde(default, alias = "profileImage")]
        profile_image: Option<String>,
        #[serde(default, alias = "username")]
        display_name: Option<String>,
    },
    NameChange {
        uid: String,
        #[serde(alias = "username")]
        display_name: String,
    },
    WebrtcOffer(SignalPayload),
    WebrtcAnswer(SignalPayload),
    WebrtcIce(SignalPayload),
    WebrtcEnd(SignalPayload),
}

impl ServerEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerEvent::Auth { .. } => "auth",
            ServerEvent::Message(_) => "message",
            ServerEvent::GroupMessage(_) => "group_message",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::GroupTyping { .. } => "group_typing",
            ServerEvent::Notification { .. } => "notification",
            ServerEvent::ContactRequestAccepted { .. } => "contact_request_accepted",
            ServerEvent::ProfilePictureUpdate { .. } => "profile_picture_update",
            ServerEvent::NameChange { .. } => "name_change",
            ServerEvent::WebrtcOffer(_) => "webrtc_offer",
            ServerEvent::WebrtcAnswer(_) => "webrtc_answer",
            ServerEvent::WebrtcIce(_) => "webrtc_ice",
            ServerEvent::WebrtcEnd(_) => "webrtc_end",
        }
    }
}

/// Parses one text frame. Anything that is not a known, well-formed event is
/// an `Error::Protocol`.
pub fn decode(text: &str) -> Result<ServerEvent> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("invalid JSON: {}", e)))?;

    let obj = value
        .as_object_mut()
        .ok_or_else(|| Error::Protocol("frame is not a JSON object".into()))?;

    let version = match obj.remove("v") {
        None => PROTOCOL_VERSION,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| Error::Protocol(format!("invalid protocol version: {}", v)))?,
    };
    if version > PROTOCOL_VERSION {
        tracing::warn!(version, "Frame from newer protocol version, parsing best-effort");
    }
    if !obj.contains_key("type") {
        return Err(Error::Protocol("frame without type".into()));
    }

    serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth { token: String },
    Message(WireMessage),
    GroupMessage(WireMessage),
    Typing { sender: String, receiver: String },
    GroupTyping { group_id: String, sender: String },
    WebrtcOffer(SignalPayload),
    WebrtcAnswer(SignalPayload),
    WebrtcIce(SignalPayload),
    WebrtcEnd(SignalPayload),
}

impl ClientFrame {
    pub fn signal(kind: SignalKind, payload: SignalPayload) -> Self {
        match kind {
            SignalKind::Offer => ClientFrame::WebrtcOffer(payload),
            SignalKind::Answer => ClientFrame::WebrtcAnswer(payload),
            SignalKind::Ice => ClientFrame::WebrtcIce(payload),
            SignalKind::End => ClientFrame::WebrtcEnd(payload),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("v".to_string(), Value::from(PROTOCOL_VERSION));
        }
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_direct_message() {
        let event = decode(
            r#"{"type":"message","sender":"bob","receiver":"alice","message":"hi","timestamp":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        match event {
            ServerEvent::Message(w) => {
                assert_eq!(w.sender, "bob");
                assert_eq!(w.message, "hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_strips_version_field() {
        let event = decode(r#"{"v":1,"type":"group_typing","group_id":"g1","sender":"bob"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::GroupTyping { group_id: "g1".into(), sender: "bob".into() }
        );
    }

    #[test]
    fn test_decode_newer_version_is_best_effort() {
        let event = decode(r#"{"v":7,"type":"notification","extra":true}"#).unwrap();
        assert_eq!(event.type_name(), "notification");
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(decode("not json"), Err(Error::Protocol(_))));
        assert!(matches!(decode("[1,2]"), Err(Error::Protocol(_))));
        assert!(matches!(decode(r#"{"sender":"bob"}"#), Err(Error::Protocol(_))));
        assert!(matches!(decode(r#"{"type":"presence"}"#), Err(Error::Protocol(_))));
        assert!(matches!(decode(r#"{"type":"typing"}"#), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_signal_payload_is_kept_opaque() {
        let event = decode(r#"{"type":"webrtc_ice","sender":"bob","candidate":{"sdpMid":"0"}}"#).unwrap();
        match event {
            ServerEvent::WebrtcIce(p) => {
                assert_eq!(p.sender.as_deref(), Some("bob"));
                assert_eq!(p.data["candidate"], json!({"sdpMid": "0"}));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_encode_adds_type_and_version() {
        let frame = ClientFrame::Auth { token: "t0k".into() };
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "auth", "token": "t0k", "v": 1}));
    }

    #[test]
    fn test_encode_signal_flattens_payload() {
        let mut data = Map::new();
        data.insert("sdp".into(), json!("v=0"));
        let frame = ClientFrame::signal(
            SignalKind::Offer,
            SignalPayload { sender: Some("alice".into()), target: Some("bob".into()), data },
        );
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "webrtc_offer");
        assert_eq!(value["sdp"], "v=0");
        assert_eq!(value["target"], "bob");
    }
}
