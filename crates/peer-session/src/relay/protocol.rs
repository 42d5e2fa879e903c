//! Relay signaling protocol types
//!
//! JSON frames exchanged with a PeerJS-compatible relay server. Every frame
//! carries a `type`; routed frames add `src`/`dst` and a `payload`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection type announced in offers for media calls
pub const MEDIA_CONNECTION_TYPE: &str = "media";

/// Prefix of media connection ids
pub const MEDIA_CONNECTION_PREFIX: &str = "mc_";

/// Frame type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Relay accepted the id
    Open,
    /// Relay server error
    Error,
    /// Requested id already registered
    IdTaken,
    /// Relay key rejected
    InvalidKey,
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickle ICE candidate
    Candidate,
    /// Remote peer left
    Leave,
    /// Message to an unknown peer expired
    Expire,
    /// Keepalive
    Heartbeat,
    /// Unrecognized frame type
    Unknown(String),
}

impl MessageType {
    /// Wire name
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Open => "OPEN",
            MessageType::Error => "ERROR",
            MessageType::IdTaken => "ID-TAKEN",
            MessageType::InvalidKey => "INVALID-KEY",
            MessageType::Offer => "OFFER",
            MessageType::Answer => "ANSWER",
            MessageType::Candidate => "CANDIDATE",
            MessageType::Leave => "LEAVE",
            MessageType::Expire => "EXPIRE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Unknown(s) => s,
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "OPEN" => MessageType::Open,
            "ERROR" => MessageType::Error,
            "ID-TAKEN" => MessageType::IdTaken,
            "INVALID-KEY" => MessageType::InvalidKey,
            "OFFER" => MessageType::Offer,
            "ANSWER" => MessageType::Answer,
            "CANDIDATE" => MessageType::Candidate,
            "LEAVE" => MessageType::Leave,
            "EXPIRE" => MessageType::Expire,
            "HEARTBEAT" => MessageType::Heartbeat,
            _ => MessageType::Unknown(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayMessage {
    /// Frame type
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Sending peer (set by the relay on routed frames)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    /// Destination peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,

    /// Frame payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl RelayMessage {
    /// Keepalive frame
    pub fn heartbeat() -> Self {
        Self {
            kind: MessageType::Heartbeat,
            src: None,
            dst: None,
            payload: None,
        }
    }

    /// Routed frame to `dst`
    pub fn routed(
        kind: MessageType,
        dst: &str,
        payload: impl Serialize,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            src: None,
            dst: Some(dst.to_string()),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Parse a frame
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Serialize a frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode the payload as `T`
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone().unwrap_or(serde_json::Value::Null))
    }

    /// Error text carried in `payload.msg`, if any
    pub fn error_message(&self) -> Option<String> {
        self.payload_as::<ErrorPayload>().ok().map(|p| p.msg)
    }
}

/// Session description (`{type, sdp}`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    /// `offer` or `answer`
    #[serde(rename = "type")]
    pub sdp_type: String,
    /// SDP body
    pub sdp: String,
}

/// OFFER / ANSWER payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    /// Session description
    pub sdp: SessionDescription,
    /// Connection type (`media`)
    #[serde(rename = "type")]
    pub connection_type: String,
    /// Connection id shared by both ends of a call
    pub connection_id: String,
    /// Opaque caller metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SdpPayload {
    /// Media offer payload
    pub fn offer(connection_id: &str, sdp: String) -> Self {
        Self::media("offer", connection_id, sdp)
    }

    /// Media answer payload
    pub fn answer(connection_id: &str, sdp: String) -> Self {
        Self::media("answer", connection_id, sdp)
    }

    fn media(sdp_type: &str, connection_id: &str, sdp: String) -> Self {
        Self {
            sdp: SessionDescription {
                sdp_type: sdp_type.to_string(),
                sdp,
            },
            connection_type: MEDIA_CONNECTION_TYPE.to_string(),
            connection_id: connection_id.to_string(),
            metadata: None,
        }
    }
}

/// ICE candidate as sent over the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// CANDIDATE payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    /// Candidate
    pub candidate: IceCandidate,
    /// Connection type (`media`)
    #[serde(rename = "type")]
    pub connection_type: String,
    /// Connection id
    pub connection_id: String,
}

/// ERROR / ID-TAKEN / INVALID-KEY payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    /// Error text
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open() {
        let msg = RelayMessage::from_json(r#"{"type":"OPEN"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Open);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn test_parse_id_taken_message() {
        let msg = RelayMessage::from_json(
            r#"{"type":"ID-TAKEN","payload":{"msg":"ID \"room-1\" is taken"}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageType::IdTaken);
        assert_eq!(msg.error_message().unwrap(), "ID \"room-1\" is taken");
    }

    #[test]
    fn test_parse_offer() {
        let text = r#"{
            "type": "OFFER",
            "src": "candidate-7",
            "dst": "room-1",
            "payload": {
                "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                "type": "media",
                "connectionId": "mc_abc",
                "browser": "firefox"
            }
        }"#;
        let msg = RelayMessage::from_json(text).unwrap();
        assert_eq!(msg.kind, MessageType::Offer);
        assert_eq!(msg.src.as_deref(), Some("candidate-7"));

        let payload: SdpPayload = msg.payload_as().unwrap();
        assert_eq!(payload.connection_id, "mc_abc");
        assert_eq!(payload.connection_type, MEDIA_CONNECTION_TYPE);
        assert_eq!(payload.sdp.sdp_type, "offer");
    }

    #[test]
    fn test_candidate_wire_names() {
        let payload = CandidatePayload {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            connection_type: MEDIA_CONNECTION_TYPE.into(),
            connection_id: "mc_abc".into(),
        };
        let msg = RelayMessage::routed(MessageType::Candidate, "room-1", &payload).unwrap();
        let json = msg.to_json().unwrap();

        assert!(json.contains(r#""type":"CANDIDATE""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(json.contains(r#""connectionId":"mc_abc""#));
        assert!(!json.contains("src"));
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let msg = RelayMessage::from_json(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown("PING".into()));
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"PING"}"#);
    }

    #[test]
    fn test_heartbeat_frame() {
        assert_eq!(
            RelayMessage::heartbeat().to_json().unwrap(),
            r#"{"type":"HEARTBEAT"}"#
        );
    }
}
