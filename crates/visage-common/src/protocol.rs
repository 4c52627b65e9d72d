//! Wire protocol shared with browser peers.
//!
//! Two surfaces are defined here:
//! - the HTTP signaling bodies (`/offer`, `/ice_candidate`), serialized
//!   with the camelCase field names the browser client sends;
//! - the data-channel message vocabulary used for capture control and
//!   one-shot still delivery.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Label of the data channel the peer opens for capture control.
pub const DATA_CHANNEL_LABEL: &str = "faceDetection";

/// Peer -> relay: begin running detection on incoming frames.
pub const MSG_START: &str = "start";

/// Peer -> relay: stop running detection.
pub const MSG_STOP: &str = "stop";

/// Relay -> peer: marker sent immediately before the captured still.
pub const MSG_FACE_DETECTED: &str = "face_detected";

/// A session description exchanged in the offer/answer handshake.
///
/// Matches the browser body `{sdp, type}` verbatim. Answers additionally
/// carry `sessionId`, the address the peer echoes back on trickled
/// candidates; offers never have one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<uuid::Uuid>,
}

/// ICE component, which browsers report as a name and other stacks as a
/// numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceComponent {
    Id(u16),
    Name(String),
}

impl IceComponent {
    /// Numeric component id per the ICE grammar (1 = RTP, 2 = RTCP).
    pub fn id(&self) -> Option<u16> {
        match self {
            IceComponent::Id(n) => Some(*n),
            IceComponent::Name(name) => match name.as_str() {
                "rtp" => Some(1),
                "rtcp" => Some(2),
                _ => None,
            },
        }
    }
}

/// A trickled ICE candidate posted to `/ice_candidate`.
///
/// All fields are optional on the wire; [`IceCandidatePayload::to_candidate_string`]
/// reports which ones a usable candidate actually requires. `session_id` is
/// the explicit session address; when absent the registry falls back to the
/// legacy broadcast behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    #[serde(default)]
    pub component: Option<IceComponent>,
    #[serde(default)]
    pub foundation: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub related_address: Option<String>,
    #[serde(default)]
    pub related_port: Option<u16>,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub tcp_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<uuid::Uuid>,
}

impl IceCandidatePayload {
    /// Rebuild the SDP candidate attribute string from the posted fields.
    ///
    /// Grammar: `candidate:<foundation> <component> <protocol> <priority>
    /// <ip> <port> typ <type> [raddr <addr> rport <port>] [tcptype <t>]`.
    pub fn to_candidate_string(&self) -> crate::Result<String> {
        let foundation = self
            .foundation
            .as_deref()
            .ok_or_else(|| crate::Error::protocol("candidate missing foundation"))?;
        let component = self
            .component
            .as_ref()
            .and_then(|c| c.id())
            .ok_or_else(|| crate::Error::protocol("candidate missing component"))?;
        let protocol = self
            .protocol
            .as_deref()
            .ok_or_else(|| crate::Error::protocol("candidate missing protocol"))?;
        let priority = self
            .priority
            .ok_or_else(|| crate::Error::protocol("candidate missing priority"))?;
        let ip = self
            .ip
            .as_deref()
            .ok_or_else(|| crate::Error::protocol("candidate missing address"))?;
        let port = self
            .port
            .ok_or_else(|| crate::Error::protocol("candidate missing port"))?;
        let kind = self
            .kind
            .as_deref()
            .ok_or_else(|| crate::Error::protocol("candidate missing type"))?;

        let mut out = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            foundation,
            component,
            protocol.to_ascii_lowercase(),
            priority,
            ip,
            port,
            kind
        );
        if let (Some(raddr), Some(rport)) = (self.related_address.as_deref(), self.related_port) {
            out.push_str(&format!(" raddr {} rport {}", raddr, rport));
        }
        if let Some(tcp_type) = self.tcp_type.as_deref() {
            out.push_str(&format!(" tcptype {}", tcp_type));
        }
        Ok(out)
    }
}

/// Control messages carried over the per-session signaling channel.
///
/// Ordering within a channel is FIFO per direction. `FaceDetected` is the
/// only message the relay originates; it travels as two consecutive text
/// frames (marker, then base64 JPEG) so the peer can decode the still
/// without any additional handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Arm the capture gate.
    Start,
    /// Disarm the capture gate.
    Stop,
    /// A captured still, as encoded JPEG bytes.
    FaceDetected(Vec<u8>),
    /// Any other inbound payload; ignored by the core, reserved for
    /// future protocol extension.
    PlainText(String),
}

impl SignalingMessage {
    /// Decode one inbound text frame from the peer.
    pub fn from_wire(text: &str) -> Self {
        match text {
            MSG_START => SignalingMessage::Start,
            MSG_STOP => SignalingMessage::Stop,
            other => SignalingMessage::PlainText(other.to_string()),
        }
    }

    /// Encode this message as the text frames to send, in order.
    pub fn to_wire(&self) -> Vec<String> {
        match self {
            SignalingMessage::Start => vec![MSG_START.to_string()],
            SignalingMessage::Stop => vec![MSG_STOP.to_string()],
            SignalingMessage::FaceDetected(jpeg) => {
                vec![MSG_FACE_DETECTED.to_string(), BASE64.encode(jpeg)]
            }
            SignalingMessage::PlainText(text) => vec![text.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_round_trip() {
        assert_eq!(SignalingMessage::from_wire("start"), SignalingMessage::Start);
        assert_eq!(SignalingMessage::from_wire("stop"), SignalingMessage::Stop);
        assert_eq!(SignalingMessage::Start.to_wire(), vec!["start"]);
        assert_eq!(SignalingMessage::Stop.to_wire(), vec!["stop"]);
    }

    #[test]
    fn test_commands_are_case_sensitive() {
        assert_eq!(
            SignalingMessage::from_wire("Start"),
            SignalingMessage::PlainText("Start".to_string())
        );
        assert_eq!(
            SignalingMessage::from_wire("STOP"),
            SignalingMessage::PlainText("STOP".to_string())
        );
    }

    #[test]
    fn test_face_detected_is_marker_then_base64() {
        let frames = SignalingMessage::FaceDetected(vec![0xff, 0xd8, 0xff]).to_wire();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], MSG_FACE_DETECTED);
        assert_eq!(frames[1], "/9j/");
    }

    #[test]
    fn test_unknown_payload_preserved_as_plain_text() {
        let msg = SignalingMessage::from_wire("ping");
        assert_eq!(msg, SignalingMessage::PlainText("ping".to_string()));
        assert_eq!(msg.to_wire(), vec!["ping"]);
    }

    #[test]
    fn test_candidate_deserializes_browser_body() {
        let body = r#"{
            "component": "rtp",
            "foundation": "842163049",
            "ip": "192.168.1.10",
            "port": 54400,
            "priority": 1677729535,
            "protocol": "udp",
            "type": "srflx",
            "relatedAddress": "10.0.0.2",
            "relatedPort": 54400,
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "tcpType": null
        }"#;
        let payload: IceCandidatePayload = serde_json::from_str(body).unwrap();
        assert_eq!(payload.component.as_ref().unwrap().id(), Some(1));
        assert_eq!(payload.sdp_mline_index, Some(0));
        assert_eq!(payload.session_id, None);

        let s = payload.to_candidate_string().unwrap();
        assert_eq!(
            s,
            "candidate:842163049 1 udp 1677729535 192.168.1.10 54400 typ srflx raddr 10.0.0.2 rport 54400"
        );
    }

    #[test]
    fn test_candidate_numeric_component_and_tcp_type() {
        let payload = IceCandidatePayload {
            component: Some(IceComponent::Id(2)),
            foundation: Some("1".to_string()),
            ip: Some("127.0.0.1".to_string()),
            port: Some(9),
            priority: Some(1),
            protocol: Some("TCP".to_string()),
            kind: Some("host".to_string()),
            tcp_type: Some("active".to_string()),
            ..Default::default()
        };
        let s = payload.to_candidate_string().unwrap();
        assert_eq!(s, "candidate:1 2 tcp 1 127.0.0.1 9 typ host tcptype active");
    }

    #[test]
    fn test_candidate_missing_fields_rejected() {
        let payload = IceCandidatePayload::default();
        assert!(payload.to_candidate_string().is_err());
    }

    #[test]
    fn test_session_description_type_field_name() {
        let body = r#"{"sdp": "v=0...", "type": "offer"}"#;
        let desc: SessionDescriptionPayload = serde_json::from_str(body).unwrap();
        assert_eq!(desc.kind, "offer");
        assert_eq!(desc.session_id, None);
        // Offers round-trip without growing a sessionId field.
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(!json.contains("sessionId"));
    }

    #[test]
    fn test_answer_carries_session_id() {
        let id = uuid::Uuid::new_v4();
        let answer = SessionDescriptionPayload {
            sdp: "v=0...".to_owned(),
            kind: "answer".to_owned(),
            session_id: Some(id),
        };
        let json = serde_json::to_string(&answer).unwrap();
        assert!(json.contains(&format!("\"sessionId\":\"{id}\"")));

        let parsed: SessionDescriptionPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, Some(id));
    }
}
