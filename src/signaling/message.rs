//! Signaling wire format
//!
//! Viewers and the relay exchange single-key JSON objects:
//! `{"offer": {...}}`, `{"answer": {...}}` and `{"candidate": {...}}`. The
//! inner objects use the browser's `RTCSessionDescriptionInit` and
//! `RTCIceCandidateInit` field names.

use serde::{Deserialize, Serialize};

use super::SignalingError;

/// SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged with browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// One signaling message in either direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl SignalMessage {
    pub fn offer(offer: SessionDescription) -> Self {
        Self {
            offer: Some(offer),
            ..Default::default()
        }
    }

    pub fn answer(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            ..Default::default()
        }
    }

    /// Parse a text frame from a viewer
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Serialize for sending
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Whether the message carries nothing the relay acts on
    pub fn is_empty(&self) -> bool {
        self.offer.is_none() && self.answer.is_none() && self.candidate.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_browser_offer() {
        let msg = SignalMessage::parse(r#"{"offer":{"type":"offer","sdp":"v=0\r\n"}}"#).unwrap();

        assert_eq!(msg.offer, Some(SessionDescription::offer("v=0\r\n")));
        assert!(msg.candidate.is_none());
    }

    #[test]
    fn test_parse_browser_candidate() {
        let msg = SignalMessage::parse(
            r#"{"candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();

        let candidate = msg.candidate.unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn test_answer_json_shape() {
        let json = SignalMessage::answer(SessionDescription::answer("v=0"))
            .to_json()
            .unwrap();

        assert_eq!(json, r#"{"answer":{"type":"answer","sdp":"v=0"}}"#);
    }

    #[test]
    fn test_candidate_json_field_names() {
        let json = SignalMessage::candidate(IceCandidate {
            candidate: "candidate:x".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
        .to_json()
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            SignalMessage::parse("VIEWER_ON"),
            Err(SignalingError::InvalidMessage(_))
        ));
        assert!(SignalMessage::parse("{}").unwrap().is_empty());
    }
}
