//! JSON text frames exchanged between relay clients and the relay server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    /// Client asks to receive `event` in `room_id`.
    Join { room_id: String, event: String },
    /// Server acknowledges a join.
    Joined { room_id: String, event: String },
    /// Client stops receiving `event`, or everything in the room when absent.
    Leave {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
    /// Client broadcasts to the other members of a room.
    Publish {
        room_id: String,
        event: String,
        payload: Value,
    },
    /// Server delivers a publish from another member.
    Message {
        room_id: String,
        event: String,
        payload: Value,
    },
    /// Server reports a rejected request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        message: String,
    },
}

impl RelayFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_use_type_tag_and_camel_case() {
        let join = RelayFrame::Join {
            room_id: "webrtc-party-42".into(),
            event: "signal".into(),
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"type": "join", "roomId": "webrtc-party-42", "event": "signal"})
        );

        let leave = RelayFrame::Leave {
            room_id: "webrtc-party-42".into(),
            event: None,
        };
        assert_eq!(
            serde_json::to_value(&leave).unwrap(),
            json!({"type": "leave", "roomId": "webrtc-party-42"})
        );
    }

    #[test]
    fn test_publish_frame_parses() {
        let text = r#"{"type":"publish","roomId":"r","event":"signal","payload":{"offer":{"sdp":"x"}}}"#;
        let frame = RelayFrame::from_text(text).unwrap();
        assert_eq!(
            frame,
            RelayFrame::Publish {
                room_id: "r".into(),
                event: "signal".into(),
                payload: json!({"offer": {"sdp": "x"}}),
            }
        );
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        assert!(RelayFrame::from_text(r#"{"type":"shout","roomId":"r"}"#).is_err());
    }
}
