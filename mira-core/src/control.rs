//! Text control messages exchanged over the session.
//!
//! Clients send `hello`, `request_keyframe`, and `pointer`; the server
//! may push `status`. Unknown kinds are ignored and malformed JSON is
//! dropped without disconnecting the session.

use serde::{Deserialize, Serialize};

// ── ControlMessage ───────────────────────────────────────────────

/// One parsed control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client handshake; `version` is the client protocol revision.
    Hello {
        #[serde(default)]
        client: String,
        #[serde(default)]
        version: u32,
    },

    /// The client lost sync (or just connected) and needs an I-frame.
    RequestKeyframe,

    /// A pointer event in normalized display coordinates.
    Pointer {
        u: f32,
        v: f32,
        /// Desired steady state of the button (move-while-held hint);
        /// does not itself synthesize a press or release.
        #[serde(default)]
        pressed: bool,
        #[serde(default)]
        down: bool,
        #[serde(default)]
        up: bool,
        /// 0 = primary (left), 1 = secondary (right); others ignored.
        #[serde(default)]
        button: u8,
    },

    /// Server → client advisory text.
    Status { text: String },

    /// Any kind this revision does not understand.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse a text message. `None` means the message was malformed or
    /// of an unknown kind and should be silently dropped.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::Unknown) | Err(_) => None,
            Ok(msg) => Some(msg),
        }
    }

    /// Serialize a server-side message for transmission.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Convenience constructor for advisory messages.
    pub fn status(text: impl Into<String>) -> Self {
        ControlMessage::Status { text: text.into() }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_parses() {
        let msg = ControlMessage::parse(r#"{"type":"hello","client":"godot","version":3}"#);
        assert_eq!(
            msg,
            Some(ControlMessage::Hello {
                client: "godot".into(),
                version: 3,
            })
        );
    }

    #[test]
    fn hello_fields_default() {
        let msg = ControlMessage::parse(r#"{"type":"hello"}"#);
        assert!(matches!(msg, Some(ControlMessage::Hello { version: 0, .. })));
    }

    #[test]
    fn request_keyframe_parses() {
        let msg = ControlMessage::parse(r#"{"type":"request_keyframe"}"#);
        assert_eq!(msg, Some(ControlMessage::RequestKeyframe));
    }

    #[test]
    fn pointer_parses() {
        let msg = ControlMessage::parse(
            r#"{"type":"pointer","u":0.5,"v":0.5,"pressed":false,"down":true,"up":false,"button":1}"#,
        );
        match msg {
            Some(ControlMessage::Pointer {
                u,
                v,
                down,
                up,
                button,
                ..
            }) => {
                assert_eq!(u, 0.5);
                assert_eq!(v, 0.5);
                assert!(down);
                assert!(!up);
                assert_eq!(button, 1);
            }
            other => panic!("wrong parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_dropped() {
        assert_eq!(ControlMessage::parse(r#"{"type":"telemetry","x":1}"#), None);
    }

    #[test]
    fn malformed_json_dropped() {
        assert_eq!(ControlMessage::parse("{nope"), None);
        assert_eq!(ControlMessage::parse(""), None);
    }

    #[test]
    fn status_serializes() {
        let json = ControlMessage::status("encoder: jpeg fallback").to_json();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains("jpeg fallback"));
    }
}
