//! JSON wire messages for the duplex (WebSocket) mode.
//!
//! Every message is a JSON object tagged by `type`. Frame payloads travel as
//! base64 of the encoded bytes (zstd-compressed JPEG in this mode).

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::error::{StreamError, StreamResult};
use crate::screen::{DisplayId, Frame};

/// Role announced by the capture agent in its `identify` message.
pub const AGENT_ROLE: &str = "agent";

/// Messages a viewer (through the relay, or directly) sends to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    Identify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    RequestDisplayCount,
    RequestFrame {
        display: DisplayId,
        #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(rename = "isPreview", default)]
        is_preview: bool,
    },
    RequestPreview,
    StartWatching {
        display: DisplayId,
        #[serde(rename = "userID")]
        user_id: String,
    },
    StopWatching {
        display: DisplayId,
        #[serde(rename = "userID")]
        user_id: String,
    },
    /// Numeric settings arrive as raw JSON numbers so that fractional or
    /// oversized values reach the dispatcher and get an error reply.
    SetQuality {
        quality: Number,
    },
    #[serde(rename = "setFPS")]
    SetFps {
        fps: Number,
    },
    SetDiff {
        enabled: bool,
    },
    DirectConnect {
        #[serde(rename = "browserEndpoint")]
        browser_endpoint: String,
    },
}

impl Command {
    pub fn parse(text: &str) -> StreamResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The viewer id this command is issued on behalf of, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::RequestFrame { user_id, .. } => user_id.as_deref(),
            Self::StartWatching { user_id, .. } | Self::StopWatching { user_id, .. } => {
                Some(user_id)
            }
            _ => None,
        }
    }
}

/// The integer value of a numeric setting, or a `Config` error naming it.
pub fn integer_setting(name: &str, value: &Number) -> StreamResult<i64> {
    value
        .as_i64()
        .ok_or_else(|| StreamError::Config(format!("{} {} is not an integer", name, value)))
}

/// Messages the agent sends out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Identify {
        role: String,
    },
    DisplayCount {
        count: usize,
    },
    Frame {
        display: DisplayId,
        #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        data: String,
        #[serde(default, skip_serializing_if = "is_false")]
        diff: bool,
        #[serde(rename = "isPreview", default, skip_serializing_if = "is_false")]
        is_preview: bool,
    },
    /// One preview per display, keyed by the display id as a string.
    Previews {
        data: BTreeMap<String, String>,
    },
    Error {
        error: String,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Event {
    pub fn identify() -> Self {
        Self::Identify {
            role: AGENT_ROLE.to_string(),
        }
    }

    pub fn frame(frame: &Frame, user_id: Option<String>) -> Self {
        Self::Frame {
            display: frame.display,
            user_id,
            data: STANDARD.encode(&frame.data),
            diff: frame.diff,
            is_preview: frame.preview,
        }
    }

    pub fn previews(previews: &BTreeMap<DisplayId, Bytes>) -> Self {
        Self::Previews {
            data: previews
                .iter()
                .map(|(display, data)| (display.to_string(), STANDARD.encode(data)))
                .collect(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn parse(text: &str) -> StreamResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> StreamResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_viewer_commands() {
        assert_eq!(
            Command::parse(r#"{"type":"startWatching","display":1,"userID":"u7"}"#).unwrap(),
            Command::StartWatching {
                display: 1,
                user_id: "u7".into()
            }
        );
        assert_eq!(
            Command::parse(r#"{"type":"setFPS","fps":30}"#).unwrap(),
            Command::SetFps { fps: 30.into() }
        );
        assert_eq!(
            Command::parse(r#"{"type":"requestFrame","display":0,"isPreview":true}"#).unwrap(),
            Command::RequestFrame {
                display: 0,
                user_id: None,
                is_preview: true
            }
        );
        assert_eq!(
            Command::parse(r#"{"type":"directConnect","browserEndpoint":"ws://b:9"}"#).unwrap(),
            Command::DirectConnect {
                browser_endpoint: "ws://b:9".into()
            }
        );
    }

    #[test]
    fn out_of_range_settings_still_parse() {
        // Range checks belong to the dispatcher, which replies with an error.
        assert_eq!(
            Command::parse(r#"{"type":"setQuality","quality":-5}"#).unwrap(),
            Command::SetQuality {
                quality: (-5).into()
            }
        );
        for text in [
            r#"{"type":"setQuality","quality":50.5}"#,
            r#"{"type":"setQuality","quality":1e30}"#,
            r#"{"type":"setQuality","quality":18446744073709551615}"#,
        ] {
            let Command::SetQuality { quality } = Command::parse(text).unwrap() else {
                panic!("expected setQuality for {text}");
            };
            assert!(matches!(
                integer_setting("quality", &quality),
                Err(StreamError::Config(_))
            ));
        }
    }

    #[test]
    fn integer_settings_pass_through() {
        assert_eq!(integer_setting("fps", &30.into()).unwrap(), 30);
        assert_eq!(integer_setting("quality", &(-1).into()).unwrap(), -1);
    }

    #[test]
    fn unknown_or_malformed_is_a_protocol_error() {
        for text in [
            r#"{"type":"selectDisplay","display":1}"#,
            r#"{"type":"startWatching","display":1}"#,
            "not json",
        ] {
            assert!(matches!(Command::parse(text), Err(StreamError::Protocol(_))), "{text}");
        }
    }

    #[test]
    fn frame_event_shape() {
        let frame = Frame {
            display: 2,
            seq: 9,
            preview: false,
            diff: true,
            data: Bytes::from_static(b"\x01\x02\x03"),
        };
        let value: serde_json::Value =
            serde_json::from_str(&Event::frame(&frame, Some("u1".into())).to_json().unwrap())
                .unwrap();
        assert_eq!(
            value,
            json!({"type":"frame","display":2,"userID":"u1","data":"AQID","diff":true})
        );
    }

    #[test]
    fn previews_are_keyed_by_display() {
        let mut previews = BTreeMap::new();
        previews.insert(0, Bytes::from_static(b"a"));
        previews.insert(1, Bytes::from_static(b"b"));
        let value: serde_json::Value =
            serde_json::from_str(&Event::previews(&previews).to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type":"previews","data":{"0":"YQ==","1":"Yg=="}}));
    }

    #[test]
    fn identify_and_count() {
        assert_eq!(
            Event::identify().to_json().unwrap(),
            r#"{"type":"identify","role":"agent"}"#
        );
        assert_eq!(
            Event::DisplayCount { count: 3 }.to_json().unwrap(),
            r#"{"type":"displayCount","count":3}"#
        );
    }
}
