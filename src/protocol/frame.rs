//! # Backend Binary Frames
//!
//! Every message on the backend channel is one tag byte followed by a payload.
//!
//! | Tag  | Frame     | Payload                         |
//! |------|-----------|---------------------------------|
//! | 0x00 | Handshake | none                            |
//! | 0x01 | Audio     | wire codec payload              |
//! | 0x02 | Text      | UTF-8                           |
//! | 0x03 | Control   | one code byte (see [`ControlCode`]) |
//! | 0x04 | Metadata  | JSON                            |
//! | 0x05 | Error     | UTF-8                           |
//! | 0x06 | Ping      | none                            |
//!
//! Parsing is total: unknown tags become [`BackendFrame::Unknown`] and
//! malformed payloads are decoded lossily.

use serde_json::Value;

pub const TAG_HANDSHAKE: u8 = 0x00;
pub const TAG_AUDIO: u8 = 0x01;
pub const TAG_TEXT: u8 = 0x02;
pub const TAG_CONTROL: u8 = 0x03;
pub const TAG_METADATA: u8 = 0x04;
pub const TAG_ERROR: u8 = 0x05;
pub const TAG_PING: u8 = 0x06;

/// Codes carried by a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    Start = 0,
    EndTurn = 1,
    Pause = 2,
    Restart = 3,
}

impl ControlCode {
    pub fn from_byte(code: u8) -> Option<Self> {
        match code {
            0 => Some(ControlCode::Start),
            1 => Some(ControlCode::EndTurn),
            2 => Some(ControlCode::Pause),
            3 => Some(ControlCode::Restart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendFrame {
    Handshake,
    Audio(Vec<u8>),
    Text(String),
    /// Raw code byte; codes outside [`ControlCode`] are kept as-is.
    Control(u8),
    Metadata(Value),
    Error(String),
    Ping,
    Unknown { tag: u8, payload: Vec<u8> },
}

impl BackendFrame {
    /// Parse one frame. Returns `None` only for an empty buffer.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&tag, payload) = data.split_first()?;

        let frame = match tag {
            TAG_HANDSHAKE => BackendFrame::Handshake,
            TAG_AUDIO => BackendFrame::Audio(payload.to_vec()),
            TAG_TEXT => BackendFrame::Text(String::from_utf8_lossy(payload).into_owned()),
            // A control frame without a code byte reads as Start.
            TAG_CONTROL => BackendFrame::Control(payload.first().copied().unwrap_or(0)),
            TAG_METADATA => BackendFrame::Metadata(
                serde_json::from_slice(payload).unwrap_or_else(|_| Value::Object(Default::default())),
            ),
            TAG_ERROR => BackendFrame::Error(String::from_utf8_lossy(payload).into_owned()),
            TAG_PING => BackendFrame::Ping,
            other => BackendFrame::Unknown {
                tag: other,
                payload: payload.to_vec(),
            },
        };

        Some(frame)
    }

    pub fn control(code: ControlCode) -> Self {
        BackendFrame::Control(code as u8)
    }

    pub fn tag(&self) -> u8 {
        match self {
            BackendFrame::Handshake => TAG_HANDSHAKE,
            BackendFrame::Audio(_) => TAG_AUDIO,
            BackendFrame::Text(_) => TAG_TEXT,
            BackendFrame::Control(_) => TAG_CONTROL,
            BackendFrame::Metadata(_) => TAG_METADATA,
            BackendFrame::Error(_) => TAG_ERROR,
            BackendFrame::Ping => TAG_PING,
            BackendFrame::Unknown { tag, .. } => *tag,
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.tag()];
        match self {
            BackendFrame::Handshake | BackendFrame::Ping => {}
            BackendFrame::Audio(payload) | BackendFrame::Unknown { payload, .. } => out.extend_from_slice(payload),
            BackendFrame::Text(text) | BackendFrame::Error(text) => out.extend_from_slice(text.as_bytes()),
            BackendFrame::Control(code) => out.push(*code),
            BackendFrame::Metadata(value) => out.extend_from_slice(value.to_string().as_bytes()),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_every_tag() {
        assert_eq!(BackendFrame::parse(&[0x00]), Some(BackendFrame::Handshake));
        assert_eq!(BackendFrame::parse(&[0x01, 9, 8]), Some(BackendFrame::Audio(vec![9, 8])));
        assert_eq!(BackendFrame::parse(b"\x02hi"), Some(BackendFrame::Text("hi".to_string())));
        assert_eq!(BackendFrame::parse(&[0x03, 0x01]), Some(BackendFrame::Control(1)));
        assert_eq!(
            BackendFrame::parse(b"\x04{\"k\":1}"),
            Some(BackendFrame::Metadata(json!({"k": 1})))
        );
        assert_eq!(BackendFrame::parse(b"\x05boom"), Some(BackendFrame::Error("boom".to_string())));
        assert_eq!(BackendFrame::parse(&[0x06]), Some(BackendFrame::Ping));
    }

    #[test]
    fn test_parse_edge_cases() {
        assert_eq!(BackendFrame::parse(&[]), None);
        assert_eq!(BackendFrame::parse(&[0x03]), Some(BackendFrame::Control(0)));
        assert_eq!(BackendFrame::parse(b"\x04not json"), Some(BackendFrame::Metadata(json!({}))));
        assert_eq!(
            BackendFrame::parse(&[0x02, 0xff, b'a']),
            Some(BackendFrame::Text("\u{fffd}a".to_string()))
        );
        assert_eq!(
            BackendFrame::parse(&[0x7f, 1]),
            Some(BackendFrame::Unknown { tag: 0x7f, payload: vec![1] })
        );
    }

    #[test]
    fn test_to_bytes() {
        assert_eq!(BackendFrame::Ping.to_bytes(), vec![0x06]);
        assert_eq!(BackendFrame::control(ControlCode::Pause).to_bytes(), vec![0x03, 0x02]);
        assert_eq!(BackendFrame::Audio(vec![1, 2]).to_bytes(), vec![0x01, 1, 2]);
        assert_eq!(BackendFrame::Text("ok".into()).to_bytes(), b"\x02ok".to_vec());
    }

    #[test]
    fn test_control_codes() {
        assert_eq!(ControlCode::from_byte(1), Some(ControlCode::EndTurn));
        assert_eq!(ControlCode::from_byte(9), None);
        assert_eq!(ControlCode::Restart as u8, 3);
    }
}
