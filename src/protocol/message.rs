//! # Client Messages
//!
//! JSON messages exchanged with the client, discriminated by `type`.
//! Both directions share one enum; the orchestrator only ever receives
//! `audio_chunk`, `interrupt`, `ping`, `pong` and `end` from a client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capabilities advertised in the `connected` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub full_duplex: bool,
    pub interruption: bool,
    pub backchannels: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            full_duplex: true,
            interruption: true,
            backchannels: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connected {
        mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_format: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<Capabilities>,
    },
    AudioChunk {
        /// Base64 PCM.
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_index: Option<u64>,
    },
    Transcription {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<bool>,
    },
    Interrupted {
        reason: String,
    },
    Interrupt,
    End,
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sources: Option<Value>,
    },
    Error {
        message: String,
    },
    Control {
        code: u8,
    },
    Metadata {
        data: Value,
    },
    Ping,
    Pong,
    Unknown {
        raw_type: u8,
    },
    /// Any `type` this service does not model.
    #[serde(other)]
    Unsupported,
}

impl ClientMessage {
    /// The bare `connected` message produced by a backend handshake.
    pub fn connected() -> Self {
        ClientMessage::Connected {
            mode: "full_duplex".to_string(),
            session_id: None,
            audio_format: None,
            sample_rate: None,
            capabilities: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ClientMessage::Error { message: message.into() }
    }

    pub fn interrupted(reason: impl Into<String>) -> Self {
        ClientMessage::Interrupted { reason: reason.into() }
    }

    pub fn done() -> Self {
        ClientMessage::Done { sources: None }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connected { .. } => "connected",
            ClientMessage::AudioChunk { .. } => "audio_chunk",
            ClientMessage::Transcription { .. } => "transcription",
            ClientMessage::Interrupted { .. } => "interrupted",
            ClientMessage::Interrupt => "interrupt",
            ClientMessage::End => "end",
            ClientMessage::Done { .. } => "done",
            ClientMessage::Error { .. } => "error",
            ClientMessage::Control { .. } => "control",
            ClientMessage::Metadata { .. } => "metadata",
            ClientMessage::Ping => "ping",
            ClientMessage::Pong => "pong",
            ClientMessage::Unknown { .. } => "unknown",
            ClientMessage::Unsupported => "unsupported",
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_value(msg: &ClientMessage) -> Value {
        serde_json::to_value(msg).unwrap()
    }

    #[test]
    fn test_minimal_shapes() {
        assert_eq!(as_value(&ClientMessage::connected()), json!({"type": "connected", "mode": "full_duplex"}));
        assert_eq!(as_value(&ClientMessage::done()), json!({"type": "done"}));
        assert_eq!(as_value(&ClientMessage::Pong), json!({"type": "pong"}));
        assert_eq!(
            as_value(&ClientMessage::interrupted("user_request")),
            json!({"type": "interrupted", "reason": "user_request"})
        );
    }

    #[test]
    fn test_parse_client_audio_chunk() {
        let msg = ClientMessage::from_json(r#"{"type":"audio_chunk","data":"AAAA","format":"int16","sample_rate":24000}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::AudioChunk {
                data: "AAAA".to_string(),
                format: Some("int16".to_string()),
                sample_rate: Some(24000),
                chunk_index: None,
            }
        );
    }

    #[test]
    fn test_parse_bare_types() {
        assert_eq!(ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(ClientMessage::from_json(r#"{"type":"interrupt"}"#).unwrap(), ClientMessage::Interrupt);
        assert_eq!(ClientMessage::from_json(r#"{"type":"end"}"#).unwrap(), ClientMessage::End);
    }

    #[test]
    fn test_unmodelled_type_is_unsupported() {
        let msg = ClientMessage::from_json(r#"{"type":"subscribe","topic":"x"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unsupported);
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"data":"x"}"#).is_err());
    }

    #[test]
    fn test_outbound_audio_chunk_fields() {
        let msg = ClientMessage::AudioChunk {
            data: "AA==".to_string(),
            format: Some("pcm".to_string()),
            sample_rate: Some(24000),
            chunk_index: Some(3),
        };
        assert_eq!(
            as_value(&msg),
            json!({"type": "audio_chunk", "data": "AA==", "format": "pcm", "sample_rate": 24000, "chunk_index": 3})
        );
        assert_eq!(msg.kind(), "audio_chunk");
    }
}
