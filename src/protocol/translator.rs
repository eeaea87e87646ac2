//! # Protocol Translator
//!
//! Converts between client JSON messages and backend binary frames for one
//! session, including the wire codec and the resampling around it.
//!
//! ## Audio Paths:
//! - **Client → backend**: base64 → PCM (float32 or int16) → resample client rate → codec rate → encode
//! - **Backend → client**: decode → resample codec rate → client rate → float32 base64
//!
//! The codec rate is the supported codec rate nearest the backend's native
//! rate, not the native rate itself (24 kHz for a 32 kHz backend). Whatever
//! consumes codec payloads must resample between the codec rate and its own.
//!
//! ## Failure Policy:
//! Codec failures never escape. A failed encode yields an empty payload and a
//! failed decode yields whatever samples were recovered, so one bad frame costs
//! a glitch rather than the session.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, warn};

use crate::audio::codec::{self, AudioCodec, CodecError, CodecKind};
use crate::audio::pcm::{self, SampleFormat};
use crate::audio::resampler::{self, resample_f32};
use crate::protocol::frame::{BackendFrame, ControlCode};
use crate::protocol::message::ClientMessage;

/// Rates and codec a translator is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorConfig {
    /// Backend model rate.
    pub native_rate: u32,
    /// Client-facing rate.
    pub client_rate: u32,
    pub codec: CodecKind,
}

pub struct ProtocolTranslator {
    config: TranslatorConfig,
    codec_rate: u32,
    encoder: Box<dyn AudioCodec>,
    decoder: Box<dyn AudioCodec>,
}

impl ProtocolTranslator {
    pub fn new(config: TranslatorConfig) -> Self {
        let codec_rate = codec::nearest_supported_rate(config.native_rate);
        let encoder = codec::create_codec(config.codec, codec_rate);
        if codec_rate != config.native_rate {
            debug!(
                codec = encoder.name(),
                native_rate = config.native_rate,
                codec_rate,
                "Codec pinned to nearest supported rate"
            );
        }

        Self {
            config,
            codec_rate,
            encoder,
            decoder: codec::create_codec(config.codec, codec_rate),
        }
    }

    pub fn config(&self) -> TranslatorConfig {
        self.config
    }

    /// Rate the wire codec runs at.
    pub fn codec_rate(&self) -> u32 {
        self.codec_rate
    }

    pub fn client_rate(&self) -> u32 {
        self.config.client_rate
    }

    /// Encode samples at the codec rate. Empty on failure.
    pub fn encode_audio(&mut self, samples: &[f32]) -> Vec<u8> {
        match self.encoder.encode(samples) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, samples = samples.len(), "Audio encode failed, dropping frame");
                Vec::new()
            }
        }
    }

    /// Decode a codec payload to samples at the codec rate. Partial on failure.
    pub fn decode_audio(&mut self, payload: &[u8]) -> Vec<f32> {
        match self.decoder.decode(payload) {
            Ok(samples) => samples,
            Err(CodecError::Decode { reason, partial }) => {
                warn!(reason = %reason, recovered = partial.len(), "Audio decode failed, keeping partial output");
                partial
            }
            Err(e) => {
                warn!(error = %e, "Audio decode failed, dropping frame");
                Vec::new()
            }
        }
    }

    /// Turn a client base64 chunk into a codec payload.
    ///
    /// `sample_rate` defaults to the client rate. Returns `None` when the
    /// base64 is invalid.
    pub fn client_audio_to_payload(&mut self, data: &str, format: Option<&str>, sample_rate: Option<u32>) -> Option<Vec<u8>> {
        let bytes = match STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Dropping audio chunk with invalid base64");
                return None;
            }
        };

        let format = SampleFormat::from_wire(format);
        let rate = sample_rate.unwrap_or(self.config.client_rate);
        let resampled = resampler::resample(&bytes, rate, self.codec_rate, format);

        Some(self.encode_audio(&pcm::decode_samples(&resampled, format)))
    }

    /// Decode a codec payload into client-rate float samples.
    pub fn payload_to_client_samples(&mut self, payload: &[u8]) -> Vec<f32> {
        let samples = self.decode_audio(payload);
        resample_f32(&samples, self.codec_rate, self.config.client_rate)
    }

    /// Translate a client message into the frame the backend expects.
    ///
    /// Only `audio_chunk`, `interrupt` and `ping` have backend counterparts.
    /// An audio chunk whose payload comes out empty produces no frame.
    pub fn client_to_backend(&mut self, message: &ClientMessage) -> Option<BackendFrame> {
        match message {
            ClientMessage::AudioChunk {
                data,
                format,
                sample_rate,
                ..
            } => {
                if data.is_empty() {
                    return None;
                }
                let payload = self.client_audio_to_payload(data, format.as_deref(), *sample_rate)?;
                if payload.is_empty() {
                    None
                } else {
                    Some(BackendFrame::Audio(payload))
                }
            }
            ClientMessage::Interrupt => Some(BackendFrame::control(ControlCode::Pause)),
            ClientMessage::Ping => Some(BackendFrame::Ping),
            other => {
                debug!(message_type = other.kind(), "Client message has no backend counterpart");
                None
            }
        }
    }

    pub fn frame_to_client(&mut self, frame: &BackendFrame) -> ClientMessage {
        match frame {
            BackendFrame::Handshake => ClientMessage::connected(),
            BackendFrame::Audio(payload) => {
                let samples = self.payload_to_client_samples(payload);
                ClientMessage::AudioChunk {
                    data: STANDARD.encode(pcm::f32_to_bytes(&samples)),
                    format: Some("pcm".to_string()),
                    sample_rate: Some(self.config.client_rate),
                    chunk_index: None,
                }
            }
            BackendFrame::Text(text) => ClientMessage::Transcription {
                text: text.clone(),
                partial: None,
            },
            BackendFrame::Control(code) => match ControlCode::from_byte(*code) {
                Some(ControlCode::EndTurn) => ClientMessage::done(),
                Some(ControlCode::Pause) => ClientMessage::interrupted("model_pause"),
                _ => ClientMessage::Control { code: *code },
            },
            BackendFrame::Metadata(value) => ClientMessage::Metadata { data: value.clone() },
            BackendFrame::Error(message) => ClientMessage::error(message.clone()),
            BackendFrame::Ping => ClientMessage::Pong,
            BackendFrame::Unknown { tag, .. } => {
                warn!(tag, "Unknown backend frame type");
                ClientMessage::Unknown { raw_type: *tag }
            }
        }
    }

    /// Fresh codec state for a new stream.
    pub fn reset(&mut self) {
        self.encoder.reset();
        self.decoder.reset();
    }
}
