//! # Wire Audio Codec
//!
//! Encoder/decoder seam for the audio payload of backend `0x01` frames.
//!
//! ## Key Features:
//! - **`AudioCodec` trait**: stateful encode/decode, one instance per direction per session
//! - **Raw PCM codec**: float32 LE passthrough, always available
//! - **Opus codec**: behind the `opus` cargo feature (links libopus through `audiopus`)
//! - **Rate pinning**: Opus only runs at a handful of rates, so the codec is
//!   pinned to the supported rate nearest the backend's native rate. With a
//!   32 kHz backend the codec runs at 24 kHz, and callers resample around it.
//!
//! Codec errors are values, never panics. Callers decide whether to degrade.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audio::pcm;

/// Sample rates Opus can operate at.
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Pick the supported codec rate closest to `native_rate`. Ties go to the lower rate.
pub fn nearest_supported_rate(native_rate: u32) -> u32 {
    let mut best = OPUS_SAMPLE_RATES[0];
    for &rate in OPUS_SAMPLE_RATES.iter() {
        if rate.abs_diff(native_rate) < best.abs_diff(native_rate) {
            best = rate;
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    Init(String),
    Encode(String),
    /// Decoding stopped part way; `partial` holds the samples recovered so far.
    Decode { reason: String, partial: Vec<f32> },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Init(msg) => write!(f, "Codec initialization failed: {}", msg),
            CodecError::Encode(msg) => write!(f, "Encoding failed: {}", msg),
            CodecError::Decode { reason, partial } => {
                write!(f, "Decoding failed after {} samples: {}", partial.len(), reason)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Stateful wire codec.
pub trait AudioCodec: Send {
    fn name(&self) -> &'static str;

    /// Rate the codec expects its PCM input at and produces its output at.
    fn sample_rate(&self) -> u32;

    /// Encode float samples. May buffer samples until a full codec frame is available.
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError>;

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, CodecError>;

    /// Drop any buffered state so the next call starts a fresh stream.
    fn reset(&mut self);
}

/// Selects which codec a translator instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Pcm,
    Opus,
}

impl CodecKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::Pcm => "pcm",
            CodecKind::Opus => "opus",
        }
    }
}

/// Build a codec of the requested kind at `sample_rate`.
///
/// Opus falls back to raw PCM when the crate is built without the `opus`
/// feature or the encoder cannot be created.
pub fn create_codec(kind: CodecKind, sample_rate: u32) -> Box<dyn AudioCodec> {
    match kind {
        CodecKind::Pcm => Box::new(RawPcmCodec::new(sample_rate)),
        CodecKind::Opus => open_opus(sample_rate),
    }
}

#[cfg(feature = "opus")]
fn open_opus(sample_rate: u32) -> Box<dyn AudioCodec> {
    match opus::OpusCodec::new(sample_rate) {
        Ok(codec) => Box::new(codec),
        Err(e) => {
            warn!(error = %e, sample_rate, "Opus codec unavailable, using raw PCM");
            Box::new(RawPcmCodec::new(sample_rate))
        }
    }
}

#[cfg(not(feature = "opus"))]
fn open_opus(sample_rate: u32) -> Box<dyn AudioCodec> {
    warn!(sample_rate, "Built without the opus feature, using raw PCM");
    Box::new(RawPcmCodec::new(sample_rate))
}

/// Encode each whole `frame` at the front of `pending` as a packet prefixed
/// with its little-endian `u16` length.
///
/// A frame that fails to encode is logged and dropped, and encoding stops
/// there: packets already produced are returned and the remaining samples
/// wait for the next call.
#[cfg_attr(not(feature = "opus"), allow(dead_code))]
fn encode_frames<F>(pending: &mut Vec<f32>, frame: usize, mut encode_one: F) -> Vec<u8>
where
    F: FnMut(&[f32]) -> Result<Vec<u8>, CodecError>,
{
    let mut out = Vec::new();
    if frame == 0 {
        return out;
    }

    while pending.len() >= frame {
        let result = encode_one(&pending[..frame]);
        pending.drain(..frame);

        match result {
            Ok(packet) => {
                let mut prefix = [0u8; 2];
                LittleEndian::write_u16(&mut prefix, packet.len() as u16);
                out.extend_from_slice(&prefix);
                out.extend_from_slice(&packet);
            }
            Err(e) => {
                warn!(error = %e, kept_bytes = out.len(), "Frame encode failed, keeping packets encoded so far");
                break;
            }
        }
    }

    out
}

/// Float32 little-endian PCM carried as-is.
#[derive(Debug, Clone)]
pub struct RawPcmCodec {
    sample_rate: u32,
}

impl RawPcmCodec {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioCodec for RawPcmCodec {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError> {
        Ok(pcm::f32_to_bytes(samples))
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, CodecError> {
        Ok(pcm::bytes_to_f32(payload))
    }

    fn reset(&mut self) {}
}

#[cfg(feature = "opus")]
mod opus {
    use audiopus::coder::{Decoder, Encoder};
    use audiopus::{Application, Channels, SampleRate};
    use byteorder::{ByteOrder, LittleEndian};

    use super::{AudioCodec, CodecError};

    /// Max packet size recommended by libopus.
    const MAX_PACKET: usize = 4000;

    /// Opus stream of 20 ms mono frames.
    ///
    /// A payload is a sequence of packets, each prefixed with its length as a
    /// little-endian `u16`. Samples that do not fill a whole frame wait for the
    /// next `encode` call.
    pub struct OpusCodec {
        sample_rate: u32,
        opus_rate: SampleRate,
        encoder: Encoder,
        decoder: Decoder,
        pending: Vec<f32>,
    }

    fn opus_rate(rate: u32) -> Result<SampleRate, CodecError> {
        match rate {
            8000 => Ok(SampleRate::Hz8000),
            12000 => Ok(SampleRate::Hz12000),
            16000 => Ok(SampleRate::Hz16000),
            24000 => Ok(SampleRate::Hz24000),
            48000 => Ok(SampleRate::Hz48000),
            other => Err(CodecError::Init(format!("unsupported Opus rate {}", other))),
        }
    }

    impl OpusCodec {
        pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
            let rate = opus_rate(sample_rate)?;
            let encoder = Encoder::new(rate, Channels::Mono, Application::Voip)
                .map_err(|e| CodecError::Init(e.to_string()))?;
            let decoder = Decoder::new(rate, Channels::Mono).map_err(|e| CodecError::Init(e.to_string()))?;

            Ok(Self {
                sample_rate,
                opus_rate: rate,
                encoder,
                decoder,
                pending: Vec::new(),
            })
        }

        fn frame_size(&self) -> usize {
            (self.sample_rate / 50) as usize
        }
    }

    impl AudioCodec for OpusCodec {
        fn name(&self) -> &'static str {
            "opus"
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError> {
            self.pending.extend_from_slice(samples);
            let frame = self.frame_size();
            let encoder = &mut self.encoder;
            let mut packet = [0u8; MAX_PACKET];

            Ok(super::encode_frames(&mut self.pending, frame, |pcm| {
                let len = encoder
                    .encode_float(pcm, &mut packet)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                Ok(packet[..len].to_vec())
            }))
        }

        fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, CodecError> {
            // 120 ms is the longest Opus frame.
            let mut scratch = vec![0f32; (self.sample_rate as usize * 120) / 1000];
            let mut out = Vec::new();
            let mut rest = payload;

            while rest.len() >= 2 {
                let len = LittleEndian::read_u16(&rest[..2]) as usize;
                if rest.len() < 2 + len {
                    return Err(CodecError::Decode {
                        reason: format!("truncated packet ({} of {} bytes)", rest.len() - 2, len),
                        partial: out,
                    });
                }
                match self.decoder.decode_float(Some(&rest[2..2 + len]), &mut scratch, false) {
                    Ok(n) => out.extend_from_slice(&scratch[..n]),
                    Err(e) => {
                        return Err(CodecError::Decode {
                            reason: e.to_string(),
                            partial: out,
                        })
                    }
                }
                rest = &rest[2 + len..];
            }

            Ok(out)
        }

        fn reset(&mut self) {
            self.pending.clear();
            if let Ok(encoder) = Encoder::new(self.opus_rate, Channels::Mono, Application::Voip) {
                self.encoder = encoder;
            }
            if let Ok(decoder) = Decoder::new(self.opus_rate, Channels::Mono) {
                self.decoder = decoder;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_opus_buffers_partial_frames() {
            let mut codec = OpusCodec::new(24000).unwrap();
            assert!(codec.encode(&[0.0; 100]).unwrap().is_empty());
            let payload = codec.encode(&[0.0; 380]).unwrap();
            assert!(!payload.is_empty());

            let decoded = codec.decode(&payload).unwrap();
            assert_eq!(decoded.len(), 480);
        }

        #[test]
        fn test_opus_truncated_payload_returns_partial() {
            let mut codec = OpusCodec::new(24000).unwrap();
            let mut payload = codec.encode(&[0.1; 960]).unwrap();
            payload.truncate(payload.len() - 1);

            match codec.decode(&payload) {
                Err(CodecError::Decode { partial, .. }) => assert_eq!(partial.len(), 480),
                other => panic!("expected partial decode, got {:?}", other),
            }
        }
    }
}
