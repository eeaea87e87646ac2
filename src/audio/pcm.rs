//! # PCM Sample Formats
//!
//! Conversions between raw little-endian PCM byte buffers and the float domain
//! used by the resampler, the wire codec and the model runtime.
//!
//! ## Supported Representations:
//! - **Float32**: 32-bit IEEE float samples in `[-1.0, 1.0]`, used as-is
//! - **Int16**: 16-bit signed integer samples, scaled by `1/32768` into the float domain
//!
//! Buffers whose length is not a whole number of samples are truncated to the
//! last complete sample. This is lossy but never an error.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Fixed scale between the int16 and float domains.
pub const INT16_SCALE: f32 = 32768.0;

/// Sample representation of a PCM byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    Float32,
    Int16,
}

impl SampleFormat {
    /// Interpret the `format` field of a client `audio_chunk`.
    ///
    /// `int16` and `wav` carry 16-bit integer samples; anything else
    /// (`pcm`, `float32`, missing) is float32.
    pub fn from_wire(format: Option<&str>) -> Self {
        match format.map(|f| f.to_ascii_lowercase()) {
            Some(f) if f == "int16" || f == "wav" => SampleFormat::Int16,
            _ => SampleFormat::Float32,
        }
    }
}

/// Read float32 LE samples, dropping a trailing partial sample.
pub fn bytes_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4).map(LittleEndian::read_f32).collect()
}

/// Serialize float32 samples as LE bytes.
pub fn f32_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 4];
    LittleEndian::write_f32_into(samples, &mut out);
    out
}

/// Read int16 LE samples, dropping a trailing partial sample.
pub fn bytes_to_i16(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2).map(LittleEndian::read_i16).collect()
}

/// Serialize int16 samples as LE bytes.
pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

/// Scale int16 samples into the float domain.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / INT16_SCALE).collect()
}

/// Scale float samples back to int16, saturating at the type bounds.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * INT16_SCALE).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Decode a byte buffer of the given format into float samples.
pub fn decode_samples(data: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::Float32 => bytes_to_f32(data),
        SampleFormat::Int16 => i16_to_f32(&bytes_to_i16(data)),
    }
}

/// Encode float samples into a byte buffer of the given format.
pub fn encode_samples(samples: &[f32], format: SampleFormat) -> Vec<u8> {
    match format {
        SampleFormat::Float32 => f32_to_bytes(samples),
        SampleFormat::Int16 => i16_to_bytes(&f32_to_i16(samples)),
    }
}
