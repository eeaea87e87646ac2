//! # Audio Module
//!
//! Sample-level plumbing shared by the translator and the backend strategies.
//!
//! ## Key Components:
//! - **PCM**: float32 / int16 little-endian buffers and conversions
//! - **Resampler**: linear interpolation between the client and backend rates
//! - **Codec**: the wire codec carried inside backend audio frames
//!
//! ## Audio Format:
//! - **Channels**: mono
//! - **Client rate**: 24 kHz by default
//! - **Backend native rate**: 32 kHz by default
//! - **Codec rate**: nearest Opus-supported rate to the native rate (24 kHz)

pub mod codec;
pub mod pcm;
pub mod resampler;
