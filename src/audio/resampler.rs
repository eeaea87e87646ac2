//! # Sample-Rate Conversion
//!
//! Linear-interpolation resampler between the client rate and the backend rate.
//!
//! ## Algorithm:
//! 1. Equal rates return the input untouched
//! 2. `output_len = floor(input_len * dst_rate / src_rate)`; zero means empty output
//! 3. Input and output positions are spread evenly over `[0, 1)`
//! 4. Each output sample interpolates between its two nearest input samples;
//!    positions past the last input sample hold the last value
//!
//! The computation runs in `f64` and is a single scalar pass, so every caller
//! (float32 or int16, bytes or slices) gets the same numbers.

use crate::audio::pcm::{self, SampleFormat};

/// Resample float samples from `src_rate` to `dst_rate`.
pub fn resample_f32(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate {
        return samples.to_vec();
    }

    let output_len = output_length(samples.len(), src_rate, dst_rate);
    if output_len == 0 {
        return Vec::new();
    }

    let input_len = samples.len();
    let last = input_len - 1;
    let mut out = Vec::with_capacity(output_len);

    for j in 0..output_len {
        // x_new[j] = j / output_len over x_old[i] = i / input_len
        let position = j as f64 * input_len as f64 / output_len as f64;
        let index = position.floor() as usize;

        if index >= last {
            out.push(samples[last]);
            continue;
        }

        let frac = position - index as f64;
        let left = samples[index] as f64;
        let right = samples[index + 1] as f64;
        out.push((left + (right - left) * frac) as f32);
    }

    out
}

/// Resample a PCM byte buffer in the given representation.
///
/// Int16 buffers are scaled into the float domain by `1/32768` before
/// interpolation and scaled back afterwards. Trailing bytes that do not form
/// a whole sample are dropped.
pub fn resample(pcm_bytes: &[u8], src_rate: u32, dst_rate: u32, format: SampleFormat) -> Vec<u8> {
    if src_rate == dst_rate {
        return pcm_bytes.to_vec();
    }

    let samples = pcm::decode_samples(pcm_bytes, format);
    let resampled = resample_f32(&samples, src_rate, dst_rate);
    pcm::encode_samples(&resampled, format)
}

/// `floor(input_len * dst_rate / src_rate)` without overflow.
pub fn output_length(input_len: usize, src_rate: u32, dst_rate: u32) -> usize {
    if src_rate == 0 {
        return 0;
    }
    ((input_len as u64 * dst_rate as u64) / src_rate as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{bytes_to_f32, f32_to_bytes, i16_to_bytes, bytes_to_i16};

    fn sine(len: usize, rate: u32, freq: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_zero_samples_24k_to_32k() {
        let input = f32_to_bytes(&[0.0f32; 48]);
        let output = resample(&input, 24000, 32000, SampleFormat::Float32);
        let samples = bytes_to_f32(&output);
        assert_eq!(samples.len(), 64);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_same_rate_is_identity() {
        let mut input = f32_to_bytes(&sine(100, 24000, 440.0));
        input.push(7); // unaligned tail is preserved when no conversion happens
        assert_eq!(resample(&input, 24000, 24000, SampleFormat::Float32), input);
    }

    #[test]
    fn test_empty_input() {
        assert!(resample(&[], 24000, 32000, SampleFormat::Float32).is_empty());
        assert!(resample_f32(&[], 32000, 24000).is_empty());
    }

    #[test]
    fn test_output_length_is_floor() {
        for &(len, src, dst) in &[(48usize, 24000u32, 32000u32), (7, 32000, 24000), (1, 48000, 16000), (1000, 44100, 24000), (3, 24000, 8000)] {
            let out = resample_f32(&vec![0.1; len], src, dst);
            assert_eq!(out.len(), (len as u64 * dst as u64 / src as u64) as usize, "{} @ {} -> {}", len, src, dst);
        }
    }

    #[test]
    fn test_too_short_for_output_is_empty() {
        // floor(1 * 16000 / 48000) == 0
        assert!(resample_f32(&[0.3], 48000, 16000).is_empty());
    }

    #[test]
    fn test_round_trip_within_interpolation_error() {
        let original = sine(2400, 24000, 200.0);
        let up = resample_f32(&original, 24000, 32000);
        let down = resample_f32(&up, 32000, 24000);
        assert_eq!(down.len(), original.len());

        // Skip the held tail sample where the interpolator clamps.
        let max_err = original
            .iter()
            .zip(down.iter())
            .take(original.len() - 2)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 0.01, "round trip error {}", max_err);
    }

    #[test]
    fn test_interpolates_between_neighbours() {
        // Upsampling x2 puts new samples exactly halfway.
        let out = resample_f32(&[0.0, 1.0, 0.0], 8000, 16000);
        assert_eq!(out.len(), 6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
        assert!((out[3] - 0.5).abs() < 1e-6);
        assert_eq!(out[5], 0.0);
    }

    #[test]
    fn test_int16_matches_float_path() {
        let floats = sine(480, 24000, 300.0);
        let ints = crate::audio::pcm::f32_to_i16(&floats);
        let int_out = bytes_to_i16(&resample(&i16_to_bytes(&ints), 24000, 32000, SampleFormat::Int16));
        let float_out = resample_f32(&crate::audio::pcm::i16_to_f32(&ints), 24000, 32000);

        assert_eq!(int_out.len(), float_out.len());
        for (i, f) in int_out.iter().zip(float_out.iter()) {
            assert!((*i as f32 / 32768.0 - f).abs() <= 1.0 / 32768.0 + 1e-6);
        }
    }

    #[test]
    fn test_unaligned_int16_is_truncated() {
        let data = vec![0u8; 9]; // four whole int16 samples
        let out = resample(&data, 16000, 32000, SampleFormat::Int16);
        assert_eq!(out.len(), 8 * 2);
    }
}
