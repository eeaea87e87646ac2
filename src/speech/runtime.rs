//! # Speech Model Runtime
//!
//! The seam between the embedded strategy and whatever actually runs the
//! speech model. The strategy only ever asks a runtime to load a persona,
//! reset its stream and step one frame of codes; how codes are produced is
//! the runtime's business.
//!
//! ## Tensor Layout:
//! - PCM frames: `[1, 1, samples]` f32
//! - Model input codes: whatever [`NeuralCodec::encode`] returns
//! - Model output codes: `[1, channels, steps]`, channel 0 carries text
//!   token ids and the remaining channels carry audio codes
//!
//! The built-in `loopback` runtime is a stand-in that echoes the input audio
//! and never produces text. It keeps the full pipeline runnable on any host.

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::speech::error::BackendError;
use crate::speech::PersonaConfig;

/// Sampling parameters handed to a model at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub temperature_text: f64,
    pub top_k: usize,
    pub top_k_text: usize,
    pub seed: Option<u64>,
}

impl From<&PersonaConfig> for GenerationParams {
    fn from(persona: &PersonaConfig) -> Self {
        Self {
            temperature: persona.temperature,
            temperature_text: persona.temperature_text,
            top_k: persona.top_k,
            top_k_text: persona.top_k_text,
            seed: persona.seed,
        }
    }
}

/// One conversation's model state.
pub trait SpeechModel: Send {
    /// Condition the model on a voice embedding and a wrapped system prompt.
    fn load_persona(&mut self, voice: Option<&Path>, system_prompt: Option<&str>) -> Result<(), BackendError>;

    /// Start a fresh stream, dropping any in-flight generation.
    fn reset_stream(&mut self) -> Result<(), BackendError>;

    /// Advance one frame. `None` while the model is still buffering.
    fn step(&mut self, codes: &Tensor) -> Result<Option<Tensor>, BackendError>;
}

/// Audio tokenizer used around the model.
pub trait NeuralCodec: Send {
    fn encode(&mut self, pcm: &Tensor) -> Result<Tensor, BackendError>;
    fn decode(&mut self, codes: &Tensor) -> Result<Tensor, BackendError>;
}

/// Factory for models and codecs of one runtime.
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Native PCM rate of the model.
    fn sample_rate(&self) -> u32;

    /// Model frames per second.
    fn frame_rate(&self) -> f64;

    /// Load shared weights onto `device`. Called once at initialization.
    fn load(&self, device: &Device) -> Result<(), BackendError>;

    fn new_model(&self, params: &GenerationParams, device: &Device) -> Result<Box<dyn SpeechModel>, BackendError>;

    fn new_codec(&self, device: &Device) -> Result<Box<dyn NeuralCodec>, BackendError>;

    /// Text for a token id; `None` for padding and special tokens.
    fn text_piece(&self, token: u32) -> Option<String>;
}

/// Build the provider named by the `embedded.runtime` setting.
pub fn provider_for(name: &str, sample_rate: u32, frame_rate: f64) -> Result<Arc<dyn ModelProvider>, BackendError> {
    match name {
        "loopback" => Ok(Arc::new(LoopbackProvider::new(sample_rate, frame_rate))),
        other => Err(BackendError::Model(format!("Unknown speech runtime '{}'", other))),
    }
}

/// Wrap PCM samples as a `[1, 1, T]` tensor.
pub fn pcm_tensor(samples: Vec<f32>, device: &Device) -> Result<Tensor, BackendError> {
    let len = samples.len();
    Ok(Tensor::from_vec(samples, (1, 1, len), device)?)
}

/// Flatten a PCM tensor back to samples.
pub fn tensor_pcm(tensor: &Tensor) -> Result<Vec<f32>, BackendError> {
    Ok(tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

/// Echo runtime.
#[derive(Debug, Clone)]
pub struct LoopbackProvider {
    sample_rate: u32,
    frame_rate: f64,
}

impl LoopbackProvider {
    pub fn new(sample_rate: u32, frame_rate: f64) -> Self {
        Self { sample_rate, frame_rate }
    }
}

impl ModelProvider for LoopbackProvider {
    fn name(&self) -> &str {
        "loopback"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn load(&self, device: &Device) -> Result<(), BackendError> {
        info!(device = ?device, "Loopback runtime ready");
        Ok(())
    }

    fn new_model(&self, params: &GenerationParams, _device: &Device) -> Result<Box<dyn SpeechModel>, BackendError> {
        debug!(temperature = params.temperature, top_k = params.top_k, "Creating loopback model");
        Ok(Box::new(LoopbackModel::default()))
    }

    fn new_codec(&self, _device: &Device) -> Result<Box<dyn NeuralCodec>, BackendError> {
        Ok(Box::new(LoopbackCodec))
    }

    fn text_piece(&self, _token: u32) -> Option<String> {
        None
    }
}

#[derive(Debug, Default)]
struct LoopbackModel {
    steps: u64,
}

impl SpeechModel for LoopbackModel {
    fn load_persona(&mut self, voice: Option<&Path>, system_prompt: Option<&str>) -> Result<(), BackendError> {
        debug!(voice = ?voice, has_prompt = system_prompt.is_some(), "Loopback persona loaded");
        Ok(())
    }

    fn reset_stream(&mut self) -> Result<(), BackendError> {
        self.steps = 0;
        Ok(())
    }

    fn step(&mut self, codes: &Tensor) -> Result<Option<Tensor>, BackendError> {
        self.steps += 1;
        let text = codes.zeros_like()?;
        Ok(Some(Tensor::cat(&[&text, codes], 1)?))
    }
}

/// Codes are the PCM itself.
#[derive(Debug, Default)]
struct LoopbackCodec;

impl NeuralCodec for LoopbackCodec {
    fn encode(&mut self, pcm: &Tensor) -> Result<Tensor, BackendError> {
        Ok(pcm.clone())
    }

    fn decode(&mut self, codes: &Tensor) -> Result<Tensor, BackendError> {
        Ok(codes.narrow(1, 0, 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_step_layout() {
        let provider = LoopbackProvider::new(32000, 12.5);
        let device = Device::Cpu;
        let mut codec = provider.new_codec(&device).unwrap();
        let mut model = provider
            .new_model(&GenerationParams::from(&PersonaConfig::default()), &device)
            .unwrap();

        let pcm = pcm_tensor(vec![0.5; 2560], &device).unwrap();
        let codes = codec.encode(&pcm).unwrap();
        let out = model.step(&codes).unwrap().unwrap();
        assert_eq!(out.dims3().unwrap(), (1, 2, 2560));

        let audio = codec.decode(&out.narrow(1, 1, 1).unwrap()).unwrap();
        let samples = tensor_pcm(&audio).unwrap();
        assert_eq!(samples.len(), 2560);
        assert!(samples.iter().all(|&s| s == 0.5));

        let text = tensor_pcm(&out.narrow(1, 0, 1).unwrap()).unwrap();
        assert!(text.iter().all(|&t| t == 0.0));
    }

    #[test]
    fn test_unknown_runtime() {
        assert!(provider_for("loopback", 32000, 12.5).is_ok());
        match provider_for("moshi-cuda", 32000, 12.5) {
            Err(BackendError::Model(msg)) => assert!(msg.contains("moshi-cuda")),
            _ => panic!("expected model error"),
        }
    }

    #[test]
    fn test_generation_params_from_persona() {
        let persona = PersonaConfig {
            seed: Some(7),
            ..PersonaConfig::default()
        };
        let params = GenerationParams::from(&persona);
        assert_eq!(params.top_k_text, 25);
        assert_eq!(params.seed, Some(7));
    }
}
