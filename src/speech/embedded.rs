//! # Embedded Strategy
//!
//! Runs the speech model in-process, one model state per conversation.
//!
//! ## Per-Frame Pipeline:
//! 1. Decode the wire payload (the same codec payload the proxy strategy forwards)
//! 2. Resample from the payload rate to the model's native rate
//! 3. Accumulate samples until a full model frame (`native_rate / frame_rate`) is available
//! 4. Encode to codes, step the model, split channel 0 (text) from the audio channels
//! 5. Decode audio codes to PCM, resample to the codec rate, re-encode for the wire
//!
//! All model and codec work runs on the blocking pool so a slow step never
//! stalls another session's socket I/O.
//!
//! ## Admission Control:
//! `max_concurrent_sessions` is enforced when the session is reserved, before
//! the persona is loaded. Over the cap, creation fails immediately.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use async_trait::async_trait;
use candle_core::{DType, Device};
use futures_util::stream;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::audio::codec::CodecKind;
use crate::audio::resampler::resample_f32;
use crate::config::{AppConfig, EmbeddedConfig};
use crate::device::DeviceManager;
use crate::protocol::frame::BackendFrame;
use crate::protocol::translator::{ProtocolTranslator, TranslatorConfig};
use crate::speech::error::BackendError;
use crate::speech::runtime::{self, GenerationParams, ModelProvider, NeuralCodec, SpeechModel};
use crate::speech::session::{new_session_id, SessionTable, TokenBacklog};
use crate::speech::{
    FrameStream, PersonaConfig, SessionId, SessionRequest, SpeechBackend, SpeechMode, TokenStream, VoiceInfo,
};

pub struct EmbeddedBackend {
    settings: EmbeddedConfig,
    native_rate: u32,
    codec: CodecKind,
    defaults: PersonaConfig,
    voices: Vec<VoiceInfo>,
    provider: Arc<dyn ModelProvider>,
    /// Set once the runtime is loaded. Concurrent first callers share one load.
    device: OnceCell<Device>,
    sessions: SessionTable<EmbeddedSession>,
}

struct EmbeddedSession {
    id: SessionId,
    pipeline: Arc<Mutex<Pipeline>>,
    backlog: Arc<TokenBacklog>,
    active: AtomicBool,
}

impl EmbeddedSession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Everything one frame step touches. Owned by exactly one session.
struct Pipeline {
    model: Box<dyn SpeechModel>,
    encoder: Box<dyn NeuralCodec>,
    decoder: Box<dyn NeuralCodec>,
    translator: ProtocolTranslator,
    pending: Vec<f32>,
    frame_size: usize,
    native_rate: u32,
    device: Device,
}

#[derive(Debug, Default)]
struct StepOutput {
    audio: Vec<Vec<u8>>,
    tokens: Vec<String>,
}

impl Pipeline {
    /// Step every whole frame buffered so far. A failing step drops only its
    /// own frame; output from the other frames is still returned.
    fn process(&mut self, payload: &[u8], sample_rate: u32, provider: &dyn ModelProvider) -> StepOutput {
        let samples = self.translator.decode_audio(payload);
        let native = resample_f32(&samples, sample_rate, self.native_rate);
        self.pending.extend_from_slice(&native);

        let mut output = StepOutput::default();
        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            if let Err(e) = self.step_frame(frame, provider, &mut output) {
                warn!(error = %e, "Model step failed, dropping frame");
            }
        }
        output
    }

    fn step_frame(&mut self, frame: Vec<f32>, provider: &dyn ModelProvider, output: &mut StepOutput) -> Result<(), BackendError> {
        let pcm = runtime::pcm_tensor(frame, &self.device)?;
        let codes = self.encoder.encode(&pcm)?;

        let Some(out) = self.model.step(&codes)? else {
            return Ok(());
        };

        let (_, channels, _) = out.dims3()?;
        let text_ids = out.narrow(1, 0, 1)?.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        output
            .tokens
            .extend(text_ids.into_iter().filter_map(|id| provider.text_piece(id)));

        if channels > 1 {
            let audio_codes = out.narrow(1, 1, channels - 1)?;
            let pcm = runtime::tensor_pcm(&self.decoder.decode(&audio_codes)?)?;
            let wire = resample_f32(&pcm, self.native_rate, self.translator.codec_rate());
            let payload = self.translator.encode_audio(&wire);
            if !payload.is_empty() {
                output.audio.push(payload);
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), BackendError> {
        self.pending.clear();
        self.translator.reset();
        self.model.reset_stream()
    }
}

impl EmbeddedBackend {
    pub fn new(config: &AppConfig) -> Result<Self, BackendError> {
        let provider = runtime::provider_for(
            &config.embedded.runtime,
            config.speech.personaplex_sample_rate,
            config.embedded.frame_rate,
        )?;
        Ok(Self::with_provider(config, provider))
    }

    pub fn with_provider(config: &AppConfig, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            settings: config.embedded.clone(),
            native_rate: provider.sample_rate(),
            codec: config.speech.codec,
            defaults: config.persona.clone(),
            voices: config.voices.clone(),
            provider,
            device: OnceCell::new(),
            sessions: SessionTable::bounded(config.embedded.max_concurrent_sessions),
        }
    }

    /// Samples per model step at the native rate.
    pub fn frame_size(&self) -> usize {
        (self.native_rate as f64 / self.provider.frame_rate()).round() as usize
    }

    fn voice_path(&self, voice: &str) -> Option<PathBuf> {
        let dir = self.settings.voice_prompt_dir.as_ref()?;
        let path = dir.join(voice);
        if path.exists() {
            Some(path)
        } else {
            warn!(voice, dir = %dir.display(), "Voice embedding not found, using the runtime default voice");
            None
        }
    }

    fn translator_config(&self) -> TranslatorConfig {
        TranslatorConfig {
            native_rate: self.native_rate,
            client_rate: self.native_rate,
            codec: self.codec,
        }
    }

    fn build_pipeline(
        provider: &dyn ModelProvider,
        device: Device,
        persona: &PersonaConfig,
        voice: Option<PathBuf>,
        translator: TranslatorConfig,
        frame_size: usize,
    ) -> Result<Pipeline, BackendError> {
        if frame_size == 0 {
            return Err(BackendError::Model("model frame rate leaves no samples per frame".to_string()));
        }
        let mut model = provider.new_model(&GenerationParams::from(persona), &device)?;
        model.load_persona(voice.as_deref(), persona.wrapped_system_prompt().as_deref())?;
        model.reset_stream()?;

        let native_rate = translator.native_rate;
        let mut translator = ProtocolTranslator::new(translator);
        translator.reset();

        Ok(Pipeline {
            model,
            encoder: provider.new_codec(&device)?,
            decoder: provider.new_codec(&device)?,
            translator,
            pending: Vec::with_capacity(frame_size * 2),
            frame_size,
            native_rate,
            device,
        })
    }

    /// Step a throwaway model over silence so first-session latency is paid up front.
    fn warm_up(
        provider: &dyn ModelProvider,
        device: Device,
        persona: &PersonaConfig,
        translator: TranslatorConfig,
        frame_size: usize,
        iterations: usize,
    ) -> Result<(), BackendError> {
        let mut pipeline = Self::build_pipeline(provider, device, persona, None, translator, frame_size)?;

        let mut output = StepOutput::default();
        for _ in 0..iterations {
            pipeline.step_frame(vec![0.0f32; frame_size], provider, &mut output)?;
        }
        Ok(())
    }

    /// Load the runtime onto the configured device and optionally warm it up.
    async fn load_runtime(&self) -> Result<Device, BackendError> {
        let device = DeviceManager::get_device(self.settings.device);
        info!(
            runtime = self.provider.name(),
            device = %DeviceManager::get_device_info(&device),
            native_rate = self.native_rate,
            frame_size = self.frame_size(),
            "Initializing embedded speech runtime"
        );

        let provider = Arc::clone(&self.provider);
        let load_device = device.clone();
        tokio::task::spawn_blocking(move || provider.load(&load_device))
            .await
            .map_err(|e| BackendError::Model(format!("runtime load task failed: {}", e)))??;

        if self.settings.warmup_on_start {
            let provider = Arc::clone(&self.provider);
            let warm_device = device.clone();
            let persona = self.defaults.clone();
            let translator = self.translator_config();
            let frame_size = self.frame_size();
            let iterations = self.settings.warmup_iterations;

            let result = tokio::task::spawn_blocking(move || {
                Self::warm_up(provider.as_ref(), warm_device, &persona, translator, frame_size, iterations)
            })
            .await;

            // Warm-up failures only cost latency.
            match result {
                Ok(Ok(())) => debug!(iterations, "Speech runtime warmed up"),
                Ok(Err(e)) => warn!(error = %e, "Warm-up failed"),
                Err(e) => warn!(error = %e, "Warm-up task failed"),
            }
        }

        Ok(device)
    }
}

#[async_trait]
impl SpeechBackend for EmbeddedBackend {
    fn mode(&self) -> SpeechMode {
        SpeechMode::Embedded
    }

    async fn initialize(&self) -> bool {
        match self.device.get_or_try_init(|| self.load_runtime()).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to load speech runtime");
                false
            }
        }
    }

    async fn create_session(&self, request: SessionRequest) -> Result<SessionId, BackendError> {
        let device = self.device.get().cloned().ok_or(BackendError::NotInitialized)?;
        let reservation = self.sessions.try_reserve()?;

        let persona = request.resolve(&self.defaults);
        let session_id = new_session_id();
        let voice = self.voice_path(&persona.voice_prompt);
        let provider = Arc::clone(&self.provider);
        let translator = self.translator_config();
        let frame_size = self.frame_size();

        info!(
            session_id = %session_id,
            voice = %persona.voice_prompt,
            seed = ?persona.seed,
            "Creating embedded speech session"
        );

        let pipeline = tokio::task::spawn_blocking(move || {
            Self::build_pipeline(provider.as_ref(), device, &persona, voice, translator, frame_size)
        })
        .await
        .map_err(|e| BackendError::Model(format!("session setup task failed: {}", e)))??;

        let session = Arc::new(EmbeddedSession {
            id: session_id.clone(),
            pipeline: Arc::new(Mutex::new(pipeline)),
            backlog: Arc::new(TokenBacklog::new()),
            active: AtomicBool::new(true),
        });
        reservation.commit(session_id.clone(), session);

        info!(session_id = %session_id, active = self.sessions.len(), "Embedded session ready");
        Ok(session_id)
    }

    fn process_audio_frame(&self, session_id: &str, frame: Vec<u8>, sample_rate: u32) -> FrameStream {
        let Some(session) = self.sessions.get(session_id) else {
            warn!(session_id, "Audio for unknown embedded session");
            return Box::pin(stream::empty());
        };
        let provider = Arc::clone(&self.provider);

        Box::pin(async_stream::stream! {
            if session.is_active() {
                let pipeline = Arc::clone(&session.pipeline);
                let result = tokio::task::spawn_blocking(move || {
                    let mut pipeline = pipeline.lock().unwrap_or_else(|e| e.into_inner());
                    pipeline.process(&frame, sample_rate, provider.as_ref())
                })
                .await;

                match result {
                    Ok(output) => {
                        for token in output.tokens {
                            session.backlog.push(token);
                        }
                        for payload in output.audio {
                            yield BackendFrame::Audio(payload);
                        }
                    }
                    Err(e) => error!(session_id = %session.id, error = %e, "Model step task failed"),
                }
            }
        })
    }

    fn get_text_tokens(&self, session_id: &str) -> TokenStream {
        match self.sessions.get(session_id) {
            Some(session) => {
                let backlog = Arc::clone(&session.backlog);
                Box::pin(stream::poll_fn(move |_| Poll::Ready(backlog.pop())))
            }
            None => Box::pin(stream::empty()),
        }
    }

    fn is_session_active(&self, session_id: &str) -> bool {
        self.sessions.get(session_id).map(|s| s.is_active()).unwrap_or(false)
    }

    async fn close_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            session.active.store(false, Ordering::SeqCst);
            info!(session_id, remaining = self.sessions.len(), "Embedded session closed");
        }
    }

    async fn interrupt(&self, session_id: &str) -> Result<(), BackendError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| BackendError::SessionNotFound(session_id.to_string()))?;

        let pipeline = Arc::clone(&session.pipeline);
        tokio::task::spawn_blocking(move || pipeline.lock().unwrap_or_else(|e| e.into_inner()).reset())
            .await
            .map_err(|e| BackendError::Model(e.to_string()))??;

        debug!(session_id, "Model stream reset on interrupt");
        Ok(())
    }

    async fn get_available_voices(&self) -> Vec<VoiceInfo> {
        self.voices
            .iter()
            .cloned()
            .map(|mut voice| {
                voice.available = self
                    .settings
                    .voice_prompt_dir
                    .as_ref()
                    .map(|dir| dir.join(&voice.id).exists());
                voice
            })
            .collect()
    }

    fn get_native_sample_rate(&self) -> u32 {
        self.native_rate
    }

    fn supports_control_messages(&self) -> bool {
        true
    }

    async fn verify_connection(&self) -> bool {
        self.device.get().is_some()
    }

    fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn shutdown(&self) {
        let sessions = self.sessions.drain();
        for (id, session) in &sessions {
            session.active.store(false, Ordering::SeqCst);
            debug!(session_id = %id, "Closing embedded session on shutdown");
        }
        info!(closed = sessions.len(), "Embedded backend shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm;
    use crate::config::AppConfig;
    use candle_core::Tensor;
    use futures_util::StreamExt;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn test_config(max_sessions: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.embedded.max_concurrent_sessions = max_sessions;
        config.embedded.warmup_on_start = false;
        config.embedded.device = crate::device::DevicePreference::Cpu;
        config
    }

    async fn ready_backend(max_sessions: usize) -> EmbeddedBackend {
        let backend = EmbeddedBackend::new(&test_config(max_sessions)).unwrap();
        assert!(backend.initialize().await);
        backend
    }

    /// Echoes audio and says "hi" once per step.
    struct TalkingProvider;

    struct TalkingModel;

    impl SpeechModel for TalkingModel {
        fn load_persona(&mut self, _voice: Option<&Path>, _prompt: Option<&str>) -> Result<(), BackendError> {
            Ok(())
        }

        fn reset_stream(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        fn step(&mut self, codes: &Tensor) -> Result<Option<Tensor>, BackendError> {
            let (_, _, steps) = codes.dims3()?;
            let mut text = vec![0f32; steps];
            text[0] = 1.0;
            let text = Tensor::from_vec(text, (1, 1, steps), codes.device())?;
            Ok(Some(Tensor::cat(&[&text, codes], 1)?))
        }
    }

    impl ModelProvider for TalkingProvider {
        fn name(&self) -> &str {
            "talking"
        }
        fn sample_rate(&self) -> u32 {
            32000
        }
        fn frame_rate(&self) -> f64 {
            12.5
        }
        fn load(&self, _device: &Device) -> Result<(), BackendError> {
            Ok(())
        }
        fn new_model(&self, _params: &GenerationParams, _device: &Device) -> Result<Box<dyn SpeechModel>, BackendError> {
            Ok(Box::new(TalkingModel))
        }
        fn new_codec(&self, device: &Device) -> Result<Box<dyn NeuralCodec>, BackendError> {
            runtime::LoopbackProvider::new(32000, 12.5).new_codec(device)
        }
        fn text_piece(&self, token: u32) -> Option<String> {
            (token == 1).then(|| "hi".to_string())
        }
    }

    /// Talks like `TalkingModel` but fails its second step.
    struct FlakyModel {
        steps: usize,
    }

    impl SpeechModel for FlakyModel {
        fn load_persona(&mut self, _voice: Option<&Path>, _prompt: Option<&str>) -> Result<(), BackendError> {
            Ok(())
        }

        fn reset_stream(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        fn step(&mut self, codes: &Tensor) -> Result<Option<Tensor>, BackendError> {
            self.steps += 1;
            if self.steps == 2 {
                return Err(BackendError::Model("step diverged".to_string()));
            }
            TalkingModel.step(codes)
        }
    }

    struct FlakyProvider;

    impl ModelProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }
        fn sample_rate(&self) -> u32 {
            32000
        }
        fn frame_rate(&self) -> f64 {
            12.5
        }
        fn load(&self, _device: &Device) -> Result<(), BackendError> {
            Ok(())
        }
        fn new_model(&self, _params: &GenerationParams, _device: &Device) -> Result<Box<dyn SpeechModel>, BackendError> {
            Ok(Box::new(FlakyModel { steps: 0 }))
        }
        fn new_codec(&self, device: &Device) -> Result<Box<dyn NeuralCodec>, BackendError> {
            TalkingProvider.new_codec(device)
        }
        fn text_piece(&self, token: u32) -> Option<String> {
            TalkingProvider.text_piece(token)
        }
    }

    /// Loopback runtime that counts loads and takes a while to load.
    struct SlowLoadProvider {
        inner: runtime::LoopbackProvider,
        loads: AtomicUsize,
    }

    impl ModelProvider for SlowLoadProvider {
        fn name(&self) -> &str {
            "slow-load"
        }
        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }
        fn frame_rate(&self) -> f64 {
            self.inner.frame_rate()
        }
        fn load(&self, device: &Device) -> Result<(), BackendError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            self.inner.load(device)
        }
        fn new_model(&self, params: &GenerationParams, device: &Device) -> Result<Box<dyn SpeechModel>, BackendError> {
            self.inner.new_model(params, device)
        }
        fn new_codec(&self, device: &Device) -> Result<Box<dyn NeuralCodec>, BackendError> {
            self.inner.new_codec(device)
        }
        fn text_piece(&self, token: u32) -> Option<String> {
            self.inner.text_piece(token)
        }
    }

    #[tokio::test]
    async fn test_create_before_initialize_fails() {
        let backend = EmbeddedBackend::new(&test_config(1)).unwrap();
        assert_eq!(
            backend.create_session(SessionRequest::default()).await,
            Err(BackendError::NotInitialized)
        );
        assert!(!backend.verify_connection().await);
    }

    #[tokio::test]
    async fn test_admission_limit_of_one() {
        let backend = ready_backend(1).await;
        let first = backend.create_session(SessionRequest::default()).await.unwrap();

        let err = backend.create_session(SessionRequest::default()).await.unwrap_err();
        assert_eq!(err, BackendError::AdmissionLimitExceeded { limit: 1 });
        assert!(err.to_string().contains("(1)"));

        backend.close_session(&first).await;
        let second = backend.create_session(SessionRequest::default()).await.unwrap();
        assert!(backend.create_session(SessionRequest::default()).await.is_err());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_frame_round_trip_through_loopback() {
        let backend = ready_backend(2).await;
        assert_eq!(backend.frame_size(), 2560);
        let id = backend.create_session(SessionRequest::default()).await.unwrap();

        // 80 ms at the 24 kHz codec rate fills exactly one 32 kHz model frame.
        let payload = pcm::f32_to_bytes(&vec![0.25f32; 1920]);
        let frames: Vec<BackendFrame> = backend.process_audio_frame(&id, payload, 24000).collect().await;

        assert_eq!(frames.len(), 1);
        match &frames[0] {
            BackendFrame::Audio(out) => {
                let samples = pcm::bytes_to_f32(out);
                assert_eq!(samples.len(), 1920);
                assert!(samples.iter().all(|&s| (s - 0.25).abs() < 1e-6));
            }
            other => panic!("expected audio, got {:?}", other),
        }

        // Loopback produces no text.
        assert_eq!(backend.get_text_tokens(&id).count().await, 0);
    }

    #[tokio::test]
    async fn test_partial_frames_are_buffered() {
        let backend = ready_backend(1).await;
        let id = backend.create_session(SessionRequest::default()).await.unwrap();

        let half = pcm::f32_to_bytes(&vec![0.0f32; 960]);
        assert_eq!(backend.process_audio_frame(&id, half.clone(), 24000).count().await, 0);
        assert_eq!(backend.process_audio_frame(&id, half, 24000).count().await, 1);
    }

    #[tokio::test]
    async fn test_text_channel_goes_to_backlog() {
        let backend = EmbeddedBackend::with_provider(&test_config(1), Arc::new(TalkingProvider));
        assert!(backend.initialize().await);
        let id = backend.create_session(SessionRequest::default()).await.unwrap();

        let payload = pcm::f32_to_bytes(&vec![0.1f32; 3840]);
        assert_eq!(backend.process_audio_frame(&id, payload, 24000).count().await, 2);

        let tokens: Vec<String> = backend.get_text_tokens(&id).collect().await;
        assert_eq!(tokens, vec!["hi".to_string(), "hi".to_string()]);
        assert_eq!(backend.get_text_tokens(&id).count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_step_keeps_other_frames() {
        let backend = EmbeddedBackend::with_provider(&test_config(1), Arc::new(FlakyProvider));
        assert!(backend.initialize().await);
        let id = backend.create_session(SessionRequest::default()).await.unwrap();

        // Three model frames in one chunk; the middle step fails.
        let payload = pcm::f32_to_bytes(&vec![0.1f32; 5760]);
        let frames: Vec<BackendFrame> = backend.process_audio_frame(&id, payload, 24000).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| matches!(f, BackendFrame::Audio(p) if !p.is_empty())));

        let tokens: Vec<String> = backend.get_text_tokens(&id).collect().await;
        assert_eq!(tokens, vec!["hi".to_string(), "hi".to_string()]);
        assert!(backend.is_session_active(&id));

        // The session keeps stepping afterwards.
        let payload = pcm::f32_to_bytes(&vec![0.1f32; 1920]);
        assert_eq!(backend.process_audio_frame(&id, payload, 24000).count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_loads_once() {
        let provider = Arc::new(SlowLoadProvider {
            inner: runtime::LoopbackProvider::new(32000, 12.5),
            loads: AtomicUsize::new(0),
        });
        let backend = EmbeddedBackend::with_provider(&test_config(1), Arc::clone(&provider) as Arc<dyn ModelProvider>);

        let (first, second) = tokio::join!(backend.initialize(), backend.initialize());
        assert!(first && second);
        assert!(backend.initialize().await);
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);
        assert!(backend.verify_connection().await);
    }

    #[tokio::test]
    async fn test_zero_sample_frames_are_rejected() {
        let provider = Arc::new(runtime::LoopbackProvider::new(32000, 100_000.0));
        let backend = EmbeddedBackend::with_provider(&test_config(1), provider);
        assert_eq!(backend.frame_size(), 0);
        assert!(backend.initialize().await);

        let err = backend.create_session(SessionRequest::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::Model(_)));
        assert_eq!(backend.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_exactly_once() {
        let backend = ready_backend(1).await;
        let id = backend.create_session(SessionRequest::default()).await.unwrap();
        assert!(backend.is_session_active(&id));

        backend.close_session(&id).await;
        backend.close_session(&id).await;
        assert!(!backend.is_session_active(&id));
        assert_eq!(backend.active_session_count(), 0);

        let frames = backend.process_audio_frame(&id, vec![0; 16], 24000).count().await;
        assert_eq!(frames, 0);
        assert!(matches!(backend.interrupt(&id).await, Err(BackendError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_interrupt_drops_buffered_audio() {
        let backend = ready_backend(1).await;
        let id = backend.create_session(SessionRequest::default()).await.unwrap();

        let half = pcm::f32_to_bytes(&vec![0.0f32; 960]);
        assert_eq!(backend.process_audio_frame(&id, half.clone(), 24000).count().await, 0);
        backend.interrupt(&id).await.unwrap();
        assert_eq!(backend.process_audio_frame(&id, half, 24000).count().await, 0);
        assert!(backend.is_session_active(&id));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let backend = ready_backend(3).await;
        for _ in 0..3 {
            backend.create_session(SessionRequest::default()).await.unwrap();
        }
        backend.shutdown().await;
        assert_eq!(backend.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_voices_without_prompt_dir() {
        let backend = ready_backend(1).await;
        let voices = backend.get_available_voices().await;
        assert!(!voices.is_empty());
        assert!(voices.iter().all(|v| v.available.is_none()));
    }
}
