//! Mode-selected speech service.
//!
//! Built once at startup from `speech.mode`; everything downstream holds a
//! `SpeechService` and calls the [`SpeechBackend`] contract on it.

use async_trait::async_trait;
use tracing::info;

use crate::config::AppConfig;
use crate::speech::embedded::EmbeddedBackend;
use crate::speech::error::BackendError;
use crate::speech::proxy::ProxyBackend;
use crate::speech::{
    FrameStream, SessionId, SessionRequest, SpeechBackend, SpeechMode, TokenStream, VoiceInfo,
};

pub enum SpeechService {
    Embedded(EmbeddedBackend),
    Proxy(ProxyBackend),
}

impl SpeechService {
    pub fn from_config(config: &AppConfig) -> Result<Self, BackendError> {
        let service = match config.speech.mode {
            SpeechMode::Embedded => SpeechService::Embedded(EmbeddedBackend::new(config)?),
            SpeechMode::Proxy => SpeechService::Proxy(ProxyBackend::new(config)?),
        };
        info!(
            mode = %service.mode(),
            native_rate = service.get_native_sample_rate(),
            control_messages = service.supports_control_messages(),
            "Speech service selected"
        );
        Ok(service)
    }

    fn backend(&self) -> &dyn SpeechBackend {
        match self {
            SpeechService::Embedded(backend) => backend,
            SpeechService::Proxy(backend) => backend,
        }
    }
}

#[async_trait]
impl SpeechBackend for SpeechService {
    fn mode(&self) -> SpeechMode {
        self.backend().mode()
    }

    async fn initialize(&self) -> bool {
        self.backend().initialize().await
    }

    async fn create_session(&self, request: SessionRequest) -> Result<SessionId, BackendError> {
        self.backend().create_session(request).await
    }

    fn process_audio_frame(&self, session_id: &str, frame: Vec<u8>, sample_rate: u32) -> FrameStream {
        self.backend().process_audio_frame(session_id, frame, sample_rate)
    }

    fn get_text_tokens(&self, session_id: &str) -> TokenStream {
        self.backend().get_text_tokens(session_id)
    }

    fn is_session_active(&self, session_id: &str) -> bool {
        self.backend().is_session_active(session_id)
    }

    async fn close_session(&self, session_id: &str) {
        self.backend().close_session(session_id).await
    }

    async fn interrupt(&self, session_id: &str) -> Result<(), BackendError> {
        self.backend().interrupt(session_id).await
    }

    async fn get_available_voices(&self) -> Vec<VoiceInfo> {
        self.backend().get_available_voices().await
    }

    fn get_native_sample_rate(&self) -> u32 {
        self.backend().get_native_sample_rate()
    }

    fn supports_control_messages(&self) -> bool {
        self.backend().supports_control_messages()
    }

    async fn verify_connection(&self) -> bool {
        self.backend().verify_connection().await
    }

    fn active_session_count(&self) -> usize {
        self.backend().active_session_count()
    }

    async fn shutdown(&self) {
        self.backend().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selection() {
        let mut config = AppConfig::default();
        let proxy = SpeechService::from_config(&config).unwrap();
        assert_eq!(proxy.mode(), SpeechMode::Proxy);
        assert_eq!(proxy.get_native_sample_rate(), 32000);
        assert!(!proxy.supports_control_messages());

        config.speech.mode = SpeechMode::Embedded;
        let embedded = SpeechService::from_config(&config).unwrap();
        assert_eq!(embedded.mode(), SpeechMode::Embedded);
        assert!(embedded.supports_control_messages());
    }

    #[test]
    fn test_invalid_proxy_url() {
        let mut config = AppConfig::default();
        config.proxy.server_url = "not a url".to_string();
        assert!(matches!(
            SpeechService::from_config(&config),
            Err(BackendError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_embedded_lifecycle_through_facade() {
        let mut config = AppConfig::default();
        config.speech.mode = SpeechMode::Embedded;
        config.embedded.warmup_on_start = false;
        let service = SpeechService::from_config(&config).unwrap();

        assert!(service.initialize().await);
        let id = service.create_session(SessionRequest::default()).await.unwrap();
        assert!(service.is_session_active(&id));
        assert_eq!(service.active_session_count(), 1);

        service.close_session(&id).await;
        assert!(!service.is_session_active(&id));
        assert_eq!(service.active_session_count(), 0);
    }
}
