//! # Speech Backends
//!
//! The session contract shared by every way of reaching the speech model,
//! and its two implementations.
//!
//! ## Strategies:
//! - **Embedded**: drives a model runtime in-process (GPU when available)
//! - **Proxy**: keeps one persistent socket per session to a remote model server
//!
//! [`SpeechService`] binds one of them at startup so callers never branch on mode.
//!
//! ## Session Contract:
//! - `create_session` fails fast with [`BackendError::AdmissionLimitExceeded`]
//!   or [`BackendError::Connection`]
//! - `process_audio_frame` returns a lazy, finite stream of output frames for
//!   that one input frame; nothing happens until it is polled
//! - `get_text_tokens` never waits: it yields what is buffered and ends
//! - `close_session` releases backend resources exactly once; later calls are no-ops

pub mod embedded;
pub mod error;
pub mod proxy;
pub mod runtime;
pub mod service;
pub mod session;
pub mod transport;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::protocol::frame::BackendFrame;

pub use error::BackendError;
pub use service::SpeechService;

/// Opaque session identifier.
pub type SessionId = String;

/// Output frames for one input frame.
pub type FrameStream = Pin<Box<dyn Stream<Item = BackendFrame> + Send>>;

/// Buffered text tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeechMode {
    Embedded,
    #[default]
    Proxy,
}

impl fmt::Display for SpeechMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeechMode::Embedded => write!(f, "embedded"),
            SpeechMode::Proxy => write!(f, "proxy"),
        }
    }
}

/// Voice, role prompt and generation parameters for one conversation.
///
/// The configured persona acts as the default; a [`SessionRequest`] overrides
/// individual fields. Immutable once a session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// Voice embedding file name, e.g. `NATF2.pt`
    pub voice_prompt: String,
    /// System / role text
    pub text_prompt: String,
    pub temperature: f64,
    pub temperature_text: f64,
    pub top_k: usize,
    pub top_k_text: usize,
    pub seed: Option<u64>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            voice_prompt: "NATF2.pt".to_string(),
            text_prompt: String::new(),
            temperature: 0.8,
            temperature_text: 0.7,
            top_k: 250,
            top_k_text: 25,
            seed: None,
        }
    }
}

impl PersonaConfig {
    /// System prompt in the form the model was trained on.
    pub fn wrapped_system_prompt(&self) -> Option<String> {
        let prompt = self.text_prompt.trim();
        if prompt.is_empty() {
            None
        } else {
            Some(format!("<system> {} <system>", prompt))
        }
    }
}

/// Per-session persona overrides supplied by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionRequest {
    pub voice_prompt: Option<String>,
    pub text_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl SessionRequest {
    /// Apply the overrides on top of `defaults`.
    pub fn resolve(&self, defaults: &PersonaConfig) -> PersonaConfig {
        let mut persona = defaults.clone();
        if let Some(voice) = self.voice_prompt.as_ref().filter(|v| !v.is_empty()) {
            persona.voice_prompt = voice.clone();
        }
        if let Some(prompt) = &self.text_prompt {
            persona.text_prompt = prompt.clone();
        }
        if self.seed.is_some() {
            persona.seed = self.seed;
        }
        persona
    }
}

/// A selectable voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Whether the voice embedding was found locally; unknown for remote backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
}

/// The session contract every strategy satisfies.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn mode(&self) -> SpeechMode;

    /// Prepare the backend. `false` means the service cannot take sessions.
    async fn initialize(&self) -> bool;

    async fn create_session(&self, request: SessionRequest) -> Result<SessionId, BackendError>;

    /// Feed one codec payload at `sample_rate`; the stream yields its output frames.
    fn process_audio_frame(&self, session_id: &str, frame: Vec<u8>, sample_rate: u32) -> FrameStream;

    fn get_text_tokens(&self, session_id: &str) -> TokenStream;

    /// False once the session is closed or its backend connection dropped.
    fn is_session_active(&self, session_id: &str) -> bool;

    async fn close_session(&self, session_id: &str);

    async fn interrupt(&self, session_id: &str) -> Result<(), BackendError>;

    async fn get_available_voices(&self) -> Vec<VoiceInfo>;

    fn get_native_sample_rate(&self) -> u32;

    /// Whether `interrupt` reaches the model.
    fn supports_control_messages(&self) -> bool;

    async fn verify_connection(&self) -> bool;

    fn active_session_count(&self) -> usize;

    /// Close every live session.
    async fn shutdown(&self);
}
