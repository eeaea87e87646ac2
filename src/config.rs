//! # Configuration Management
//!
//! Loads the bridge configuration from layered sources:
//! - Built-in defaults (the `Default` impls below)
//! - `config.toml` in the working directory, if present
//! - Environment variables prefixed `APP`, nested with `__`
//!   (e.g. `APP__SPEECH__MODE=embedded`, `APP__PROXY__HANDSHAKE_TIMEOUT=120`)
//! - `HOST` / `PORT`, for deployment platforms that set them
//!
//! ## Sections:
//! - **server**: bind address
//! - **speech**: backend mode, sample rates, loop timings, wire codec
//! - **proxy**: remote model server connection and retry policy
//! - **embedded**: in-process runtime, device and admission limit
//! - **persona**: default voice, role prompt and generation parameters
//! - **voices**: voices advertised to clients

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::audio::codec::CodecKind;
use crate::device::DevicePreference;
use crate::speech::{PersonaConfig, SpeechMode, VoiceInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub proxy: ProxyConfig,
    pub embedded: EmbeddedConfig,
    pub persona: PersonaConfig,
    pub voices: Vec<VoiceInfo>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            speech: SpeechConfig::default(),
            proxy: ProxyConfig::default(),
            embedded: EmbeddedConfig::default(),
            persona: PersonaConfig::default(),
            voices: default_voices(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Settings shared by both backend strategies and the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub mode: SpeechMode,
    /// Client-facing sample rate
    pub orbit_sample_rate: u32,
    /// Backend model's native sample rate
    pub personaplex_sample_rate: u32,
    /// Nominal duration of one client audio chunk
    pub audio_chunk_size_ms: u64,
    /// How long the emit loop waits on an empty output queue before rechecking
    pub output_poll_ms: u64,
    /// Transcript loop period
    pub text_poll_ms: u64,
    pub codec: CodecKind,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            mode: SpeechMode::Proxy,
            orbit_sample_rate: 24000,
            personaplex_sample_rate: 32000,
            audio_chunk_size_ms: 80,
            output_poll_ms: 100,
            text_poll_ms: 100,
            codec: CodecKind::Pcm,
        }
    }
}

impl SpeechConfig {
    pub fn output_poll(&self) -> Duration {
        Duration::from_millis(self.output_poll_ms)
    }

    pub fn text_poll(&self) -> Duration {
        Duration::from_millis(self.text_poll_ms)
    }
}

/// Remote model server settings. Timeouts and delays are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server_url: String,
    pub ssl_verify: bool,
    /// TCP/TLS/upgrade budget per attempt
    pub connection_timeout: f64,
    /// Wait for the backend's ready frame per attempt. Large system prompts
    /// can take tens of seconds to tokenize, so keep this above the connect timeout.
    pub handshake_timeout: f64,
    pub reconnect_attempts: u32,
    pub reconnect_delay: f64,
    /// Per-poll wait while draining responses after sending a frame
    pub drain_poll_ms: u64,
    /// Whether the remote server understands control frames
    pub supports_control_messages: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8998/api/chat".to_string(),
            ssl_verify: true,
            connection_timeout: 30.0,
            handshake_timeout: 60.0,
            reconnect_attempts: 3,
            reconnect_delay: 1.0,
            drain_poll_ms: 10,
            supports_control_messages: false,
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connection_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        seconds(self.handshake_timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        seconds(self.reconnect_delay)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}

/// In-process runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// Runtime implementation name
    pub runtime: String,
    pub device: DevicePreference,
    /// Directory holding voice embedding files
    pub voice_prompt_dir: Option<PathBuf>,
    pub warmup_on_start: bool,
    pub warmup_iterations: usize,
    pub max_concurrent_sessions: usize,
    /// Model frames per second
    pub frame_rate: f64,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            runtime: "loopback".to_string(),
            device: DevicePreference::Auto,
            voice_prompt_dir: None,
            warmup_on_start: true,
            warmup_iterations: 4,
            max_concurrent_sessions: 4,
            frame_rate: 12.5,
        }
    }
}

/// Voices advertised when the configuration lists none.
pub fn default_voices() -> Vec<VoiceInfo> {
    let voice = |id: &str, name: &str, description: &str| VoiceInfo {
        id: id.to_string(),
        name: name.to_string(),
        category: "natural".to_string(),
        description: description.to_string(),
        available: None,
    };

    vec![
        voice("NATF2.pt", "Natural Female 2", "Warm conversational female voice"),
        voice("NATM1.pt", "Natural Male 1", "Calm conversational male voice"),
    ]
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        config.fill_defaults();
        Ok(config)
    }

    fn fill_defaults(&mut self) {
        if self.voices.is_empty() {
            self.voices = default_voices();
        }
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.speech.orbit_sample_rate == 0 || self.speech.personaplex_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.speech.audio_chunk_size_ms == 0 {
            return Err(anyhow::anyhow!("Audio chunk size must be greater than 0"));
        }

        if self.speech.output_poll_ms == 0 || self.speech.text_poll_ms == 0 {
            return Err(anyhow::anyhow!("Poll intervals must be greater than 0"));
        }

        if self.embedded.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if !(self.embedded.frame_rate.is_finite() && self.embedded.frame_rate > 0.0) {
            return Err(anyhow::anyhow!("Embedded frame rate must be a positive number"));
        }

        // A model frame has to hold at least one native sample.
        if (self.speech.personaplex_sample_rate as f64 / self.embedded.frame_rate).round() < 1.0 {
            return Err(anyhow::anyhow!(
                "Embedded frame rate {} is too high for the {} Hz native sample rate",
                self.embedded.frame_rate,
                self.speech.personaplex_sample_rate
            ));
        }

        if self.proxy.reconnect_attempts == 0 {
            return Err(anyhow::anyhow!("Reconnect attempts must be at least 1"));
        }

        for (name, value) in [
            ("connection_timeout", self.proxy.connection_timeout),
            ("handshake_timeout", self.proxy.handshake_timeout),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(anyhow::anyhow!("Proxy {} must be a positive number of seconds", name));
            }
        }

        if !(self.proxy.reconnect_delay.is_finite() && self.proxy.reconnect_delay >= 0.0) {
            return Err(anyhow::anyhow!("Proxy reconnect_delay cannot be negative"));
        }

        let url = url::Url::parse(&self.proxy.server_url)
            .map_err(|e| anyhow::anyhow!("Invalid proxy server_url '{}': {}", self.proxy.server_url, e))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(anyhow::anyhow!(
                "Proxy server_url must use ws:// or wss://, got '{}'",
                url.scheme()
            ));
        }

        if self.proxy.handshake_timeout < self.proxy.connection_timeout {
            warn!(
                handshake_timeout = self.proxy.handshake_timeout,
                connection_timeout = self.proxy.connection_timeout,
                "Handshake timeout is shorter than the connect timeout; large system prompts may time out"
            );
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let mut config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.fill_defaults();
        Ok(config)
    }
}
