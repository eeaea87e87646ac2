//! # Application State
//!
//! Shared by every HTTP handler and WebSocket actor through `web::Data`.
//!
//! ## Contents:
//! - **config**: the validated configuration the server started with
//! - **metrics**: per-endpoint HTTP counters plus voice-session counters
//! - **speech**: the speech service bound at startup (one strategy, chosen by mode)
//!
//! ## Locking:
//! Metrics sit behind a `RwLock`; every write is a short counter update, and
//! reads clone a snapshot so no lock is held while a response is serialized.
//! A poisoned lock is recovered rather than propagated, since counters stay
//! meaningful after a panicking writer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::Serialize;

use crate::config::AppConfig;
use crate::duplex::{ExitReason, SessionSummary};
use crate::speech::SpeechService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub speech: Arc<SpeechService>,
    pub start_time: Instant,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub voice: VoiceMetrics,
    /// Key: `"{method} {path}"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Counters for `/ws/voice` conversations.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceMetrics {
    pub sessions_opened: u64,
    pub sessions_active: u64,
    /// Refused by the backend (admission limit, unreachable server)
    pub sessions_rejected: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub transcripts: u64,
    pub interrupts: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, speech: Arc<SpeechService>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            speech,
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A client socket was upgraded and a conversation is starting.
    pub fn voice_session_opened(&self) {
        let mut metrics = self.write_metrics();
        metrics.voice.sessions_opened += 1;
        metrics.voice.sessions_active += 1;
    }

    /// Fold a finished conversation into the counters.
    pub fn voice_session_finished(&self, summary: &SessionSummary) {
        let mut metrics = self.write_metrics();
        let voice = &mut metrics.voice;

        voice.sessions_active = voice.sessions_active.saturating_sub(1);
        if matches!(summary.exit, ExitReason::Rejected(_)) {
            voice.sessions_rejected += 1;
        }
        voice.frames_in += summary.frames_in;
        voice.frames_out += summary.frames_out;
        voice.transcripts += summary.transcripts;
        voice.interrupts += summary.interrupts;
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        let config = AppConfig::default();
        let speech = SpeechService::from_config(&config).unwrap();
        AppState::new(config, Arc::new(speech))
    }

    fn summary(exit: ExitReason, frames_in: u64, frames_out: u64) -> SessionSummary {
        SessionSummary {
            session_id: None,
            exit,
            frames_in,
            frames_out,
            transcripts: 2,
            interrupts: 1,
            discarded: 0,
            duration_ms: 10,
        }
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let health = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_voice_session_counters() {
        let state = state();
        state.voice_session_opened();
        state.voice_session_opened();
        state.voice_session_finished(&summary(ExitReason::Disconnected, 10, 12));
        state.voice_session_finished(&summary(ExitReason::Rejected("full".into()), 0, 0));

        let voice = state.get_metrics_snapshot().voice;
        assert_eq!(voice.sessions_opened, 2);
        assert_eq!(voice.sessions_active, 0);
        assert_eq!(voice.sessions_rejected, 1);
        assert_eq!(voice.frames_in, 10);
        assert_eq!(voice.frames_out, 12);
        assert_eq!(voice.interrupts, 2);

        // Never underflows.
        state.voice_session_finished(&summary(ExitReason::Disconnected, 0, 0));
        assert_eq!(state.get_metrics_snapshot().voice.sessions_active, 0);
    }
}
