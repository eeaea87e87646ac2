use crate::config::AppConfig;
use crate::audio::codec;
use crate::speech::SpeechBackend;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;
use std::time::Duration;

/// Upper bound on the backend probe inside a health check.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

async fn backend_reachable(state: &AppState) -> bool {
    tokio::time::timeout(VERIFY_TIMEOUT, state.speech.verify_connection())
        .await
        .unwrap_or(false)
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let backend_ok = backend_reachable(&state).await;

    HttpResponse::Ok().json(json!({
        "status": if backend_ok { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_voice_sessions": metrics.voice.sessions_active
        },
        "speech": {
            "mode": state.speech.mode(),
            "connected": backend_ok,
            "backend_sessions": state.speech.active_session_count()
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "voice": metrics.voice,
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

pub async fn voice_status(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let native_rate = state.speech.get_native_sample_rate();

    HttpResponse::Ok().json(json!({
        "mode": state.speech.mode(),
        "native_sample_rate": native_rate,
        "client_sample_rate": config.speech.orbit_sample_rate,
        "codec": config.speech.codec.as_str(),
        "codec_sample_rate": codec::nearest_supported_rate(native_rate),
        "audio_chunk_size_ms": config.speech.audio_chunk_size_ms,
        "capabilities": {
            "full_duplex": true,
            "interruption": true,
            "control_messages": state.speech.supports_control_messages()
        },
        "active_sessions": state.speech.active_session_count(),
        "websocket": "/ws/voice"
    }))
}

pub async fn list_voices(state: web::Data<AppState>) -> HttpResponse {
    let voices = state.speech.get_available_voices().await;
    HttpResponse::Ok().json(json!({
        "voices": voices,
        "default": state.get_config().persona.voice_prompt
    }))
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "pid": pid,
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = config.embedded.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.voice.sessions_active as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.voice.sessions_active
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::SpeechService;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.speech.mode = crate::speech::SpeechMode::Embedded;
        config.embedded.warmup_on_start = false;
        let speech = SpeechService::from_config(&config).unwrap();
        AppState::new(config, Arc::new(speech))
    }

    #[actix_web::test]
    async fn test_voice_status_reports_rates() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/api/v1/voice/status", web::get().to(voice_status)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/voice/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["mode"], "embedded");
        assert_eq!(body["native_sample_rate"], 32000);
        assert_eq!(body["client_sample_rate"], 24000);
        assert_eq!(body["codec_sample_rate"], 24000);
        assert_eq!(body["capabilities"]["control_messages"], true);
    }

    #[actix_web::test]
    async fn test_health_degraded_until_initialized() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "degraded");

        assert!(state.speech.initialize().await);
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["speech"]["connected"], true);
    }

    #[actix_web::test]
    async fn test_list_voices() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/api/v1/voice/voices", web::get().to(list_voices)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/voice/voices").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["default"], "NATF2.pt");
        assert_eq!(body["voices"].as_array().unwrap().len(), 2);
    }
}
