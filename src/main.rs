//! # Duplex Voice Bridge - Main Application Entry Point
//!
//! Actix-web server that bridges client WebSocket conversations to a
//! full-duplex speech model, either running in-process or behind a remote
//! model server.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, `APP__*` environment)
//! - **state**: shared application state, HTTP and voice-session metrics
//! - **health**: health, metrics and voice status endpoints
//! - **middleware**: request logging and per-endpoint metrics
//! - **audio**: PCM formats, resampling and the wire audio codec
//! - **protocol**: client JSON messages, backend binary frames and the translator between them
//! - **speech**: the backend session contract and its embedded and proxy strategies
//! - **duplex**: the per-connection orchestrator
//! - **websocket**: the `/ws/voice` actor
//!
//! ## Startup:
//! 1. Load and validate configuration
//! 2. Bind the speech service selected by `speech.mode` and initialize it
//! 3. Serve HTTP until SIGINT / SIGTERM
//! 4. Stop the server, then close every live backend session

mod audio;
mod config;
mod device;
mod duplex;
mod error;
mod health;
mod middleware;
mod protocol;
mod speech;
mod state;
mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::speech::{SpeechBackend, SpeechService};
use crate::state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        mode = %config.speech.mode,
        codec = config.speech.codec.as_str(),
        "Configuration loaded"
    );

    let speech = Arc::new(SpeechService::from_config(&config)?);
    if !speech.initialize().await {
        // Sessions will be refused until the backend is usable; health reports it.
        warn!(mode = %speech.mode(), "Speech backend failed to initialize");
    }

    let app_state = AppState::new(config.clone(), Arc::clone(&speech));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/voice/status", web::get().to(health::voice_status))
                    .route("/voice/voices", web::get().to(health::list_voices)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    speech.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duplex_voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
                if tokio::signal::ctrl_c().await.is_ok() {
                    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
