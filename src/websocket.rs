//! # Voice WebSocket Handler
//!
//! Clients connect to `/ws/voice` and hold a full-duplex conversation with
//! the speech backend. Each connection is one actor, and each actor runs
//! one [`FullDuplexSession`] on a spawned task.
//!
//! ## Connection Flow:
//! 1. **Upgrade**: optional query parameters (`voice_prompt`, `text_prompt`,
//!    `seed`) override the configured persona for this conversation
//! 2. **Session**: the backend session is created; the client receives
//!    `connected` (or `error` followed by a close if the backend refuses)
//! 3. **Streaming**: client JSON messages (`audio_chunk`, `interrupt`,
//!    `ping`, `end`) go in, `audio_chunk` / `transcription` / `interrupted`
//!    come out, both directions at once
//! 4. **Close**: either side closing tears the backend session down
//!
//! ## Bridging:
//! The actor owns the socket. It forwards parsed client messages into the
//! session's inbound channel and writes whatever the session sends back.
//! When the session ends its outbound channel closes and the actor stops;
//! when the socket closes the actor drops the inbound sender, which the
//! session sees as a disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::duplex::{channel, DuplexSettings, FullDuplexSession};
use crate::error::{AppError, AppResult};
use crate::protocol::message::ClientMessage;
use crate::speech::{SessionRequest, SpeechBackend};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceQuery {
    /// Client-side correlation id, only used in logs.
    pub session_id: Option<String>,
    pub voice_prompt: Option<String>,
    pub text_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl VoiceQuery {
    pub fn session_request(&self) -> SessionRequest {
        SessionRequest {
            voice_prompt: self.voice_prompt.clone(),
            text_prompt: self.text_prompt.clone(),
            seed: self.seed,
        }
    }
}

/// Parse one client text frame. On failure the `Err` is the reply to send.
pub fn parse_client_text(text: &str) -> Result<ClientMessage, ClientMessage> {
    match ClientMessage::from_json(text) {
        Ok(ClientMessage::Unsupported) => Err(ClientMessage::error("Unsupported message type")),
        Ok(message) => Ok(message),
        Err(e) => Err(ClientMessage::error(format!("Invalid JSON: {}", e))),
    }
}

pub struct VoiceWebSocket {
    state: web::Data<AppState>,
    request: SessionRequest,
    client_tag: String,
    to_session: Option<mpsc::UnboundedSender<ClientMessage>>,
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(state: web::Data<AppState>, query: &VoiceQuery) -> Self {
        Self {
            state,
            request: query.session_request(),
            client_tag: query
                .session_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            to_session: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let config = self.state.get_config();
        let speech = Arc::clone(&self.state.speech);
        let settings = DuplexSettings::new(&config.speech, speech.get_native_sample_rate());
        let session = FullDuplexSession::new(speech, settings, self.request.clone());

        let (session_channel, end) = channel::pair();
        self.to_session = Some(end.to_session);
        ctx.add_stream(UnboundedReceiverStream::new(end.from_session));

        let state = self.state.clone();
        let client_tag = self.client_tag.clone();
        state.voice_session_opened();

        actix::spawn(async move {
            let summary = session.run(session_channel).await;
            info!(
                client = %client_tag,
                session_id = ?summary.session_id,
                exit = %summary.exit,
                frames_in = summary.frames_in,
                frames_out = summary.frames_out,
                transcripts = summary.transcripts,
                interrupts = summary.interrupts,
                discarded = summary.discarded,
                duration_ms = summary.duration_ms,
                "Voice session finished"
            );
            state.voice_session_finished(&summary);
        });
    }

    fn forward(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .to_session
            .as_ref()
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false);
        if !delivered {
            debug!(client = %self.client_tag, "Session already finished, closing socket");
            ctx.stop();
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client = %self.client_tag, "Voice WebSocket connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client = %act.client_tag, "Voice WebSocket heartbeat timeout");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        self.start_session(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender is the disconnect signal for the session.
        self.to_session.take();
        info!(client = %self.client_tag, "Voice WebSocket closed");
    }
}

/// Client socket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match parse_client_text(&text) {
                    Ok(message) => self.forward(message, ctx),
                    Err(reply) => {
                        debug!(client = %self.client_tag, "Rejected client frame");
                        ctx.text(reply.to_json());
                    }
                }
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(client = %self.client_tag, bytes = data.len(), "Binary frames are not accepted");
                ctx.text(ClientMessage::error("Send audio as audio_chunk JSON messages").to_json());
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client = %self.client_tag, reason = ?reason, "Client closed the socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client = %self.client_tag, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client = %self.client_tag, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Messages from the session to the client. The stream ending means the
/// session is over.
impl StreamHandler<ClientMessage> for VoiceWebSocket {
    fn handle(&mut self, message: ClientMessage, ctx: &mut Self::Context) {
        ctx.text(message.to_json());
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(client = %self.client_tag, "Session output closed");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// `GET /ws/voice` upgrade.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<VoiceQuery>,
) -> AppResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        voice = ?query.voice_prompt,
        has_prompt = query.text_prompt.is_some(),
        "Voice WebSocket upgrade"
    );

    ws::start(VoiceWebSocket::new(state, &query), &req, stream)
        .map_err(|e| AppError::BadRequest(format!("WebSocket handshake failed: {}", e)))
}
