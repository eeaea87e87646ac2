//! # Full-Duplex Orchestrator
//!
//! One [`FullDuplexSession`] per client connection. It creates the backend
//! session, then runs three loops side by side until one of them ends:
//!
//! - **ingest**: client messages in; audio goes to the backend and every
//!   resulting frame lands in the output queue, `interrupt` pauses the
//!   backend and clears the queue
//! - **emit**: output queue out; frames are translated for the client
//!   (audio decoded and resampled to the client rate) and sent
//! - **transcript**: polls the backend's buffered text tokens
//!
//! The first loop to finish cancels the other two, then teardown runs.
//! Teardown is idempotent and closes the backend session exactly once.
//!
//! ## States:
//! `Connecting → HandshakeWait → Active ⇄ Interrupted → Closing → Closed`

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::codec::CodecKind;
use crate::config::SpeechConfig;
use crate::duplex::channel::{ClientChannel, ClientSender};
use crate::duplex::queue::OutputQueue;
use crate::protocol::frame::BackendFrame;
use crate::protocol::message::{Capabilities, ClientMessage};
use crate::protocol::translator::{ProtocolTranslator, TranslatorConfig};
use crate::speech::{SessionId, SessionRequest, SpeechBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplexState {
    Connecting,
    HandshakeWait,
    Active,
    Interrupted,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The backend refused the session.
    Rejected(String),
    /// The client's inbound stream ended.
    Disconnected,
    /// The client sent `end`.
    ClientEnd,
    /// The backend session went inactive.
    BackendClosed,
    /// Replies could no longer be delivered.
    ClientGone,
    /// Cancelled from outside (server shutdown).
    Cancelled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            ExitReason::Disconnected => write!(f, "client disconnected"),
            ExitReason::ClientEnd => write!(f, "client ended"),
            ExitReason::BackendClosed => write!(f, "backend closed"),
            ExitReason::ClientGone => write!(f, "client unreachable"),
            ExitReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Rates and timings for one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplexSettings {
    pub client_rate: u32,
    pub native_rate: u32,
    pub codec: CodecKind,
    pub output_poll: Duration,
    pub text_poll: Duration,
}

impl DuplexSettings {
    pub fn new(speech: &SpeechConfig, native_rate: u32) -> Self {
        Self {
            client_rate: speech.orbit_sample_rate,
            native_rate,
            codec: speech.codec,
            output_poll: speech.output_poll(),
            text_poll: speech.text_poll(),
        }
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    transcripts: AtomicU64,
    interrupts: AtomicU64,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Option<SessionId>,
    pub exit: ExitReason,
    pub frames_in: u64,
    pub frames_out: u64,
    pub transcripts: u64,
    pub interrupts: u64,
    pub discarded: u64,
    pub duration_ms: u64,
}

pub struct FullDuplexSession<B: SpeechBackend + ?Sized> {
    backend: Arc<B>,
    settings: DuplexSettings,
    request: SessionRequest,
    state: Mutex<DuplexState>,
    session_id: OnceLock<SessionId>,
    translator: Arc<Mutex<ProtocolTranslator>>,
    codec_rate: u32,
    queue: OutputQueue,
    cancel: CancellationToken,
    torn_down: AtomicBool,
    stats: SessionStats,
    started: Instant,
}

impl<B: SpeechBackend + ?Sized> FullDuplexSession<B> {
    pub fn new(backend: Arc<B>, settings: DuplexSettings, request: SessionRequest) -> Self {
        let translator = ProtocolTranslator::new(TranslatorConfig {
            native_rate: settings.native_rate,
            client_rate: settings.client_rate,
            codec: settings.codec,
        });
        let codec_rate = translator.codec_rate();

        Self {
            backend,
            settings,
            request,
            state: Mutex::new(DuplexState::Connecting),
            session_id: OnceLock::new(),
            translator: Arc::new(Mutex::new(translator)),
            codec_rate,
            queue: OutputQueue::new(),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            stats: SessionStats::default(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> DuplexState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: DuplexState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(session_id = ?self.session_id.get(), from = ?*state, to = ?next, "Duplex state change");
            *state = next;
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.get().map(String::as_str)
    }

    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }

    /// Drive the session to completion.
    pub async fn run(&self, channel: ClientChannel) -> SessionSummary {
        let ClientChannel { mut inbound, outbound } = channel;

        let session_id = match self.open(&outbound).await {
            Ok(id) => id,
            Err(reason) => {
                self.set_state(DuplexState::Closed);
                self.torn_down.store(true, Ordering::SeqCst);
                return self.summary(ExitReason::Rejected(reason));
            }
        };

        let exit = tokio::select! {
            exit = self.ingest_loop(&session_id, &mut inbound, &outbound) => exit,
            exit = self.emit_loop(&outbound) => exit,
            exit = self.transcript_loop(&session_id, &outbound) => exit,
        };
        self.cancel.cancel();

        info!(session_id = %session_id, reason = %exit, "Duplex session ending");
        self.teardown().await;
        self.summary(exit)
    }

    /// Create the backend session and announce it to the client.
    async fn open(&self, outbound: &ClientSender) -> Result<SessionId, String> {
        self.set_state(DuplexState::HandshakeWait);

        let session_id = match self.backend.create_session(self.request.clone()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Backend session rejected");
                outbound.send(ClientMessage::error(e.to_string()));
                return Err(e.to_string());
            }
        };
        let _ = self.session_id.set(session_id.clone());
        self.set_state(DuplexState::Active);

        outbound.send(ClientMessage::Connected {
            mode: "full_duplex".to_string(),
            session_id: Some(session_id.clone()),
            audio_format: Some("pcm".to_string()),
            sample_rate: Some(self.settings.client_rate),
            capabilities: Some(Capabilities::default()),
        });
        info!(
            session_id = %session_id,
            mode = %self.backend.mode(),
            client_rate = self.settings.client_rate,
            codec_rate = self.codec_rate,
            "Duplex session active"
        );
        Ok(session_id)
    }

    async fn ingest_loop(
        &self,
        session_id: &str,
        inbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
        outbound: &ClientSender,
    ) -> ExitReason {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return ExitReason::Cancelled,
                message = inbound.recv() => message,
            };

            match message {
                None => return ExitReason::Disconnected,
                Some(chunk @ ClientMessage::AudioChunk { .. }) => self.forward_audio(session_id, chunk).await,
                Some(ClientMessage::Interrupt) => self.handle_interrupt(session_id, outbound).await,
                Some(ClientMessage::End) => return ExitReason::ClientEnd,
                Some(ClientMessage::Ping) => {
                    outbound.send(ClientMessage::Pong);
                }
                Some(ClientMessage::Pong) => {}
                Some(other) => debug!(session_id, message_type = other.kind(), "Ignoring client message"),
            }

            if !self.backend.is_session_active(session_id) {
                return ExitReason::BackendClosed;
            }
        }
    }

    async fn forward_audio(&self, session_id: &str, chunk: ClientMessage) {
        let epoch = self.queue.epoch();

        let translator = Arc::clone(&self.translator);
        let encoded = tokio::task::spawn_blocking(move || {
            let mut translator = translator.lock().unwrap_or_else(|e| e.into_inner());
            translator.client_to_backend(&chunk)
        })
        .await;

        let payload = match encoded {
            Ok(Some(BackendFrame::Audio(payload))) => payload,
            Ok(_) => return,
            Err(e) => {
                warn!(session_id, error = %e, "Audio encode task failed");
                return;
            }
        };
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);

        let mut frames = self.backend.process_audio_frame(session_id, payload, self.codec_rate);
        while let Some(frame) = frames.next().await {
            if !self.queue.push_if_current(frame, epoch) {
                debug!(session_id, "Discarding output produced before interrupt");
            }
        }
    }

    /// Pause the backend, drop queued output, tell the client once.
    pub async fn handle_interrupt(&self, session_id: &str, outbound: &ClientSender) {
        self.set_state(DuplexState::Interrupted);
        self.stats.interrupts.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.backend.interrupt(session_id).await {
            warn!(session_id, error = %e, "Backend interrupt failed");
        }
        let cleared = self.queue.clear();
        outbound.send(ClientMessage::interrupted("user_request"));
        info!(session_id, cleared, "Interrupted by client");

        self.set_state(DuplexState::Active);
    }

    async fn emit_loop(&self, outbound: &ClientSender) -> ExitReason {
        let mut chunk_index: u64 = 0;

        loop {
            let queued = tokio::select! {
                _ = self.cancel.cancelled() => return ExitReason::Cancelled,
                queued = self.queue.pop_wait(self.settings.output_poll) => queued,
            };
            let Some(queued) = queued else {
                if outbound.is_closed() {
                    return ExitReason::ClientGone;
                }
                continue;
            };

            let mut message = match queued.frame {
                BackendFrame::Audio(payload) => {
                    let translator = Arc::clone(&self.translator);
                    let decoded = tokio::task::spawn_blocking(move || {
                        let mut translator = translator.lock().unwrap_or_else(|e| e.into_inner());
                        translator.frame_to_client(&BackendFrame::Audio(payload))
                    })
                    .await;
                    match decoded {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Audio decode task failed");
                            continue;
                        }
                    }
                }
                other => self.translate(&other),
            };

            // Decoded after an interrupt: stale.
            if !self.queue.is_current(queued.epoch) {
                continue;
            }

            if let ClientMessage::AudioChunk { data, chunk_index: index, .. } = &mut message {
                if data.is_empty() {
                    continue;
                }
                *index = Some(chunk_index);
                chunk_index += 1;
            }

            if !outbound.send(message) {
                return ExitReason::ClientGone;
            }
            self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn translate(&self, frame: &BackendFrame) -> ClientMessage {
        let mut translator = self.translator.lock().unwrap_or_else(|e| e.into_inner());
        translator.frame_to_client(frame)
    }

    async fn transcript_loop(&self, session_id: &str, outbound: &ClientSender) -> ExitReason {
        let mut ticker = tokio::time::interval(self.settings.text_poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return ExitReason::Cancelled,
                _ = ticker.tick() => {}
            }

            let mut tokens = self.backend.get_text_tokens(session_id);
            while let Some(text) = tokens.next().await {
                let sent = outbound.send(ClientMessage::Transcription {
                    text,
                    partial: Some(true),
                });
                if !sent {
                    return ExitReason::ClientGone;
                }
                self.stats.transcripts.fetch_add(1, Ordering::Relaxed);
            }

            if !self.backend.is_session_active(session_id) {
                return ExitReason::BackendClosed;
            }
        }
    }

    /// Release the backend session and codec state. Returns `false` if
    /// teardown already ran.
    pub async fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_state(DuplexState::Closing);
        self.cancel.cancel();

        let pending = self.queue.clear();
        if let Some(session_id) = self.session_id.get() {
            self.backend.close_session(session_id).await;
        }
        self.translator.lock().unwrap_or_else(|e| e.into_inner()).reset();

        self.set_state(DuplexState::Closed);
        info!(
            session_id = ?self.session_id.get(),
            frames_in = self.stats.frames_in.load(Ordering::Relaxed),
            frames_out = self.stats.frames_out.load(Ordering::Relaxed),
            transcripts = self.stats.transcripts.load(Ordering::Relaxed),
            interrupts = self.stats.interrupts.load(Ordering::Relaxed),
            pending,
            "Duplex session closed"
        );
        true
    }

    fn summary(&self, exit: ExitReason) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.get().cloned(),
            exit,
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
            transcripts: self.stats.transcripts.load(Ordering::Relaxed),
            interrupts: self.stats.interrupts.load(Ordering::Relaxed),
            discarded: self.queue.discarded(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
