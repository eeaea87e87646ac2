//! # Proxy Strategy
//!
//! Bridges each session to a remote speech server over its own persistent
//! socket (`server_url?voice_prompt=…&text_prompt=…&seed=…`).
//!
//! ## Connection Establishment:
//! Each attempt has two independent budgets. The connect timeout covers
//! TCP, TLS and the upgrade. The handshake timeout covers the wait for the
//! server's `0x00` ready frame, which only arrives after the server has
//! tokenized the system prompt, so it is the longer of the two. Failed
//! attempts are retried `reconnect_attempts` times with a fixed delay.
//!
//! ## Per-Frame Drain:
//! After sending a frame, responses that are already available are read
//! with a short per-poll timeout. A poll timing out is the normal end of a
//! drain, not an error. A closed or failed socket marks the session inactive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{AppConfig, ProxyConfig};
use crate::protocol::frame::{BackendFrame, ControlCode, TAG_AUDIO, TAG_HANDSHAKE};
use crate::speech::error::BackendError;
use crate::speech::session::{new_session_id, SessionTable, TokenBacklog};
use crate::speech::transport::{self, BackendConnector, BackendLink, LinkMessage, TungsteniteConnector};
use crate::speech::{
    FrameStream, PersonaConfig, SessionId, SessionRequest, SpeechBackend, SpeechMode, TokenStream, VoiceInfo,
};

/// Budget for the startup reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProxyBackend {
    settings: ProxyConfig,
    server_url: Url,
    native_rate: u32,
    defaults: PersonaConfig,
    voices: Vec<VoiceInfo>,
    connector: Arc<dyn BackendConnector>,
    initialized: AtomicBool,
    sessions: SessionTable<ProxySession>,
}

struct ProxySession {
    id: SessionId,
    link: Mutex<Box<dyn BackendLink>>,
    backlog: Arc<TokenBacklog>,
    active: AtomicBool,
    frames_sent: AtomicU64,
}

impl ProxySession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Connection URL for one session.
pub fn session_url(base: &Url, persona: &PersonaConfig) -> Url {
    let mut url = base.clone();
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("voice_prompt", &persona.voice_prompt);
        if !persona.text_prompt.is_empty() {
            query.append_pair("text_prompt", &persona.text_prompt);
        }
        if let Some(seed) = persona.seed {
            query.append_pair("seed", &seed.to_string());
        }
    }
    url
}

impl ProxyBackend {
    pub fn new(config: &AppConfig) -> Result<Self, BackendError> {
        let connector = Arc::new(TungsteniteConnector::new(config.proxy.ssl_verify));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: &AppConfig, connector: Arc<dyn BackendConnector>) -> Result<Self, BackendError> {
        let server_url = Url::parse(&config.proxy.server_url)
            .map_err(|e| BackendError::Connection(format!("invalid server_url '{}': {}", config.proxy.server_url, e)))?;

        Ok(Self {
            settings: config.proxy.clone(),
            server_url,
            native_rate: config.speech.personaplex_sample_rate,
            defaults: config.persona.clone(),
            voices: config.voices.clone(),
            connector,
            initialized: AtomicBool::new(false),
            sessions: SessionTable::unbounded(),
        })
    }

    /// One connect + handshake attempt.
    async fn connect_once(&self, url: &Url) -> Result<Box<dyn BackendLink>, BackendError> {
        let connect_timeout = self.settings.connect_timeout();
        let mut link = tokio::time::timeout(connect_timeout, self.connector.connect(url))
            .await
            .map_err(|_| BackendError::Connection(format!("connect timed out after {:?}", connect_timeout)))??;

        let handshake_timeout = self.settings.handshake_timeout();
        let first = match tokio::time::timeout(handshake_timeout, link.recv()).await {
            Ok(result) => result,
            Err(_) => {
                link.close().await;
                return Err(BackendError::HandshakeTimeout(handshake_timeout));
            }
        };

        let reason = match first {
            Ok(LinkMessage::Binary(data)) if data.first() == Some(&TAG_HANDSHAKE) => return Ok(link),
            Ok(LinkMessage::Binary(data)) => format!("unexpected first frame tag {:?}", data.first()),
            Ok(LinkMessage::Text(text)) => {
                format!("text instead of handshake: {}", text.chars().take(100).collect::<String>())
            }
            Ok(LinkMessage::Closed) => "connection closed during handshake".to_string(),
            Err(e) => e.to_string(),
        };

        link.close().await;
        Err(BackendError::Connection(reason))
    }
}

#[async_trait]
impl SpeechBackend for ProxyBackend {
    fn mode(&self) -> SpeechMode {
        SpeechMode::Proxy
    }

    async fn initialize(&self) -> bool {
        match transport::probe_tcp(&self.server_url, PROBE_TIMEOUT).await {
            Ok(()) => info!(server_url = %self.server_url, "Speech server reachable"),
            // The server may come up after us; sessions retry on their own.
            Err(e) => warn!(server_url = %self.server_url, error = %e, "Speech server not reachable yet"),
        }
        self.initialized.store(true, Ordering::SeqCst);
        true
    }

    async fn create_session(&self, request: SessionRequest) -> Result<SessionId, BackendError> {
        let persona = request.resolve(&self.defaults);
        let session_id = new_session_id();
        let url = session_url(&self.server_url, &persona);
        let attempts = self.settings.reconnect_attempts.max(1);

        info!(session_id = %session_id, voice = %persona.voice_prompt, "Creating proxy speech session");
        if !persona.text_prompt.is_empty() {
            debug!(
                session_id = %session_id,
                prompt_chars = persona.text_prompt.chars().count(),
                handshake_timeout = self.settings.handshake_timeout,
                "Session carries a system prompt"
            );
        }

        for attempt in 1..=attempts {
            match self.connect_once(&url).await {
                Ok(link) => {
                    info!(session_id = %session_id, attempt, "Handshake received");
                    let session = Arc::new(ProxySession {
                        id: session_id.clone(),
                        link: Mutex::new(link),
                        backlog: Arc::new(TokenBacklog::new()),
                        active: AtomicBool::new(true),
                        frames_sent: AtomicU64::new(0),
                    });
                    self.sessions.insert(session_id.clone(), session);
                    return Ok(session_id);
                }
                Err(BackendError::HandshakeTimeout(after)) => warn!(
                    session_id = %session_id,
                    attempt,
                    attempts,
                    timeout_secs = after.as_secs_f64(),
                    "Handshake timeout. With a large text_prompt, consider raising proxy.handshake_timeout"
                ),
                Err(e) => warn!(session_id = %session_id, attempt, attempts, error = %e, "Connection attempt failed"),
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.reconnect_delay()).await;
            }
        }

        Err(BackendError::Connection(format!(
            "Failed to connect to speech server after {} attempts",
            attempts
        )))
    }

    fn process_audio_frame(&self, session_id: &str, frame: Vec<u8>, _sample_rate: u32) -> FrameStream {
        let Some(session) = self.sessions.get(session_id) else {
            warn!(session_id, "Audio for unknown proxy session");
            return Box::pin(stream::empty());
        };
        let drain_poll = self.settings.drain_poll();

        Box::pin(async_stream::stream! {
            if session.is_active() {
                let mut link = session.link.lock().await;

                let mut tagged = Vec::with_capacity(frame.len() + 1);
                tagged.push(TAG_AUDIO);
                tagged.extend_from_slice(&frame);

                match link.send(tagged).await {
                    Err(e) => {
                        error!(session_id = %session.id, error = %e, "Failed to send audio upstream");
                        session.deactivate();
                    }
                    Ok(()) => {
                        session.frames_sent.fetch_add(1, Ordering::Relaxed);
                        let mut received = 0usize;

                        loop {
                            let message = match tokio::time::timeout(drain_poll, link.recv()).await {
                                Err(_) => break,
                                Ok(message) => message,
                            };

                            match message {
                                Ok(LinkMessage::Binary(data)) => match BackendFrame::parse(&data) {
                                    Some(BackendFrame::Text(text)) => session.backlog.push(text),
                                    Some(parsed @ (BackendFrame::Audio(_)
                                        | BackendFrame::Control(_)
                                        | BackendFrame::Metadata(_)
                                        | BackendFrame::Error(_))) => {
                                        received += 1;
                                        yield parsed;
                                    }
                                    Some(other) => debug!(session_id = %session.id, tag = other.tag(), "Ignoring upstream frame"),
                                    None => {}
                                },
                                Ok(LinkMessage::Text(text)) => {
                                    debug!(session_id = %session.id, len = text.len(), "Ignoring upstream text message")
                                }
                                Ok(LinkMessage::Closed) => {
                                    info!(session_id = %session.id, "Speech server closed the session");
                                    session.deactivate();
                                    break;
                                }
                                Err(e) => {
                                    warn!(session_id = %session.id, error = %e, "Upstream connection lost");
                                    session.deactivate();
                                    break;
                                }
                            }
                        }

                        if received > 0 {
                            debug!(session_id = %session.id, received, "Drained upstream frames");
                        }
                    }
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
            session.deactivate();
            session.link.lock().await.close().await;
            info!(
                session_id,
                frames_sent = session.frames_sent.load(Ordering::Relaxed),
                "Proxy session closed"
            );
        }
    }

    async fn interrupt(&self, session_id: &str) -> Result<(), BackendError> {
        if !self.settings.supports_control_messages {
            debug!(session_id, "Skipping interrupt; speech server does not support control messages");
            return Ok(());
        }

        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| BackendError::SessionNotFound(session_id.to_string()))?;
        if !session.is_active() {
            return Ok(());
        }

        let pause = BackendFrame::control(ControlCode::Pause).to_bytes();
        session.link.lock().await.send(pause).await?;
        debug!(session_id, "Sent pause upstream");
        Ok(())
    }

    async fn get_available_voices(&self) -> Vec<VoiceInfo> {
        self.voices.clone()
    }

    fn get_native_sample_rate(&self) -> u32 {
        self.native_rate
    }

    fn supports_control_messages(&self) -> bool {
        self.settings.supports_control_messages
    }

    async fn verify_connection(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            return false;
        }

        match self.create_session(SessionRequest::default()).await {
            Ok(probe) => {
                self.close_session(&probe).await;
                true
            }
            Err(e) => {
                warn!(error = %e, "Speech server verification failed");
                false
            }
        }
    }

    fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn shutdown(&self) {
        let sessions = self.sessions.drain();
        for (id, session) in &sessions {
            session.deactivate();
            session.link.lock().await.close().await;
            debug!(session_id = %id, "Closed proxy session on shutdown");
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!(closed = sessions.len(), "Proxy backend shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    type Sent = Arc<std::sync::Mutex<Vec<Vec<u8>>>>;

    struct ScriptedLink {
        inbox: mpsc::UnboundedReceiver<LinkMessage>,
        sent: Sent,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendLink for ScriptedLink {
        async fn send(&mut self, data: Vec<u8>) -> Result<(), BackendError> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        async fn recv(&mut self) -> Result<LinkMessage, BackendError> {
            Ok(self.inbox.recv().await.unwrap_or(LinkMessage::Closed))
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    enum Plan {
        Refuse,
        /// Never completes the connect.
        Hang,
        /// Accepts but never handshakes.
        Silent,
        Handshake,
    }

    #[derive(Default)]
    struct ScriptedConnector {
        plans: std::sync::Mutex<VecDeque<Plan>>,
        attempts: AtomicUsize,
        urls: std::sync::Mutex<Vec<String>>,
        sent: Sent,
        closed: Arc<AtomicUsize>,
        /// Senders of accepted links, kept alive so links stay open.
        feeds: std::sync::Mutex<Vec<mpsc::UnboundedSender<LinkMessage>>>,
    }

    impl ScriptedConnector {
        fn with_plans(plans: Vec<Plan>) -> Arc<Self> {
            let connector = Self::default();
            *connector.plans.lock().unwrap() = plans.into();
            Arc::new(connector)
        }

        fn feed(&self, data: &[u8]) {
            let feeds = self.feeds.lock().unwrap();
            feeds.last().unwrap().send(LinkMessage::Binary(data.to_vec())).unwrap();
        }

        fn hang_up(&self) {
            self.feeds.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl BackendConnector for ScriptedConnector {
        async fn connect(&self, url: &Url) -> Result<Box<dyn BackendLink>, BackendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());

            let plan = self.plans.lock().unwrap().pop_front().unwrap_or(Plan::Refuse);
            let (tx, rx) = mpsc::unbounded_channel();
            match plan {
                Plan::Refuse => return Err(BackendError::Connection("connection refused".into())),
                Plan::Hang => std::future::pending::<()>().await,
                Plan::Silent => {}
                Plan::Handshake => tx.send(LinkMessage::Binary(vec![0x00])).unwrap(),
            }
            self.feeds.lock().unwrap().push(tx);

            Ok(Box::new(ScriptedLink {
                inbox: rx,
                sent: Arc::clone(&self.sent),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn test_config(attempts: u32, control: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.proxy.reconnect_attempts = attempts;
        config.proxy.reconnect_delay = 0.0;
        config.proxy.connection_timeout = 1.0;
        config.proxy.handshake_timeout = 0.05;
        config.proxy.drain_poll_ms = 10;
        config.proxy.supports_control_messages = control;
        config
    }

    fn backend(connector: &Arc<ScriptedConnector>, attempts: u32, control: bool) -> ProxyBackend {
        ProxyBackend::with_connector(&test_config(attempts, control), Arc::clone(connector) as Arc<dyn BackendConnector>)
            .unwrap()
    }

    #[test]
    fn test_session_url_query() {
        let base = Url::parse("ws://localhost:8998/api/chat?stale=1").unwrap();
        let persona = PersonaConfig {
            text_prompt: "Be brief & kind".to_string(),
            seed: Some(7),
            ..PersonaConfig::default()
        };
        let url = session_url(&base, &persona);
        assert_eq!(
            url.as_str(),
            "ws://localhost:8998/api/chat?voice_prompt=NATF2.pt&text_prompt=Be+brief+%26+kind&seed=7"
        );

        let bare = session_url(&base, &PersonaConfig::default());
        assert_eq!(bare.query(), Some("voice_prompt=NATF2.pt"));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_last_attempt() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Silent, Plan::Refuse, Plan::Handshake]);
        let proxy = backend(&connector, 3, false);

        let id = proxy.create_session(SessionRequest::default()).await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(proxy.is_session_active(&id));
        // The silent link is closed after its handshake timeout.
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_attempts_fail() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Silent, Plan::Silent, Plan::Refuse]);
        let proxy = backend(&connector, 3, false);

        match proxy.create_session(SessionRequest::default()).await {
            Err(BackendError::Connection(msg)) => assert!(msg.contains("3 attempts")),
            other => panic!("expected connection error, got {:?}", other),
        }
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(proxy.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout_bounds_each_attempt() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Hang, Plan::Hang]);
        let mut config = test_config(2, false);
        config.proxy.connection_timeout = 0.05;
        config.proxy.handshake_timeout = 30.0;
        let proxy =
            ProxyBackend::with_connector(&config, Arc::clone(&connector) as Arc<dyn BackendConnector>).unwrap();

        let started = std::time::Instant::now();
        match proxy.create_session(SessionRequest::default()).await {
            Err(BackendError::Connection(msg)) => assert!(msg.contains("2 attempts")),
            other => panic!("expected connection error, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(proxy.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_request_reaches_url() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Handshake]);
        let proxy = backend(&connector, 1, false);
        let request = SessionRequest {
            voice_prompt: Some("NATM1.pt".into()),
            text_prompt: None,
            seed: Some(3),
        };
        proxy.create_session(request).await.unwrap();

        let urls = connector.urls.lock().unwrap();
        assert!(urls[0].ends_with("?voice_prompt=NATM1.pt&seed=3"));
    }

    #[tokio::test]
    async fn test_drain_collects_available_frames() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Handshake]);
        let proxy = backend(&connector, 1, false);
        let id = proxy.create_session(SessionRequest::default()).await.unwrap();

        connector.feed(&[0x01, 1, 2, 3]);
        connector.feed(b"\x02hel");
        connector.feed(b"\x02lo");
        connector.feed(&[0x03, 0x01]);

        let frames: Vec<BackendFrame> = proxy.process_audio_frame(&id, vec![9, 9], 24000).collect().await;
        assert_eq!(frames, vec![BackendFrame::Audio(vec![1, 2, 3]), BackendFrame::Control(1)]);
        assert_eq!(connector.sent.lock().unwrap().last().unwrap(), &vec![0x01, 9, 9]);

        let tokens: Vec<String> = proxy.get_text_tokens(&id).collect().await;
        assert_eq!(tokens, vec!["hel".to_string(), "lo".to_string()]);

        // Nothing pending: the drain ends on the first poll timeout.
        assert!(proxy.process_audio_frame(&id, vec![0], 24000).collect::<Vec<_>>().await.is_empty());
        assert!(proxy.is_session_active(&id));
    }

    #[tokio::test]
    async fn test_remote_close_marks_inactive() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Handshake]);
        let proxy = backend(&connector, 1, false);
        let id = proxy.create_session(SessionRequest::default()).await.unwrap();

        connector.hang_up();
        let frames: Vec<BackendFrame> = proxy.process_audio_frame(&id, vec![0], 24000).collect().await;
        assert!(frames.is_empty());
        assert!(!proxy.is_session_active(&id));
    }

    #[tokio::test]
    async fn test_interrupt_without_control_support_is_noop() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Handshake]);
        let proxy = backend(&connector, 1, false);
        let id = proxy.create_session(SessionRequest::default()).await.unwrap();

        assert!(proxy.interrupt(&id).await.is_ok());
        assert!(connector.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_sends_pause() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Handshake]);
        let proxy = backend(&connector, 1, true);
        let id = proxy.create_session(SessionRequest::default()).await.unwrap();

        proxy.interrupt(&id).await.unwrap();
        assert_eq!(connector.sent.lock().unwrap().as_slice(), &[vec![0x03, 0x02]]);
    }

    #[tokio::test]
    async fn test_close_releases_link_once() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Handshake]);
        let proxy = backend(&connector, 1, false);
        let id = proxy.create_session(SessionRequest::default()).await.unwrap();

        proxy.close_session(&id).await;
        proxy.close_session(&id).await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert!(!proxy.is_session_active(&id));
    }

    #[tokio::test]
    async fn test_verify_uses_probe_session() {
        let connector = ScriptedConnector::with_plans(vec![Plan::Handshake, Plan::Refuse]);
        let proxy = backend(&connector, 1, false);
        assert!(!proxy.verify_connection().await);

        assert!(proxy.initialize().await);
        assert!(proxy.verify_connection().await);
        assert_eq!(proxy.active_session_count(), 0);
        assert!(!proxy.verify_connection().await);
    }
}
