//! # Upstream Transport
//!
//! The duplex socket the proxy strategy holds per session. The strategy only
//! sees [`BackendConnector`] and [`BackendLink`], so retry and drain logic can
//! be exercised against scripted links in tests.
//!
//! [`TungsteniteConnector`] is the production implementation. `wss://` URLs
//! need the `tls` cargo feature; with `ssl_verify = false` certificate and
//! hostname checks are skipped (self-signed model servers).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::speech::error::BackendError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One message read from the upstream socket.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    Binary(Vec<u8>),
    Text(String),
    /// The remote side closed, or the stream ended.
    Closed,
}

#[async_trait]
pub trait BackendLink: Send {
    async fn send(&mut self, data: Vec<u8>) -> Result<(), BackendError>;

    /// Next data message. Protocol-level ping/pong is handled underneath.
    async fn recv(&mut self) -> Result<LinkMessage, BackendError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn BackendLink>, BackendError>;
}

pub struct TungsteniteConnector {
    ssl_verify: bool,
}

impl TungsteniteConnector {
    pub fn new(ssl_verify: bool) -> Self {
        Self { ssl_verify }
    }

    #[cfg(feature = "tls")]
    async fn connect_tls(&self, url: &Url) -> Result<WsStream, BackendError> {
        use tokio_tungstenite::Connector;

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!self.ssl_verify)
            .danger_accept_invalid_hostnames(!self.ssl_verify)
            .build()
            .map_err(|e| BackendError::Connection(format!("TLS setup failed: {}", e)))?;

        let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(Connector::NativeTls(tls)),
        )
        .await
        .map_err(|e| BackendError::Connection(e.to_string()))?;
        Ok(ws)
    }

    #[cfg(not(feature = "tls"))]
    async fn connect_tls(&self, url: &Url) -> Result<WsStream, BackendError> {
        debug!(ssl_verify = self.ssl_verify, "TLS requested without the tls feature");
        Err(BackendError::Connection(format!(
            "{} requires building with the `tls` feature",
            url.scheme()
        )))
    }
}

#[async_trait]
impl BackendConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn BackendLink>, BackendError> {
        let ws = match url.scheme() {
            "wss" => self.connect_tls(url).await?,
            _ => {
                let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .map_err(|e| BackendError::Connection(e.to_string()))?;
                ws
            }
        };
        debug!(host = ?url.host_str(), "Upstream socket open");
        Ok(Box::new(TungsteniteLink { ws }))
    }
}

struct TungsteniteLink {
    ws: WsStream,
}

#[async_trait]
impl BackendLink for TungsteniteLink {
    async fn send(&mut self, data: Vec<u8>) -> Result<(), BackendError> {
        self.ws
            .send(Message::Binary(data))
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))
    }

    async fn recv(&mut self) -> Result<LinkMessage, BackendError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(LinkMessage::Binary(data)),
                Some(Ok(Message::Text(text))) => return Ok(LinkMessage::Text(text)),
                Some(Ok(Message::Close(_))) | None => return Ok(LinkMessage::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(BackendError::Connection(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "Upstream close handshake failed");
        }
    }
}

/// Plain TCP reachability check against the host and port of `url`.
pub async fn probe_tcp(url: &Url, timeout: Duration) -> Result<(), BackendError> {
    let host = url
        .host_str()
        .ok_or_else(|| BackendError::Connection(format!("no host in {}", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| BackendError::Connection(format!("no port in {}", url)))?;

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(BackendError::Connection(format!("{}:{} unreachable: {}", host, port, e))),
        Err(_) => Err(BackendError::Connection(format!(
            "{}:{} did not accept within {:?}",
            host, port, timeout
        ))),
    }
}
