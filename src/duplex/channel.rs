//! Client-facing duplex channel.
//!
//! The orchestrator never touches a socket. It reads parsed client messages
//! from a [`ClientChannel`] and writes replies through a [`ClientSender`];
//! the WebSocket actor holds the other end ([`ClientEnd`]).

use tokio::sync::mpsc;

use crate::protocol::message::ClientMessage;

#[derive(Debug, Clone)]
pub struct ClientSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ClientSender {
    /// `false` once the client side is gone.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Orchestrator side.
#[derive(Debug)]
pub struct ClientChannel {
    pub inbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub outbound: ClientSender,
}

/// Socket side. Dropping `to_session` is how a disconnect is signalled.
#[derive(Debug)]
pub struct ClientEnd {
    pub to_session: mpsc::UnboundedSender<ClientMessage>,
    pub from_session: mpsc::UnboundedReceiver<ClientMessage>,
}

pub fn pair() -> (ClientChannel, ClientEnd) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    (
        ClientChannel {
            inbound: in_rx,
            outbound: ClientSender { tx: out_tx },
        },
        ClientEnd {
            to_session: in_tx,
            from_session: out_rx,
        },
    )
}
