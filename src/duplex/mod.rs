//! Per-connection full-duplex conversation handling.

pub mod channel;
pub mod orchestrator;
pub mod queue;

pub use channel::{ClientChannel, ClientEnd, ClientSender};
pub use orchestrator::{DuplexSettings, DuplexState, ExitReason, FullDuplexSession, SessionSummary};
pub use queue::OutputQueue;
