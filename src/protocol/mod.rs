//! # Protocol Module
//!
//! The two wire vocabularies of the bridge and the translation between them.
//!
//! - **frame**: backend binary frames (tag byte + payload)
//! - **message**: client JSON messages (`type` discriminator)
//! - **translator**: per-session conversion, codec included

pub mod frame;
pub mod message;
pub mod translator;

pub use frame::{BackendFrame, ControlCode};
pub use message::{Capabilities, ClientMessage};
pub use translator::{ProtocolTranslator, TranslatorConfig};
