//! Call Bridge
//!
//! A local bridge that lets an AI coding assistant place and hold a
//! live telephone conversation with a human user. A Driver issues
//! high-level commands over a line-delimited stdio RPC -- initiate a
//! call, inject a spoken message, speak without waiting, end the call
//! -- and receives back the user's transcribed speech. Between those
//! commands the bridge drives the call end-to-end: it places the
//! outbound leg through a telephony carrier, accepts the carrier's
//! media-stream WebSocket, translates audio between the carrier's
//! narrowband codec and the speech model's wideband codec, maintains a
//! bidirectional stream to a cloud speech-to-speech model (or a split
//! STT/LLM/TTS pipeline), invokes user-defined tools on the model's
//! behalf, and detects barge-in and hang-up.

pub mod auth;
pub mod carrier;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod rpc;
pub mod session;
pub mod speech;
pub mod splitbrain;
pub mod tools;

pub use config::Config;
pub use error::BridgeError;
pub use manager::CallManager;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
