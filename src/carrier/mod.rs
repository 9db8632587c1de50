//! Carrier Port (C3): a capability set with two concrete backends,
//! `carrier_a` and `carrier_b`. Selected once at startup from
//! `Config.carrier.kind` and shared across sessions the same way the
//! teacher shares a single long-lived `reqwest::Client` rather than one
//! per call — grounded on `src/server/device.rs`'s registry/handle
//! split, generalized from "route a tool call to a connected device" to
//! "route a webhook event to a call session".

pub mod carrier_a;
pub mod carrier_b;

use crate::config::Config;
use crate::error::{CarrierError, CarrierErrorKind};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Event kinds C3 recognizes out of the carrier-specific wire payload.
/// Anything else decodes to `Unknown` and is logged, never propagated
/// as an error — spec §4.3's "unknown events are logged and ignored".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierEventKind {
    OutboundPlaced,
    Ringing,
    Answered,
    HungUp,
    StreamReady,
    Unknown,
}

/// One parsed carrier event: which call it belongs to, what kind it
/// is, and the raw payload for anything the caller needs beyond the
/// kind (e.g. a machine-detection result).
#[derive(Debug, Clone)]
pub struct CarrierEvent {
    pub call_ref: String,
    pub kind: CarrierEventKind,
    pub payload: Value,
}

#[async_trait]
pub trait CarrierClient: Send + Sync {
    /// Originate a call. `webhook_url` receives all subsequent events
    /// for this call.
    async fn place_outbound(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> Result<String, CarrierError>;

    /// Carrier B only: explicitly start the bidirectional media
    /// stream. Carrier A starts it via the connect directive returned
    /// from the webhook instead; its implementation is a no-op.
    async fn start_media_stream(&self, carrier_call_ref: &str, ws_url: &str) -> Result<(), CarrierError>;

    async fn hangup(&self, carrier_call_ref: &str) -> Result<(), CarrierError>;

    /// Opaque body to return from the webhook response that directs
    /// the carrier to open its media socket at `ws_url`.
    fn media_connect_directive(&self, ws_url: &str) -> Vec<u8>;

    /// Parse one inbound webhook delivery into the carrier-neutral
    /// event triple.
    fn parse_event(&self, content_type: &str, raw_body: &[u8]) -> Result<CarrierEvent, CarrierError>;
}

/// Build the configured carrier client.
pub fn build(config: &Config) -> Result<Arc<dyn CarrierClient>, CarrierError> {
    use crate::config::CarrierKind;
    match config.carrier.kind {
        Some(CarrierKind::A) => Ok(Arc::new(carrier_a::CarrierA::new(
            config.carrier.account_id.clone().unwrap_or_default(),
            config.carrier.auth_token.clone().unwrap_or_default(),
        ))),
        Some(CarrierKind::B) => Ok(Arc::new(carrier_b::CarrierB::new(
            config.carrier.account_id.clone().unwrap_or_default(),
        ))),
        None => Err(CarrierError::new(
            CarrierErrorKind::ParseFailed,
            "no carrier configured",
        )),
    }
}
