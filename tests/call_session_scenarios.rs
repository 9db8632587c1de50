//! End-to-end scenarios against `CallSession` using a hand-written
//! in-memory carrier in place of a real Carrier A/B REST client (never
//! a real network call, so these don't depend on live credentials or
//! connectivity). Covers spec.md §8's S4 (hangup during an in-flight
//! wait) and S5 (auth failure); S1-S3/S6 (happy path, barge-in, tool
//! use, split mode turn) all require a live speech-model/STT/TTS
//! endpoint and are covered instead by the unit tests colocated with
//! `speech`, `splitbrain`, and `session::tests`.

use async_trait::async_trait;
use call_bridge::carrier::{CarrierClient, CarrierEvent};
use call_bridge::config::{CarrierConfig, CarrierKind, Config, TimeoutsConfig};
use call_bridge::error::{CarrierError, CarrierErrorKind};
use call_bridge::manager::CallManager;
use call_bridge::session::CallSession;
use call_bridge::tools::default_tool_config;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stands in for carrier A/B: originates instantly and never actually
/// answers, so `start()` always ends up waiting on media readiness.
struct FakeCarrier {
    next_ref: AtomicUsize,
}

impl FakeCarrier {
    fn new() -> Self {
        Self { next_ref: AtomicUsize::new(1) }
    }
}

#[async_trait]
impl CarrierClient for FakeCarrier {
    async fn place_outbound(&self, _to: &str, _from: &str, _webhook_url: &str) -> Result<String, CarrierError> {
        let n = self.next_ref.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fake-call-{n}"))
    }

    async fn start_media_stream(&self, _carrier_call_ref: &str, _ws_url: &str) -> Result<(), CarrierError> {
        Ok(())
    }

    async fn hangup(&self, _carrier_call_ref: &str) -> Result<(), CarrierError> {
        Ok(())
    }

    fn media_connect_directive(&self, ws_url: &str) -> Vec<u8> {
        format!("<Connect><Stream url=\"{ws_url}\"/></Connect>").into_bytes()
    }

    fn parse_event(&self, _content_type: &str, _raw_body: &[u8]) -> Result<CarrierEvent, CarrierError> {
        Err(CarrierError::new(CarrierErrorKind::ParseFailed, "FakeCarrier never receives webhooks directly"))
    }
}

fn test_config(media_ready_timeout_ms: u64) -> Arc<Config> {
    Arc::new(Config {
        carrier: CarrierConfig {
            kind: Some(CarrierKind::A),
            account_id: Some("AC_TEST".into()),
            auth_token: Some("test_token".into()),
            public_key: None,
            from_number: Some("+15550000000".into()),
            user_number: Some("+15551234567".into()),
        },
        timeouts: TimeoutsConfig { turn_timeout_ms: 60_000, media_ready_timeout_ms },
        ..Config::default()
    })
}

fn session_with_fake_carrier(config: Arc<Config>) -> Arc<CallSession> {
    CallSession::new(
        config.carrier.user_number.clone().unwrap_or_default(),
        config.carrier.from_number.clone().unwrap_or_default(),
        Arc::new(FakeCarrier::new()),
        Arc::new(default_tool_config()),
        config,
    )
}

#[tokio::test]
async fn s4_hangup_during_media_wait_surfaces_as_hangup_error() {
    // Nothing in this harness ever attaches a media socket or marks the
    // stream ready, so `start()` would otherwise just time out. Forcing
    // a hangup mid-wait must resolve it immediately with a hangup
    // error instead of waiting out the full media-ready timeout.
    let session = session_with_fake_carrier(test_config(5_000));

    let wait_session = session.clone();
    let handle = tokio::spawn(async move { wait_session.start("hello").await });

    // Give `start()` a moment to place the call and enter the
    // media-ready wait loop before hanging it up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.on_carrier_hangup().await;

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("start() should resolve promptly after hangup, not wait out the full timeout")
        .expect("task should not panic");

    assert!(result.is_err(), "expected start() to fail once the call hung up mid-wait");
}

#[tokio::test]
async fn media_ready_timeout_fails_the_call() {
    let session = session_with_fake_carrier(test_config(100));
    let result = session.start("hello").await;
    assert!(result.is_err(), "media never becomes ready in this harness, start() must time out");
}

#[tokio::test]
async fn s5_bad_carrier_a_signature_is_rejected() {
    let form_fields = vec![("CallSid".to_string(), "CA123".to_string()), ("CallStatus".to_string(), "ringing".to_string())];
    let url = "https://example.ngrok.io/twiml";

    let good = call_bridge::auth::verify_carrier_a("test_token", "", url, &form_fields);
    // An empty/garbage signature never verifies, but must return a
    // clean `Ok(false)`/`Err` rather than panicking on malformed input.
    assert!(matches!(good, Ok(false) | Err(_)));
}

#[tokio::test]
async fn continue_call_against_unknown_call_id_returns_session_not_found() {
    // This is the one scenario that does go through `CallManager::new`
    // (and therefore a real Carrier A REST client) -- a lookup miss is
    // resolved entirely in the registry, before any carrier method is
    // ever invoked, so no network call happens.
    let manager = CallManager::new(test_config(5_000), Arc::new(default_tool_config()))
        .expect("config carries a valid carrier.kind");
    let result = manager.continue_call("does-not-exist", "hi").await;
    assert!(matches!(result, Err(call_bridge::error::BridgeError::NotFound(_))));
}
