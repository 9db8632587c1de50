//! Webhook HTTP surface: `POST /twiml` (carrier call-status events),
//! `GET /health`, `POST /sms` (stub — outbound/inbound SMS is out of
//! scope per spec.md §1). Grounded on the teacher's `server/mod.rs`
//! route layout and its `ServerState` extractor pattern.

use super::CallManager;
use crate::carrier::CarrierEventKind;
use crate::config::CarrierKind;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn router(manager: Arc<CallManager>) -> Router {
    Router::new()
        .route("/twiml", post(twiml_handler))
        .route("/health", get(health_handler))
        .route("/sms", post(sms_handler))
        .merge(super::media_ws::router())
        .with_state(manager)
}

async fn health_handler(State(manager): State<Arc<CallManager>>) -> impl IntoResponse {
    let active = manager.active_call_count().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "activeCalls": active,
        "uptimeSeconds": manager.uptime_seconds(),
    }))
}

/// Explicitly out of scope (spec.md §1 lists SMS as an external
/// collaborator this bridge doesn't implement). Kept as a wired,
/// documented route rather than silently absent.
async fn sms_handler() -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, "send_text (SMS) is out of scope for this bridge")
}

async fn twiml_handler(State(manager): State<Arc<CallManager>>, headers: HeaderMap, body: Bytes) -> Response {
    let kind = manager.config().carrier.kind;

    if !manager.config().server.trust_without_signature {
        if let Err(resp) = verify_webhook_signature(&manager, kind, &headers, &body) {
            return resp;
        }
    } else {
        tracing::warn!("webhook signature verification bypassed (server.trust_without_signature)");
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let event = match manager.carrier().parse_event(&content_type, &body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse carrier webhook event");
            return default_response(kind);
        }
    };

    let session = manager.by_carrier_ref(&event.call_ref).await;
    match (&session, event.kind) {
        (Some(session), CarrierEventKind::Ringing) => session.on_carrier_ringing().await,
        (Some(session), CarrierEventKind::Answered) => session.on_carrier_answered().await,
        (Some(session), CarrierEventKind::HungUp) => session.on_carrier_hangup().await,
        (Some(session), CarrierEventKind::StreamReady) => session.set_stream_ready().await,
        (Some(_), CarrierEventKind::OutboundPlaced | CarrierEventKind::Unknown) => {
            tracing::debug!(call_ref = %event.call_ref, kind = ?event.kind, "ignoring non-actionable carrier event");
        }
        (None, _) => {
            tracing::debug!(call_ref = %event.call_ref, "webhook event for unknown call ref");
        }
    }

    match kind {
        Some(CarrierKind::A) => {
            let connect_on = matches!(event.kind, CarrierEventKind::Ringing | CarrierEventKind::Answered);
            if connect_on {
                if let Some(session) = session {
                    let ws_url = session.media_ws_url();
                    let body = manager.carrier().media_connect_directive(&ws_url);
                    return (StatusCode::OK, body).into_response();
                }
            }
            (StatusCode::OK, Vec::new()).into_response()
        }
        Some(CarrierKind::B) => {
            (StatusCode::OK, axum::Json(serde_json::json!({ "status": "ok" }))).into_response()
        }
        None => StatusCode::OK.into_response(),
    }
}

fn default_response(kind: Option<CarrierKind>) -> Response {
    match kind {
        Some(CarrierKind::B) => (StatusCode::OK, axum::Json(serde_json::json!({ "status": "ok" }))).into_response(),
        _ => (StatusCode::OK, Vec::<u8>::new()).into_response(),
    }
}

/// Verify the carrier-specific webhook signature headers spec.md §4.7
/// names: `X-Twilio-Signature` for carrier A, `Telnyx-Signature-Ed25519`
/// plus `Telnyx-Timestamp` for carrier B. Returns the 401 response to
/// short-circuit with on failure.
fn verify_webhook_signature(
    manager: &Arc<CallManager>,
    kind: Option<CarrierKind>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), Response> {
    let unauthorized = || (StatusCode::UNAUTHORIZED, "webhook signature verification failed").into_response();

    match kind {
        Some(CarrierKind::A) => {
            let signature = headers
                .get("X-Twilio-Signature")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(unauthorized)?;
            let auth_token = manager.config().carrier.auth_token.clone().unwrap_or_default();
            let url = format!("{}/twiml", manager.config().server.public_url.clone().unwrap_or_default());
            let form_fields: Vec<(String, String)> = url::form_urlencoded::parse(body).into_owned().collect();
            match crate::auth::verify_carrier_a(&auth_token, signature, &url, &form_fields) {
                Ok(true) => Ok(()),
                _ => Err(unauthorized()),
            }
        }
        Some(CarrierKind::B) => {
            let signature = headers
                .get("Telnyx-Signature-Ed25519")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(unauthorized)?;
            let timestamp = headers
                .get("Telnyx-Timestamp")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(unauthorized)?;
            let public_key = manager.config().carrier.public_key.clone().unwrap_or_default();
            let now = chrono::Utc::now().timestamp();
            match crate::auth::verify_carrier_b(&public_key, signature, timestamp, body, now) {
                Ok(true) => Ok(()),
                _ => Err(unauthorized()),
            }
        }
        None => Err(unauthorized()),
    }
}
