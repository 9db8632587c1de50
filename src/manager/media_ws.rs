//! Media WebSocket (`GET /media-stream?token=...`): the carrier's
//! bidirectional audio transport for one call. Grounded on the
//! teacher's `server/device.rs` WS-upgrade handler (token-in-query
//! validation, `ws.on_upgrade`, split sink/stream, reader loop until
//! close) — generalized from a JWT device identity to a single-use
//! per-call `wsToken`.

use super::CallManager;
use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct MediaStreamParams {
    token: Option<String>,
}

pub fn router() -> Router<Arc<CallManager>> {
    Router::new().route("/media-stream", get(upgrade_handler))
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<CallManager>>,
    Query(params): Query<MediaStreamParams>,
) -> Response {
    let session = match params.token.as_deref() {
        Some(token) => manager.take_by_ws_token(token).await,
        None => None,
    };

    let session = match session {
        Some(session) => session,
        None if manager.config().server.trust_without_signature => match manager.most_recent_session().await {
            Some(session) => {
                tracing::warn!(
                    call_id = %session.call_id,
                    "untokenized media-stream upgrade bound best-effort to most recently created session (trust_without_signature)"
                );
                session
            }
            None => return (StatusCode::UNAUTHORIZED, "no active session to bind to").into_response(),
        },
        None => return (StatusCode::UNAUTHORIZED, "invalid or already-used media stream token").into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let (sink, mut stream) = socket.split();
        session.attach_media_socket(sink).await;

        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(call_id = %session.call_id, error = %e, "media socket read error");
                    break;
                }
            };
            match message {
                WsMessage::Text(text) => handle_media_frame(&session, &text).await,
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        tracing::debug!(call_id = %session.call_id, "media socket reader loop ended, marking call hung up");
        session.on_carrier_hangup().await;
    })
}

async fn handle_media_frame(session: &Arc<crate::session::CallSession>, text: &str) {
    let frame: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "dropping unparsable media-stream frame");
            return;
        }
    };

    match frame.get("event").and_then(|v| v.as_str()) {
        Some("start") => {
            if let Some(stream_sid) = frame.pointer("/start/streamSid").and_then(|v| v.as_str()) {
                session.set_media_stream_id(stream_sid.to_string()).await;
            }
            session.set_stream_ready().await;
        }
        Some("media") => {
            let track = frame.pointer("/media/track").and_then(|v| v.as_str()).unwrap_or("inbound");
            if track == "inbound" || track == "inbound_track" {
                if let Some(payload_b64) = frame.pointer("/media/payload").and_then(|v| v.as_str()) {
                    match STANDARD.decode(payload_b64) {
                        Ok(mulaw) => session.handle_inbound_audio(&mulaw).await,
                        Err(e) => tracing::debug!(error = %e, "dropping unparsable media payload"),
                    }
                }
            }
        }
        Some("stop") => {
            tracing::debug!(call_id = %session.call_id, "carrier reported media stream stop");
        }
        _ => {
            tracing::debug!("dropping unrecognized media-stream frame");
        }
    }
}
