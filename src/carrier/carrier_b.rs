//! Carrier B: JSON REST + JSON webhook events, Ed25519-signed. Always
//! responds `200 {"status":"ok"}` per spec §6 regardless of what the
//! event turns out to be — that response is produced by the manager,
//! not here; this module only parses.

use super::{CarrierClient, CarrierEvent, CarrierEventKind};
use crate::error::{CarrierError, CarrierErrorKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

pub struct CarrierB {
    api_key: String,
    client: reqwest::Client,
    api_base: String,
}

impl CarrierB {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            api_base: "https://api.carrier-b.example/v2".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    event_type: String,
    payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    call_control_id: String,
    #[serde(default)]
    result: Option<String>,
}

#[async_trait]
impl CarrierClient for CarrierB {
    async fn place_outbound(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> Result<String, CarrierError> {
        let url = format!("{}/calls", self.api_base);
        let body = json!({
            "to": to,
            "from": from,
            "webhook_url": webhook_url,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CarrierError::new(CarrierErrorKind::PlaceFailed, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CarrierError::new(
                CarrierErrorKind::PlaceFailed,
                format!("carrier B returned {}", resp.status()),
            ));
        }

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CarrierError::new(CarrierErrorKind::PlaceFailed, e.to_string()))?;
        parsed
            .pointer("/data/call_control_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CarrierError::new(CarrierErrorKind::PlaceFailed, "missing call_control_id")
            })
    }

    async fn start_media_stream(&self, carrier_call_ref: &str, ws_url: &str) -> Result<(), CarrierError> {
        let url = format!(
            "{}/calls/{}/actions/streaming_start",
            self.api_base, carrier_call_ref
        );
        let body = json!({ "stream_url": ws_url, "stream_track": "inbound_track" });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CarrierError::new(CarrierErrorKind::PlaceFailed, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CarrierError::new(
                CarrierErrorKind::PlaceFailed,
                format!("carrier B returned {}", resp.status()),
            ));
        }
        Ok(())
    }

    async fn hangup(&self, carrier_call_ref: &str) -> Result<(), CarrierError> {
        let url = format!(
            "{}/calls/{}/actions/hangup",
            self.api_base, carrier_call_ref
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| CarrierError::new(CarrierErrorKind::HangupFailed, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CarrierError::new(
                CarrierErrorKind::HangupFailed,
                format!("carrier B returned {}", resp.status()),
            ));
        }
        Ok(())
    }

    fn media_connect_directive(&self, _ws_url: &str) -> Vec<u8> {
        // Carrier B's media stream is started out-of-band via
        // `start_media_stream`; the webhook ack body carries no
        // directive payload.
        br#"{"status":"ok"}"#.to_vec()
    }

    fn parse_event(&self, _content_type: &str, raw_body: &[u8]) -> Result<CarrierEvent, CarrierError> {
        let envelope: WebhookEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| CarrierError::new(CarrierErrorKind::ParseFailed, e.to_string()))?;

        let kind = match envelope.data.event_type.as_str() {
            "call.initiated" => CarrierEventKind::OutboundPlaced,
            "call.answered" => CarrierEventKind::Answered,
            "call.hangup" => CarrierEventKind::HungUp,
            "streaming.started" => CarrierEventKind::StreamReady,
            "streaming.stopped" | "machine.detection.ended" => CarrierEventKind::Unknown,
            _ => CarrierEventKind::Unknown,
        };

        let payload = json!({
            "event_type": envelope.data.event_type,
            "result": envelope.data.payload.result,
        });

        Ok(CarrierEvent {
            call_ref: envelope.data.payload.call_control_id,
            kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_streaming_started_event() {
        let carrier = CarrierB::new("key".into());
        let body = br#"{"data":{"event_type":"streaming.started","payload":{"call_control_id":"cc_1"}}}"#;
        let event = carrier.parse_event("application/json", body).unwrap();
        assert_eq!(event.call_ref, "cc_1");
        assert_eq!(event.kind, CarrierEventKind::StreamReady);
    }

    #[test]
    fn parses_hangup_event() {
        let carrier = CarrierB::new("key".into());
        let body = br#"{"data":{"event_type":"call.hangup","payload":{"call_control_id":"cc_1","result":"completed"}}}"#;
        let event = carrier.parse_event("application/json", body).unwrap();
        assert_eq!(event.kind, CarrierEventKind::HungUp);
    }

    #[test]
    fn unrecognized_event_type_is_unknown_not_an_error() {
        let carrier = CarrierB::new("key".into());
        let body = br#"{"data":{"event_type":"call.bridged","payload":{"call_control_id":"cc_2"}}}"#;
        let event = carrier.parse_event("application/json", body).unwrap();
        assert_eq!(event.kind, CarrierEventKind::Unknown);
    }
}
