//! Carrier A: form-urlencoded REST + TwiML-shaped connect directive,
//! the historical "/twiml" path name spec §4.7 says to retain for
//! compatibility. Grounded on the `other_examples` Twilio client shape
//! (`main.rs.rs`'s `TwilioClient::place_call`) for the REST call, and
//! on `twilio-media.rs.rs`'s form-field event vocabulary for parsing.

use super::{CarrierClient, CarrierEvent, CarrierEventKind};
use crate::error::{CarrierError, CarrierErrorKind};
use async_trait::async_trait;
use serde_json::json;

pub struct CarrierA {
    account_sid: String,
    auth_token: String,
    client: reqwest::Client,
    api_base: String,
}

impl CarrierA {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self {
            account_sid,
            auth_token,
            client: reqwest::Client::new(),
            api_base: "https://api.carrier-a.example/2010-04-01".to_string(),
        }
    }
}

#[async_trait]
impl CarrierClient for CarrierA {
    async fn place_outbound(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> Result<String, CarrierError> {
        let url = format!(
            "{}/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        );
        let params = [("To", to), ("From", from), ("Url", webhook_url)];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| CarrierError::new(CarrierErrorKind::PlaceFailed, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CarrierError::new(
                CarrierErrorKind::PlaceFailed,
                format!("carrier A returned {}", resp.status()),
            ));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CarrierError::new(CarrierErrorKind::PlaceFailed, e.to_string()))?;
        body.get("sid")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CarrierError::new(CarrierErrorKind::PlaceFailed, "missing sid in response")
            })
    }

    async fn start_media_stream(&self, _carrier_call_ref: &str, _ws_url: &str) -> Result<(), CarrierError> {
        // Carrier A starts the media stream from the connect directive
        // served in the webhook response; nothing to do here.
        Ok(())
    }

    async fn hangup(&self, carrier_call_ref: &str) -> Result<(), CarrierError> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.api_base, self.account_sid, carrier_call_ref
        );
        let params = [("Status", "completed")];
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| CarrierError::new(CarrierErrorKind::HangupFailed, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CarrierError::new(
                CarrierErrorKind::HangupFailed,
                format!("carrier A returned {}", resp.status()),
            ));
        }
        Ok(())
    }

    fn media_connect_directive(&self, ws_url: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{ws_url}" track="inbound_track"/></Connect></Response>"#
        )
        .into_bytes()
    }

    fn parse_event(&self, _content_type: &str, raw_body: &[u8]) -> Result<CarrierEvent, CarrierError> {
        let form: Vec<(String, String)> = url::form_urlencoded::parse(raw_body)
            .into_owned()
            .collect();

        let call_sid = form
            .iter()
            .find(|(k, _)| k == "CallSid")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| CarrierError::new(CarrierErrorKind::ParseFailed, "missing CallSid"))?;

        let status = form
            .iter()
            .find(|(k, _)| k == "CallStatus")
            .map(|(_, v)| v.as_str())
            .unwrap_or("");

        let kind = match status {
            "queued" => CarrierEventKind::OutboundPlaced,
            "ringing" => CarrierEventKind::Ringing,
            "in-progress" => CarrierEventKind::Answered,
            "completed" | "busy" | "no-answer" | "failed" => CarrierEventKind::HungUp,
            _ => CarrierEventKind::Unknown,
        };

        let payload = json!(form.into_iter().collect::<std::collections::HashMap<_, _>>());

        Ok(CarrierEvent {
            call_ref: call_sid,
            kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ringing_status_from_form_body() {
        let carrier = CarrierA::new("AC123".into(), "secret".into());
        let body = b"CallSid=CA999&CallStatus=ringing&From=%2B15551230000";
        let event = carrier.parse_event("application/x-www-form-urlencoded", body).unwrap();
        assert_eq!(event.call_ref, "CA999");
        assert_eq!(event.kind, CarrierEventKind::Ringing);
    }

    #[test]
    fn parses_completed_as_hung_up() {
        let carrier = CarrierA::new("AC123".into(), "secret".into());
        let body = b"CallSid=CA999&CallStatus=completed";
        let event = carrier.parse_event("application/x-www-form-urlencoded", body).unwrap();
        assert_eq!(event.kind, CarrierEventKind::HungUp);
    }

    #[test]
    fn connect_directive_embeds_ws_url() {
        let carrier = CarrierA::new("AC123".into(), "secret".into());
        let body = carrier.media_connect_directive("wss://example.com/media-stream?token=abc");
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("wss://example.com/media-stream?token=abc"));
    }
}
