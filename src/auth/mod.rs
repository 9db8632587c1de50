//! Webhook authentication and per-call WebSocket tokens.
//!
//! Carrier A webhooks are signed with HMAC-SHA1 over the request URL and
//! sorted form fields; carrier B webhooks are signed with Ed25519 over
//! `timestamp || "|" || body`. WS tokens are single-use, 256-bit random,
//! compared in constant time — grounded on the teacher's
//! `server/auth.rs` secret-generation style, with `subtle` (as used by
//! the `sven-gateway` example crate) standing in for the constant-time
//! comparator the teacher's JWT library provided for free.

use crate::error::{AuthError, AuthErrorKind};
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Verify a carrier A webhook signature: HMAC-SHA1 under `auth_token`
/// over `url` concatenated with sorted `key||value` form fields,
/// base64-decoded and compared in constant time.
pub fn verify_carrier_a(
    auth_token: &str,
    signature_b64: &str,
    url: &str,
    form_fields: &[(String, String)],
) -> Result<bool, AuthError> {
    let mut sorted = form_fields.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut data = url.to_string();
    for (k, v) in &sorted {
        data.push_str(k);
        data.push_str(v);
    }

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .map_err(|_| AuthError::new(AuthErrorKind::BadSignature))?;
    mac.update(data.as_bytes());
    let expected = mac.finalize().into_bytes();

    let provided = STANDARD
        .decode(signature_b64)
        .map_err(|_| AuthError::new(AuthErrorKind::BadSignature))?;

    Ok(bool::from(expected.as_slice().ct_eq(&provided)))
}

/// Verify a carrier B webhook signature: Ed25519 over
/// `timestamp || "|" || raw_body`, rejecting a timestamp more than 5
/// minutes away from now.
pub fn verify_carrier_b(
    public_key_b64: &str,
    signature_b64: &str,
    timestamp: &str,
    raw_body: &[u8],
    now_unix: i64,
) -> Result<bool, AuthError> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AuthError::new(AuthErrorKind::StaleTimestamp))?;
    if (now_unix - ts).abs() > 300 {
        return Err(AuthError::new(AuthErrorKind::StaleTimestamp));
    }

    let key_bytes = STANDARD
        .decode(public_key_b64)
        .map_err(|_| AuthError::new(AuthErrorKind::BadSignature))?;
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| AuthError::new(AuthErrorKind::BadSignature))?;
    let verifying_key = VerifyingKey::from_bytes(&key_array)
        .map_err(|_| AuthError::new(AuthErrorKind::BadSignature))?;

    let sig_bytes = STANDARD
        .decode(signature_b64)
        .map_err(|_| AuthError::new(AuthErrorKind::BadSignature))?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| AuthError::new(AuthErrorKind::BadSignature))?;
    let signature = Signature::from_bytes(&sig_array);

    let mut message = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'|');
    message.extend_from_slice(raw_body);

    Ok(verifying_key.verify(&message, &signature).is_ok())
}

/// Mint a new per-call WebSocket token: 32 random bytes, URL-safe
/// base64, no padding.
pub fn new_ws_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time comparison of the expected and provided WS token.
/// Differing lengths short-circuit to `false` without a
/// variable-time compare of the bytes (the short-circuit itself
/// leaks only the length, never byte position, matching spec §2's
/// stated contract).
pub fn verify_ws_token(expected: &str, provided: &str) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn carrier_a_signature_round_trips() {
        let token = "auth-token-secret";
        let url = "https://example.com/twiml";
        let fields = vec![
            ("CallSid".to_string(), "CA123".to_string()),
            ("CallStatus".to_string(), "ringing".to_string()),
        ];

        let mut sorted = fields.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut data = url.to_string();
        for (k, v) in &sorted {
            data.push_str(k);
            data.push_str(v);
        }
        let mut mac = HmacSha1::new_from_slice(token.as_bytes()).unwrap();
        mac.update(data.as_bytes());
        let sig = STANDARD.encode(mac.finalize().into_bytes());

        assert!(verify_carrier_a(token, &sig, url, &fields).unwrap());
        assert!(!verify_carrier_a("wrong-token", &sig, url, &fields).unwrap());
    }

    #[test]
    fn carrier_b_signature_round_trips_and_rejects_stale_timestamp() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let verifying_key = signing_key.verifying_key();
        let pubkey_b64 = STANDARD.encode(verifying_key.to_bytes());

        let now = 1_700_000_000i64;
        let ts = now.to_string();
        let body = br#"{"data":{"event_type":"call.answered"}}"#;
        let mut message = Vec::new();
        message.extend_from_slice(ts.as_bytes());
        message.push(b'|');
        message.extend_from_slice(body);
        let sig = signing_key.sign(&message);
        let sig_b64 = STANDARD.encode(sig.to_bytes());

        assert!(verify_carrier_b(&pubkey_b64, &sig_b64, &ts, body, now).unwrap());
        assert!(verify_carrier_b(&pubkey_b64, &sig_b64, &ts, body, now + 301).is_err());
    }

    #[test]
    fn ws_token_is_url_safe_and_single_use_shape() {
        let token = new_ws_token();
        assert_eq!(token.len(), 43); // 32 bytes base64url no-pad
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains('='));
    }

    #[test]
    fn ws_token_verification_rejects_mismatched_and_different_length_tokens() {
        let a = new_ws_token();
        let b = new_ws_token();
        assert!(verify_ws_token(&a, &a));
        assert!(!verify_ws_token(&a, &b));
        assert!(!verify_ws_token(&a, "short"));
    }

    #[test]
    fn ws_token_verification_time_does_not_depend_on_mismatch_position() {
        // Statistical smoke test: compare timing for a mismatch at the
        // first byte vs. a mismatch at the last byte. `ct_eq` makes this
        // a non-issue; this asserts both return false quickly and
        // consistently rather than asserting on wall-clock variance
        // (timing assertions are inherently noisy in CI).
        let expected = "a".repeat(43);
        let mut first_byte_mismatch = expected.clone();
        first_byte_mismatch.replace_range(0..1, "b");
        let mut last_byte_mismatch = expected.clone();
        last_byte_mismatch.replace_range(42..43, "b");

        assert!(!verify_ws_token(&expected, &first_byte_mismatch));
        assert!(!verify_ws_token(&expected, &last_byte_mismatch));
    }
}
