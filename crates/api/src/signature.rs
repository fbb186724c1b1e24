//! Webhook signature verification.
//!
//! All schemes are HMAC-SHA256 compared in constant time. Timestamps are
//! only looked at once the signature has verified, so an unauthenticated
//! caller learns nothing about the replay window.

use std::time::Duration;

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::{GatewayConfig, SignatureScheme};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the messaging provider's body signature.
pub const HUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Optional header carrying the messaging provider's send time.
pub const WEBHOOK_TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("invalid signature")]
    Invalid,
    #[error("timestamp outside the accepted window")]
    Stale,
}

/// Hex HMAC-SHA256 of `parts` concatenated, keyed by `secret`.
pub fn sign(secret: &str, parts: &[&[u8]]) -> String {
    mac(secret, parts)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

fn mac(secret: &str, parts: &[&[u8]]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Invalid)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

fn verify_hex(secret: &str, parts: &[&[u8]], signature_hex: &str) -> Result<(), SignatureError> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| SignatureError::Malformed)?;
    mac(secret, parts)?
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Invalid)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Checks `timestamp` (unix seconds) is within `window` of `now`.
pub fn check_timestamp(timestamp: &str, now: i64, window: Duration) -> Result<(), SignatureError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::Malformed)?;
    if now.abs_diff(ts) > window.as_secs() {
        return Err(SignatureError::Stale);
    }
    Ok(())
}

/// Verifies a messaging provider delivery: `X-Hub-Signature-256: sha256=<hex>`
/// over the raw body, then the optional `X-Webhook-Timestamp`.
pub fn verify_messaging(
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
    window: Duration,
) -> Result<(), SignatureError> {
    let signature = header(headers, HUB_SIGNATURE_HEADER).ok_or(SignatureError::Missing)?;
    let hex = signature
        .strip_prefix("sha256=")
        .ok_or(SignatureError::Malformed)?;
    verify_hex(secret, &[body], hex)?;

    if let Some(timestamp) = header(headers, WEBHOOK_TIMESTAMP_HEADER) {
        check_timestamp(timestamp, now, window)?;
    }
    Ok(())
}

/// Verifies a payment gateway delivery according to its scheme.
pub fn verify_payment(
    gateway: &GatewayConfig,
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
    window: Duration,
) -> Result<(), SignatureError> {
    let signature =
        header(headers, &gateway.signature_header()).ok_or(SignatureError::Missing)?;

    match gateway.scheme {
        SignatureScheme::TimestampedHeaders => {
            let timestamp =
                header(headers, &gateway.timestamp_header()).ok_or(SignatureError::Missing)?;
            let hex = signature.strip_prefix("sha256=").unwrap_or(signature);
            verify_hex(
                &gateway.secret,
                &[timestamp.as_bytes(), b".", body],
                hex,
            )?;
            check_timestamp(timestamp, now, window)
        }
        SignatureScheme::SignedPayload => {
            let (timestamp, candidates) = parse_signed_payload(signature)?;
            // Gateways send several v1 entries while rotating secrets.
            let verified = candidates.iter().any(|candidate| {
                verify_hex(
                    &gateway.secret,
                    &[timestamp.as_bytes(), b".", body],
                    candidate,
                )
                .is_ok()
            });
            if !verified {
                return Err(SignatureError::Invalid);
            }
            check_timestamp(timestamp, now, window)
        }
    }
}

/// Splits `t=<ts>,v1=<hex>[,v1=<hex>...]`.
fn parse_signed_payload(header: &str) -> Result<(&str, Vec<&str>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for item in header.split(',') {
        match item.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    match timestamp {
        Some(t) if !signatures.is_empty() => Ok((t, signatures)),
        _ => Err(SignatureError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const NOW: i64 = 1_700_000_000;
    const WINDOW: Duration = Duration::from_secs(300);

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn messaging_signature_round_trip() {
        let body: &[u8] = br#"{"entry":[]}"#;
        let sig = format!("sha256={}", sign("app-secret", &[body]));
        let h = headers(&[(HUB_SIGNATURE_HEADER, sig)]);
        assert_eq!(verify_messaging("app-secret", &h, body, NOW, WINDOW), Ok(()));
        assert_eq!(
            verify_messaging("other", &h, body, NOW, WINDOW),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn messaging_rejects_missing_or_malformed() {
        let body: &[u8] = b"{}";
        assert_eq!(
            verify_messaging("s", &HeaderMap::new(), body, NOW, WINDOW),
            Err(SignatureError::Missing)
        );
        let h = headers(&[(HUB_SIGNATURE_HEADER, sign("s", &[body]))]);
        assert_eq!(
            verify_messaging("s", &h, body, NOW, WINDOW),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn stale_timestamp_checked_after_signature() {
        let body: &[u8] = b"{}";
        let stale = (NOW - 301).to_string();
        let good = headers(&[
            (HUB_SIGNATURE_HEADER, format!("sha256={}", sign("s", &[body]))),
            (WEBHOOK_TIMESTAMP_HEADER, stale.clone()),
        ]);
        assert_eq!(
            verify_messaging("s", &good, body, NOW, WINDOW),
            Err(SignatureError::Stale)
        );

        let forged = headers(&[
            (HUB_SIGNATURE_HEADER, format!("sha256={}", sign("x", &[body]))),
            (WEBHOOK_TIMESTAMP_HEADER, stale),
        ]);
        assert_eq!(
            verify_messaging("s", &forged, body, NOW, WINDOW),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn timestamp_window_is_inclusive() {
        assert_eq!(check_timestamp(&(NOW + 300).to_string(), NOW, WINDOW), Ok(()));
        assert_eq!(check_timestamp(&(NOW - 300).to_string(), NOW, WINDOW), Ok(()));
        assert_eq!(
            check_timestamp("yesterday", NOW, WINDOW),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn timestamped_headers_scheme() {
        let gateway: GatewayConfig = "adyen:timestamped_headers:k".parse().unwrap();
        let body: &[u8] = br#"{"type":"payment.succeeded"}"#;
        let ts = NOW.to_string();
        let sig = sign("k", &[ts.as_bytes(), b".", body]);

        let h = headers(&[("adyen-signature", sig.clone()), ("adyen-timestamp", ts)]);
        assert_eq!(verify_payment(&gateway, &h, body, NOW, WINDOW), Ok(()));

        let no_ts = headers(&[("adyen-signature", sig)]);
        assert_eq!(
            verify_payment(&gateway, &no_ts, body, NOW, WINDOW),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn signed_payload_scheme_accepts_any_v1() {
        let gateway: GatewayConfig = "stripe:signed_payload:whsec".parse().unwrap();
        let body: &[u8] = br#"{"id":"evt_1"}"#;
        let good = sign("whsec", &[NOW.to_string().as_bytes(), b".", body]);
        let header_value = format!("t={NOW},v1={},v1={good}", "00".repeat(32));

        let h = headers(&[("stripe-signature", header_value)]);
        assert_eq!(verify_payment(&gateway, &h, body, NOW, WINDOW), Ok(()));

        let tampered = headers(&[("stripe-signature", format!("t={},v1={good}", NOW + 1))]);
        assert_eq!(
            verify_payment(&gateway, &tampered, body, NOW, WINDOW),
            Err(SignatureError::Invalid)
        );

        let malformed = headers(&[("stripe-signature", "v1=abcd".to_string())]);
        assert_eq!(
            verify_payment(&gateway, &malformed, body, NOW, WINDOW),
            Err(SignatureError::Malformed)
        );
    }
}
