//! HMAC-SHA256 request signing.
//!
//! The signature covers the string `"{unix_timestamp}.{payload}"` keyed with
//! the webhook secret and travels in the `X-Webhook-Signature` header as
//! `t=<unix_timestamp>,v1=<hex digest>`. Subscribers recompute the digest to
//! authenticate the request and reject stale timestamps to stop replays.
//!
//! # Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use courier_delivery::signing::{signature_header, verify_signature, DEFAULT_TOLERANCE};
//!
//! let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let body = br#"{"id":"1"}"#;
//! let header = signature_header("whsec_test", now.timestamp(), body).unwrap();
//!
//! assert!(verify_signature("whsec_test", &header, body, now, DEFAULT_TOLERANCE).is_ok());
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Default maximum age of a signed request accepted by `verify_signature`.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Signature generation and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The secret cannot key an HMAC.
    #[error("invalid secret key")]
    InvalidSecret,

    /// Header has no `t=` component.
    #[error("signature header missing timestamp")]
    MissingTimestamp,

    /// The `t=` component is not a unix timestamp.
    #[error("invalid signature timestamp: {0}")]
    InvalidTimestamp(String),

    /// Header has no `v1=` component.
    #[error("signature header missing v1 signature")]
    MissingSignature,

    /// Timestamp outside the accepted window.
    #[error("signature timestamp outside tolerance: {age_seconds}s")]
    StaleTimestamp {
        /// Distance between the signed timestamp and now
        age_seconds: i64,
    },

    /// No `v1` digest matches the payload.
    #[error("signature mismatch")]
    Mismatch,
}

/// Parsed `X-Webhook-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Signed unix timestamp.
    pub timestamp: i64,
    /// Hex digests from every `v1=` component.
    pub signatures: Vec<String>,
}

fn keyed_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Computes the hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret cannot key an HMAC.
pub fn compute_signature(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<String, SignatureError> {
    let mac = keyed_mac(secret, timestamp, payload)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Builds the `t=<timestamp>,v1=<hex>` header value.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret cannot key an HMAC.
pub fn signature_header(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<String, SignatureError> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={timestamp},v1={signature}"))
}

/// Parses a signature header.
///
/// Unknown components are ignored so newer schemes can be added alongside
/// `v1`.
///
/// # Errors
///
/// Returns an error if the timestamp or every `v1` component is missing.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                let parsed = value
                    .parse::<i64>()
                    .map_err(|_| SignatureError::InvalidTimestamp(value.to_string()))?;
                timestamp = Some(parsed);
            },
            "v1" => signatures.push(value.to_string()),
            _ => {},
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if signatures.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    Ok(ParsedSignature { timestamp, signatures })
}

/// Verifies a signed request the way a subscriber would.
///
/// The digest comparison is constant-time.
///
/// # Errors
///
/// Returns the reason verification failed.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let parsed = parse_signature_header(header)?;

    let age_seconds = now.timestamp() - parsed.timestamp;
    let tolerance_seconds = i64::try_from(tolerance.as_secs()).unwrap_or(i64::MAX);
    if age_seconds.abs() > tolerance_seconds {
        return Err(SignatureError::StaleTimestamp { age_seconds });
    }

    let matched = parsed.signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        keyed_mac(secret, parsed.timestamp, payload)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
