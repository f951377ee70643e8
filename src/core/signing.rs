//! Webhook signatures and short-lived internal bearer tokens. Both ride on
//! HMAC-SHA256 with constant-time verification; bearers are used for
//! agent-to-agent calls and never live longer than a minute.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::core::signal::now_epoch;
use crate::error::EngineError;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";
const BEARER_VERSION: &str = "v1";
const MAX_BEARER_TTL_SECS: i64 = 60;
const CLOCK_SKEW_SECS: i64 = 5;

/// Signature header value for an outbound webhook body: `sha256=<hex>`.
pub fn sign_webhook(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("{SIGNATURE_PREFIX}{}", hex_encode(&digest))
}

/// Verify an inbound webhook signature. Missing, malformed, or mismatched
/// headers all report false; the comparison itself is constant-time.
pub fn verify_webhook(body: &[u8], header: Option<&str>, secret: &str) -> bool {
    let header = match header {
        Some(h) => h,
        None => return false,
    };
    let hex = match header.strip_prefix(SIGNATURE_PREFIX) {
        Some(h) => h,
        None => return false,
    };
    let sig = match hex_decode(hex) {
        Some(s) => s,
        None => return false,
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BearerClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BearerError {
    #[error("bearer token expired")]
    Expired,
    #[error("bearer token audience mismatch")]
    BadAudience,
    #[error("bearer token signature invalid")]
    BadSignature,
}

impl From<BearerError> for EngineError {
    fn from(e: BearerError) -> Self {
        EngineError::Unauthorized(e.to_string())
    }
}

/// Mint a bearer for an internal call. TTL is clamped to 60 seconds.
pub fn issue_internal_bearer(key: &str, issuer: &str, audience: &str, ttl_secs: i64) -> String {
    let now = now_epoch();
    let claims = BearerClaims {
        iss: issuer.to_string(),
        aud: audience.to_string(),
        iat: now,
        nbf: now,
        exp: now + ttl_secs.clamp(1, MAX_BEARER_TTL_SECS),
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));
    let signing_input = format!("{BEARER_VERSION}.{payload}");
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("hmac accepts any key size");
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{sig}")
}

/// Verify a bearer and return its claims. Tolerates ±5s clock skew on the
/// time checks.
pub fn verify_internal_bearer(
    key: &str,
    token: &str,
    expected_audience: &str,
) -> Result<BearerClaims, BearerError> {
    let mut parts = token.split('.');
    let (version, payload, sig) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(v), Some(p), Some(s), None) => (v, p, s),
        _ => return Err(BearerError::BadSignature),
    };
    if version != BEARER_VERSION {
        return Err(BearerError::BadSignature);
    }
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| BearerError::BadSignature)?;
    let signing_input = format!("{version}.{payload}");
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("hmac accepts any key size");
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&sig_bytes)
        .map_err(|_| BearerError::BadSignature)?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| BearerError::BadSignature)?;
    let claims: BearerClaims =
        serde_json::from_slice(&claims_bytes).map_err(|_| BearerError::BadSignature)?;

    if claims.aud != expected_audience {
        return Err(BearerError::BadAudience);
    }
    let now = now_epoch();
    if now > claims.exp + CLOCK_SKEW_SECS {
        return Err(BearerError::Expired);
    }
    if now < claims.nbf - CLOCK_SKEW_SECS {
        return Err(BearerError::Expired);
    }
    Ok(claims)
}

/// Unique external id for idempotency keys, e.g. `task-1722598000-3fa9c1d2`.
pub fn generate_external_id(prefix: &str) -> String {
    let unique: [u8; 4] = rand::random();
    let suffix = hex_encode(&unique);
    if prefix.is_empty() {
        format!("{}-{}", now_epoch(), suffix)
    } else {
        format!("{prefix}-{}-{}", now_epoch(), suffix)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
