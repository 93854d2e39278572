//! Device authentication (spec.md §4.2 "Authentication"). A single
//! `X-Device-Token` header carries either a shared static token (dev mode) or
//! a per-device HMAC-SHA256 hex digest under a server-held secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time equality for comparing a provided token against a known
/// static one (the HMAC path below uses `Mac::verify_slice` instead, which
/// is constant-time over the decoded digest bytes).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

pub struct AuthConfig {
    pub device_token: Option<String>,
    pub device_token_secret: Option<String>,
}

/// When a secret is configured, the static token is an ignored fallback —
/// only the per-device HMAC is accepted. Otherwise, fall back to comparing
/// against the static token. With neither configured, nothing authenticates.
pub fn is_authorized(config: &AuthConfig, device: &str, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return false;
    };
    if let Some(secret) = &config.device_token_secret {
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(device.as_bytes());
        let Ok(provided) = hex::decode(token) else { return false };
        return mac.verify_slice(&provided).is_ok();
    }
    if let Some(static_token) = &config.device_token {
        return constant_time_eq(static_token.as_bytes(), token.as_bytes());
    }
    false
}
