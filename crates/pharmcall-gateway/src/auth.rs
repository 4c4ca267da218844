//! Request authentication for the dispatcher callback, the voice webhook and
//! the admin routes.
//!
//! Every helper returns `Err(reason)` with a human-readable reason; handlers
//! turn that into a 401.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the callback body. Used by relays
/// we control; QStash deliveries authenticate with the forwarded bearer.
pub const SIGNATURE_HEADER: &str = "x-pharmcall-signature";

/// Shared secret header sent by the voice provider.
pub const VOICE_SECRET_HEADER: &str = "x-vapi-secret";

/// Verify `x-pharmcall-signature: <hex>` (optionally `sha256=<hex>`) against `body`.
pub fn verify_hmac_sha256(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), String> {
    let sig_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing x-pharmcall-signature header".to_string())?;

    let sig_hex = sig_header.strip_prefix("sha256=").unwrap_or(sig_header);
    let expected =
        hex::decode(sig_hex).map_err(|_| "x-pharmcall-signature is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

/// Verify a static bearer token in the `Authorization: Bearer <token>` header.
pub fn verify_bearer_token(headers: &HeaderMap, expected: &str) -> Result<(), String> {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    if token == expected {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}

/// Authenticate a dispatcher delivery.
///
/// A signed body is checked against `signing_secret`; otherwise a bearer
/// token must match `bearer`. With neither configured the callback is open,
/// which only makes sense behind the local dispatcher.
pub fn verify_dispatch(
    headers: &HeaderMap,
    body: &[u8],
    signing_secret: Option<&str>,
    bearer: Option<&str>,
) -> Result<(), String> {
    match (signing_secret, bearer) {
        (None, None) => Ok(()),
        (Some(secret), _) if headers.contains_key(SIGNATURE_HEADER) => {
            verify_hmac_sha256(headers, body, secret)
        }
        (_, Some(token)) => verify_bearer_token(headers, token),
        (Some(secret), None) => verify_hmac_sha256(headers, body, secret),
    }
}

/// Check the voice webhook's shared secret header, when one is configured.
pub fn verify_voice_secret(headers: &HeaderMap, secret: Option<&str>) -> Result<(), String> {
    let Some(expected) = secret else {
        return Ok(());
    };
    let got = headers
        .get(VOICE_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing x-vapi-secret header".to_string())?;
    if got == expected {
        Ok(())
    } else {
        Err("webhook secret mismatch".to_string())
    }
}

/// Hex HMAC-SHA256 of `body`, as a sender would put in [`SIGNATURE_HEADER`].
#[cfg(test)]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
