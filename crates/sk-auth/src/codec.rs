//! Reads claims out of signed token strings.
//!
//! Signatures are not verified here; the identity service and providers do
//! that. The client only needs `exp` to schedule refreshes and `iss`/`sub`
//! to attribute tokens.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;

use crate::errors::DecodeError;

/// Expiry assigned to tokens that cannot be decoded
pub const EXPIRED: i64 = i64::MIN;

/// Subset of the registered JWT claims the client cares about
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub exp: Option<serde_json::Number>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

impl Claims {
    /// `exp` as whole seconds since the epoch
    pub fn expires_at(&self) -> Option<i64> {
        let exp = self.exp.as_ref()?;
        exp.as_i64().or_else(|| exp.as_f64().map(|f| f.floor() as i64))
    }
}

/// Decode the payload segment of a `header.payload.signature` token
pub fn decode_claims(token: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::SegmentCount(segments.len()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    serde_json::from_slice(&payload).map_err(|e| DecodeError::Claims(e.to_string()))
}

pub fn decode_expiry(token: &str) -> Result<i64, DecodeError> {
    decode_claims(token)?
        .expires_at()
        .ok_or(DecodeError::MissingExpiry)
}

/// Expiry of `token`, or [`EXPIRED`] if it cannot be decoded
pub fn expires_at(token: &str) -> i64 {
    match decode_expiry(token) {
        Ok(exp) => exp,
        Err(e) => {
            tracing::debug!("Treating undecodable token as expired: {}", e);
            EXPIRED
        }
    }
}

/// `exp - buffer <= now`, with undecodable tokens always expired
pub fn is_expired(token: &str, now: i64, buffer: Duration) -> bool {
    let exp = expires_at(token);
    if exp == EXPIRED {
        return true;
    }
    exp.saturating_sub(buffer.as_secs() as i64) <= now
}

/// `iss` claim, used to attribute bulk-fetched provider tokens
pub fn issuer(token: &str) -> Option<String> {
    decode_claims(token).ok()?.iss.filter(|iss| !iss.is_empty())
}

pub fn subject(token: &str) -> Option<String> {
    decode_claims(token).ok()?.sub.filter(|sub| !sub.is_empty())
}

/// Build an unsigned token carrying the given claims.
///
/// Only useful for tests and local fixtures; nothing accepts these upstream.
pub fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with_exp(exp: i64) -> String {
        encode_unsigned(&json!({ "exp": exp }))
    }

    #[test]
    fn test_expiry_boundary() {
        let token = token_with_exp(1000);
        let buffer = Duration::from_secs(300);
        assert!(!is_expired(&token, 699, buffer));
        assert!(is_expired(&token, 700, buffer));
        assert!(is_expired(&token, 701, buffer));
    }

    #[test]
    fn test_expiry_matches_formula() {
        let buffer = Duration::from_secs(300);
        for exp in [0_i64, 299, 300, 1000, 1_700_000_000] {
            let token = token_with_exp(exp);
            for now in [exp - 301, exp - 300, exp - 299, exp, exp + 1] {
                assert_eq!(is_expired(&token, now, buffer), exp - 300 <= now);
            }
        }
    }

    #[test]
    fn test_undecodable_is_always_expired() {
        let buffer = Duration::from_secs(0);
        for garbage in ["", "abc", "a.b", "a.!!!.c", "a.bm90IGpzb24.c"] {
            assert_eq!(expires_at(garbage), EXPIRED);
            assert!(is_expired(garbage, i64::MIN + 1, buffer));
        }
    }

    #[test]
    fn test_missing_exp_is_expired() {
        let token = encode_unsigned(&json!({ "sub": "user-1" }));
        assert_eq!(decode_expiry(&token), Err(DecodeError::MissingExpiry));
        assert!(is_expired(&token, 0, Duration::ZERO));
    }

    #[test]
    fn test_fractional_exp_is_floored() {
        let token = encode_unsigned(&json!({ "exp": 1000.75 }));
        assert_eq!(decode_expiry(&token), Ok(1000));
    }

    #[test]
    fn test_issuer_and_subject() {
        let token = encode_unsigned(&json!({ "exp": 1, "iss": "inkwell", "sub": "u-9" }));
        assert_eq!(issuer(&token).as_deref(), Some("inkwell"));
        assert_eq!(subject(&token).as_deref(), Some("u-9"));
        assert_eq!(issuer("not-a-token"), None);
    }

    #[test]
    fn test_padded_payload_decodes() {
        let token = token_with_exp(42);
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[1].push_str("==");
        assert_eq!(decode_expiry(&parts.join(".")), Ok(42));
    }
}
