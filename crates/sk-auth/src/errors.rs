use std::sync::Arc;

use thiserror::Error;

use crate::token::TokenKind;

/// Credential core error types.
///
/// Cloneable so one refresh outcome can be handed to every caller that
/// waited on it; foreign sources are held behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum SkAuthError {
    #[error("Network error: {0}")]
    Network(#[source] Arc<reqwest::Error>),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("invalid_grant - refresh token was rejected by the token endpoint")]
    InvalidGrant,

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[source] Arc<serde_json::Error>),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Secure store is corrupted or was encrypted with another key")]
    CorruptedStore,

    #[error("Timed out waiting for the storage lock")]
    LockTimeout,

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("No passphrase was provided for the secure store")]
    UserCancelled,

    #[error("Storage backend unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Missing or expired {0} token - cannot refresh")]
    MissingRefreshToken(TokenKind),

    #[error("No valid session access token is available")]
    SessionUnavailable,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Token decoding failures.
///
/// These never leave [`crate::codec::expires_at`]: a token that cannot be
/// decoded is classified as expired.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected 3 dot-separated segments, found {0}")]
    SegmentCount(usize),

    #[error("payload is not valid base64url: {0}")]
    Base64(String),

    #[error("payload is not a JSON claims object: {0}")]
    Claims(String),

    #[error("token has no numeric exp claim")]
    MissingExpiry,
}

impl From<reqwest::Error> for SkAuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(Arc::new(e))
    }
}

impl From<serde_json::Error> for SkAuthError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(Arc::new(e))
    }
}

impl From<std::io::Error> for SkAuthError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, SkAuthError>;
